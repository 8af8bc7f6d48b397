//! Locations: shared contexts (lobbies, games, the admin room) that own a
//! set of sessions and route their requests.
//!
//! A concrete location embeds a [`LocationCore`] and implements
//! [`Location`]. Every location is registered in the server's
//! [`LocationRegistry`]; a non-persistent one (a game) is unlinked when its
//! last member leaves.
//!
//! ```text
//!   Session ──weak──▶ Location ──core──▶ members: [Arc<Session>]
//!                        ▲
//!   LocationRegistry ────┘ (strong, until unlinked)
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::game::GameError;
use super::proposal::ProposalError;
use super::session::{Session, SessionId};

/// Location identifier, unique within a registry.
pub type LocationId = u64;

/// Errors raised while a location handles a request.
#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("You must be admin to do this.")]
    Privilege,

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Game(#[from] GameError),
}

impl LocationError {
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::BadRequest(_) => true,
            Self::Game(e) => e.is_protocol_violation(),
            Self::Privilege | Self::Proposal(_) => false,
        }
    }
}

/// Construction flags for a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationOptions {
    /// Members get chat enabled on join (disabled otherwise)
    pub has_chat: bool,

    /// Stays registered when empty
    pub persistent: bool,

    /// Chat lines starting with `cheat: ` go to [`Location::cheat`]
    pub cheats_enabled: bool,
}

impl Default for LocationOptions {
    fn default() -> Self {
        Self {
            has_chat: true,
            persistent: false,
            cheats_enabled: false,
        }
    }
}

/// Membership and broadcasting shared by every location.
#[derive(Debug)]
pub struct LocationCore {
    id: LocationId,
    options: LocationOptions,
    members: Mutex<Vec<Arc<Session>>>,
    registry: Weak<LocationRegistry>,
}

impl LocationCore {
    pub fn new(registry: &Arc<LocationRegistry>, options: LocationOptions) -> Self {
        Self {
            id: registry.allocate_id(),
            options,
            members: Mutex::new(Vec::new()),
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> LocationId {
        self.id
    }

    pub fn has_chat(&self) -> bool {
        self.options.has_chat
    }

    pub fn is_persistent(&self) -> bool {
        self.options.persistent
    }

    pub fn cheats_enabled(&self) -> bool {
        self.options.cheats_enabled
    }

    /// The registry this location belongs to.
    pub fn registry(&self) -> Option<Arc<LocationRegistry>> {
        self.registry.upgrade()
    }

    /// Snapshot of the members in join order.
    pub fn members(&self) -> Vec<Arc<Session>> {
        self.members.lock().clone()
    }

    pub fn member(&self, id: SessionId) -> Option<Arc<Session>> {
        self.members.lock().iter().find(|s| s.id() == id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.lock().iter().any(|s| s.id() == id)
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Add a session and switch its chat on or off.
    pub fn add_member(&self, session: &Arc<Session>) {
        {
            let mut members = self.members.lock();
            if !members.iter().any(|s| s.id() == session.id()) {
                members.push(Arc::clone(session));
            }
        }
        if self.options.has_chat {
            session.enable_chat();
        } else {
            session.disable_chat();
        }
    }

    /// Remove a session and drop its permanent messages.
    ///
    /// A non-persistent location unlinks itself once empty.
    pub fn remove_member(&self, session: &Arc<Session>) {
        let now_empty = {
            let mut members = self.members.lock();
            members.retain(|s| s.id() != session.id());
            members.is_empty()
        };
        session.remove_permanent(None);

        if now_empty && !self.options.persistent {
            if let Some(registry) = self.registry.upgrade() {
                registry.unlink(self.id);
            }
        }
    }

    /// Send `message` to every member.
    pub fn broadcast(&self, message: &Value) {
        for session in self.members() {
            session.send(message.clone());
        }
    }

    /// Send `message` to every member except `except`.
    pub fn broadcast_except(&self, message: &Value, except: SessionId) {
        for session in self.members().into_iter().filter(|s| s.id() != except) {
            session.send(message.clone());
        }
    }

    /// Send a chat line from `sender` to every member.
    pub fn broadcast_chat(&self, sender: &Session, text: &str) {
        let message = json!({
            "command": "chat.message",
            "sender": sender.name(),
            "sender_id": sender.id(),
            "message": text,
            "time": timestamp(),
        });
        for session in self.members() {
            session.send_chat_message(message.clone());
        }
    }

    /// Send a system line to every member's chat.
    pub fn system_message(&self, text: &str) {
        let message = json!({
            "command": "chat.system_message",
            "message": text,
            "level": "WARN",
            "time": timestamp(),
        });
        for session in self.members() {
            session.send_chat_message(message.clone());
        }
    }
}

fn timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A place sessions can be in.
///
/// Implementors provide [`core`](Location::core) and
/// [`kind`](Location::kind); everything else has a default built on the
/// core. Overrides of `join`/`leave` call the core's
/// [`add_member`](LocationCore::add_member)/[`remove_member`](LocationCore::remove_member)
/// themselves.
pub trait Location: Send + Sync {
    fn core(&self) -> &LocationCore;

    /// Short kind name, e.g. `"lobby"` or `"game"`.
    fn kind(&self) -> &'static str;

    fn id(&self) -> LocationId {
        self.core().id()
    }

    /// Summary shown in the admin overview.
    fn describe(&self) -> Value {
        let members: Vec<Value> = self.core().members().iter().map(|s| s.to_json()).collect();
        json!({
            "id": self.id(),
            "kind": self.kind(),
            "members": members,
        })
    }

    fn join(&self, session: &Arc<Session>) {
        self.core().add_member(session);
        self.send_init(session);
    }

    fn leave(&self, session: &Arc<Session>) {
        self.core().remove_member(session);
    }

    /// Send everything a freshly loaded page needs.
    fn send_init(&self, _session: &Arc<Session>) {}

    fn handle_reconnect(&self, session: &Arc<Session>) {
        self.send_init(session);
    }

    /// Handle a request; `Ok(false)` means the command is not ours.
    fn handle_request(
        &self,
        session: &Arc<Session>,
        command: &str,
        data: &Value,
    ) -> Result<bool, LocationError> {
        handle_base_request(self, session, command, data)
    }

    /// A `cheat: ` chat line, when cheats are enabled.
    fn cheat(&self, _session: &Arc<Session>, _command: &str) -> Result<(), LocationError> {
        Ok(())
    }

    fn system_message(&self, text: &str) {
        self.core().system_message(text);
    }
}

/// Requests every location understands: currently the chat.
pub fn handle_base_request<L: Location + ?Sized>(
    location: &L,
    session: &Arc<Session>,
    command: &str,
    data: &Value,
) -> Result<bool, LocationError> {
    match command {
        "chat.message" => {
            let text = data
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| LocationError::BadRequest("chat message without text".to_string()))?;

            if location.core().cheats_enabled() {
                if let Some(cheat) = text.strip_prefix("cheat: ") {
                    tracing::info!(session = session.id(), cheat, "cheat command");
                    location.cheat(session, cheat)?;
                    return Ok(true);
                }
            }
            location.core().broadcast_chat(session, text);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Every location of a server.
#[derive(Default)]
pub struct LocationRegistry {
    next_id: AtomicU64,
    locations: Mutex<BTreeMap<LocationId, Arc<dyn Location>>>,
}

impl std::fmt::Debug for LocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationRegistry")
            .field("locations", &self.locations.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate_id(&self) -> LocationId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, location: Arc<dyn Location>) {
        tracing::debug!(location = location.id(), kind = location.kind(), "register location");
        self.locations.lock().insert(location.id(), location);
    }

    /// Drop a location from the registry.
    pub fn unlink(&self, id: LocationId) -> Option<Arc<dyn Location>> {
        let removed = self.locations.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(location = id, "unlink location");
        }
        removed
    }

    pub fn get(&self, id: LocationId) -> Option<Arc<dyn Location>> {
        self.locations.lock().get(&id).cloned()
    }

    /// Every registered location, oldest first.
    pub fn all(&self) -> Vec<Arc<dyn Location>> {
        self.locations.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.locations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.lock().is_empty()
    }
}
