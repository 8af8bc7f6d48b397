//! Sessions: one logged-in participant and its channel to the browser.
//!
//! A session owns its outbound [`MessageQueue`], its [`InteractionRegistry`]
//! and the list of permanent messages replayed on every reconnect. It points
//! weakly at the [`Location`] that currently contains it.
//!
//! Every inbound transport call carries the session's epoch. A reconnect
//! bumps the epoch, so calls from a superseded browser tab are rejected with
//! [`SessionError::StaleEpoch`] instead of being processed.
//!
//! Locking rule: the internal mutex is never held while calling into a
//! location or any other session.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::connection::{MessageQueue, PollHandle};
use super::interaction::{CancelReason, InteractionRegistry, QueryHandle, QueryId};
use super::location::{Location, LocationError};

/// Session identifier, unique for the lifetime of a server.
pub type SessionId = u64;

/// Reconnect counter of a session.
pub type Epoch = u64;

/// Chat messages kept for replay when nothing else is configured.
pub const DEFAULT_CHAT_HISTORY: usize = 10;

/// Name validation errors, surfaced to the login form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("The name is empty.")]
    Empty,

    #[error("There is already a player with this name.")]
    Duplicate(String),
}

/// Errors from handling an inbound transport call.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Stale connection (epoch {got}, current epoch is {current}).")]
    StaleEpoch { current: Epoch, got: Epoch },

    #[error("Invalid query id {0}.")]
    InvalidQueryId(QueryId),

    #[error("Response without a valid query id.")]
    MalformedResponse,

    #[error("Request without a command.")]
    MissingCommand,

    #[error("Unhandled request '{0}'.")]
    Unhandled(String),

    #[error("The session is not in any location.")]
    NoLocation,

    #[error(transparent)]
    Location(#[from] LocationError),
}

impl SessionError {
    /// Whether the client broke the protocol (as opposed to a server-side
    /// failure while handling a well-formed call).
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::StaleEpoch { .. }
            | Self::InvalidQueryId(_)
            | Self::MalformedResponse
            | Self::MissingCommand
            | Self::Unhandled(_) => true,
            Self::Location(e) => e.is_protocol_violation(),
            Self::NoLocation => false,
        }
    }
}

/// A message re-sent on every reconnect until its group is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct PermanentMessage {
    pub group: String,
    pub message: Value,
}

/// Per-session settings taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub chat_history_len: usize,
    pub devtest: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            chat_history_len: DEFAULT_CHAT_HISTORY,
            devtest: false,
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    epoch: Epoch,
    last_activity: DateTime<Utc>,
    outbox: MessageQueue,
    interactions: InteractionRegistry,
    permanent: Vec<PermanentMessage>,
    chat_enabled: bool,
    chat_history: VecDeque<Value>,
    location: Option<Weak<dyn Location>>,
    closed: bool,
}

/// A logged-in participant.
pub struct Session {
    id: SessionId,
    name: String,
    is_admin: bool,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_admin", &self.is_admin)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Session {
    pub fn new(id: SessionId, name: impl Into<String>, is_admin: bool) -> Self {
        Self::with_options(id, name, is_admin, SessionOptions::default())
    }

    pub fn with_options(
        id: SessionId,
        name: impl Into<String>,
        is_admin: bool,
        options: SessionOptions,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            is_admin,
            options,
            inner: Mutex::new(SessionInner {
                epoch: 0,
                last_activity: Utc::now(),
                outbox: MessageQueue::new(),
                interactions: InteractionRegistry::new(),
                permanent: Vec::new(),
                chat_enabled: true,
                chat_history: VecDeque::with_capacity(options.chat_history_len),
                location: None,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn epoch(&self) -> Epoch {
        self.inner.lock().epoch
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.lock().last_activity
    }

    /// Whether the session has quit.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Utc::now();
    }

    /// Convert to JSON for admin views.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "admin": self.is_admin,
            "last_activity": self.last_activity(),
        })
    }

    /// Reject calls carrying an epoch other than the current one.
    pub fn check_epoch(&self, epoch: Epoch) -> Result<(), SessionError> {
        let current = self.epoch();
        if epoch != current {
            tracing::warn!(session = self.id, current, got = epoch, "stale epoch");
            return Err(SessionError::StaleEpoch { current, got: epoch });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound messages
    // ------------------------------------------------------------------

    /// Queue a message for the client.
    pub fn send(&self, message: Value) {
        tracing::debug!(session = self.id, %message, "send");
        self.inner.lock().outbox.put(message);
    }

    /// Queue a message and keep it for replay on reconnect.
    pub fn send_permanent(&self, group: &str, message: Value) {
        tracing::debug!(session = self.id, group, %message, "send permanent");
        let mut inner = self.inner.lock();
        inner.permanent.push(PermanentMessage {
            group: group.to_string(),
            message: message.clone(),
        });
        inner.outbox.put(message);
    }

    /// Forget permanent messages of `group`, or all of them with `None`.
    ///
    /// Messages already sent are not retracted.
    pub fn remove_permanent(&self, group: Option<&str>) {
        let mut inner = self.inner.lock();
        match group {
            Some(group) => inner.permanent.retain(|p| p.group != group),
            None => inner.permanent.clear(),
        }
    }

    pub fn permanent_messages(&self) -> Vec<PermanentMessage> {
        self.inner.lock().permanent.clone()
    }

    /// Remove and return every buffered message.
    pub fn take_messages(&self) -> Vec<Value> {
        self.inner.lock().outbox.get_all()
    }

    /// Park a long-poll for this session.
    pub fn wait_for_messages(&self, epoch: Epoch) -> Result<PollHandle, SessionError> {
        self.check_epoch(epoch)?;
        let mut inner = self.inner.lock();
        inner.last_activity = Utc::now();
        Ok(inner.outbox.wait_for_messages())
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Record a chat message and deliver it if chat is enabled.
    pub fn send_chat_message(&self, message: Value) {
        let mut inner = self.inner.lock();
        if self.options.chat_history_len > 0 {
            if inner.chat_history.len() == self.options.chat_history_len {
                inner.chat_history.pop_front();
            }
            inner.chat_history.push_back(message.clone());
        }
        if inner.chat_enabled {
            inner.outbox.put(message);
        }
    }

    pub fn enable_chat(&self) {
        let mut inner = self.inner.lock();
        if inner.chat_enabled {
            return;
        }
        inner.chat_enabled = true;
        inner.outbox.put(json!({"command": "chat.enable"}));
        let history: Vec<Value> = inner.chat_history.iter().cloned().collect();
        for message in history {
            inner.outbox.put(message);
        }
    }

    pub fn disable_chat(&self) {
        let mut inner = self.inner.lock();
        if inner.chat_enabled {
            inner.chat_enabled = false;
            inner.outbox.put(json!({"command": "chat.disable"}));
        }
    }

    pub fn chat_enabled(&self) -> bool {
        self.inner.lock().chat_enabled
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Ask the client something.
    ///
    /// The payload (`params` plus `command` and a fresh `id`) is queued at
    /// once; await the handle for the answer.
    pub fn query(&self, command: &str, params: Value) -> QueryHandle {
        let mut inner = self.inner.lock();
        let (payload, handle) = inner.interactions.open(command, params);
        tracing::debug!(session = self.id, query = handle.id(), %payload, "query");
        inner.outbox.put(payload);
        handle
    }

    /// Route a `{id, value}` response to the waiting query.
    pub fn post_response(&self, epoch: Epoch, response: &Value) -> Result<(), SessionError> {
        self.check_epoch(epoch)?;
        let id = response
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(SessionError::MalformedResponse)?;
        let value = response.get("value").cloned().unwrap_or(Value::Null);

        let mut inner = self.inner.lock();
        inner.last_activity = Utc::now();
        if !inner.interactions.resolve(id, value) {
            return Err(SessionError::InvalidQueryId(id));
        }
        Ok(())
    }

    /// Cancel every pending query and tell the UI to drop open prompts.
    pub fn cancel_interactions(&self, reason: CancelReason) {
        let mut inner = self.inner.lock();
        let count = inner.interactions.cancel_all(reason);
        tracing::debug!(session = self.id, count, %reason, "cancel interactions");
        inner.outbox.put(json!({"command": "cancel_interactions"}));
    }

    /// Payloads of the queries still waiting for an answer.
    pub fn pending_queries(&self) -> Vec<Value> {
        self.inner.lock().interactions.pending_payloads()
    }

    pub fn has_pending_queries(&self) -> bool {
        !self.inner.lock().interactions.is_empty()
    }

    // ------------------------------------------------------------------
    // Location and lifecycle
    // ------------------------------------------------------------------

    /// The location currently containing this session.
    pub fn location(&self) -> Option<Arc<dyn Location>> {
        self.inner.lock().location.as_ref().and_then(Weak::upgrade)
    }

    /// Leave the current location and join `location`.
    ///
    /// Open prompts belong to the old location, so they are cancelled first.
    pub fn move_to(self: &Arc<Self>, location: Option<Arc<dyn Location>>) {
        if self.has_pending_queries() {
            self.cancel_interactions(CancelReason::Relocated);
        }

        let previous = self.inner.lock().location.take();
        if let Some(previous) = previous.as_ref().and_then(Weak::upgrade) {
            previous.leave(self);
        }

        if let Some(location) = location {
            tracing::debug!(session = self.id, location = location.id(), kind = location.kind(), "move");
            self.inner.lock().location = Some(Arc::downgrade(&location));
            location.join(self);
        }
    }

    /// The browser (re)connected: start a new epoch and rebuild its UI.
    ///
    /// Order of replay: identity, chat, the location's init, permanent
    /// messages, then every pending query verbatim.
    pub fn handle_new_connection(self: &Arc<Self>) -> Epoch {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.last_activity = Utc::now();
            inner.epoch += 1;
            inner.outbox.client_reconnected();
            inner.outbox.put(json!({
                "command": "set_client_info",
                "id": self.id,
                "name": self.name,
                "devtest": self.options.devtest,
                "admin": self.is_admin,
            }));
            if inner.chat_enabled {
                inner.outbox.put(json!({"command": "chat.enable"}));
                let history: Vec<Value> = inner.chat_history.iter().cloned().collect();
                for message in history {
                    inner.outbox.put(message);
                }
            }
            inner.epoch
        };
        tracing::info!(session = self.id, epoch, "new connection");

        if let Some(location) = self.location() {
            location.handle_reconnect(self);
        }

        let mut inner = self.inner.lock();
        let replay: Vec<Value> = inner
            .permanent
            .iter()
            .map(|p| p.message.clone())
            .chain(inner.interactions.pending_payloads())
            .collect();
        for message in replay {
            inner.outbox.put(message);
        }
        epoch
    }

    /// Handle a `{command, ...}` request by passing it to the location.
    pub fn handle_request(self: &Arc<Self>, epoch: Epoch, data: &Value) -> Result<(), SessionError> {
        self.check_epoch(epoch)?;
        self.touch();

        let command = data
            .get("command")
            .and_then(Value::as_str)
            .ok_or(SessionError::MissingCommand)?;
        let location = self.location().ok_or(SessionError::NoLocation)?;

        if location.handle_request(self, command, data)? {
            Ok(())
        } else {
            Err(SessionError::Unhandled(command.to_string()))
        }
    }

    /// The session disconnects or is disconnected.
    pub fn quit(self: &Arc<Self>, reason: &str) {
        self.inner.lock().interactions.cancel_all(CancelReason::SessionClosed);
        self.move_to(None);

        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.outbox.put(json!({"command": "quit", "reason": reason}));
        tracing::info!(session = self.id, reason, "session quit");
    }
}

/// Keeps track of every session of a server.
#[derive(Debug, Default)]
pub struct SessionManager {
    /// Sessions by id
    sessions: HashMap<SessionId, Arc<Session>>,

    next_id: SessionId,

    options: SessionOptions,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            options,
        }
    }

    /// Create a session after validating its name.
    ///
    /// Names are trimmed; an empty or already used name is rejected.
    pub fn create(&mut self, name: &str, is_admin: bool) -> Result<Arc<Session>, NameError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if self.find_by_name(name).is_some() {
            return Err(NameError::Duplicate(name.to_string()));
        }

        let id = self.next_id.max(1);
        self.next_id = id + 1;
        let session = Arc::new(Session::with_options(id, name, is_admin, self.options));
        self.sessions.insert(id, Arc::clone(&session));
        tracing::info!(session = id, name, is_admin, "new session");
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.values().find(|s| s.name() == name).cloned()
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id)
    }

    /// Sessions whose last activity is older than `cutoff`.
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<Session>> {
        let mut inactive: Vec<Arc<Session>> = self
            .sessions
            .values()
            .filter(|s| s.last_activity() < cutoff)
            .cloned()
            .collect();
        inactive.sort_by_key(|s| s.id());
        inactive
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        let mut all: Vec<Arc<Session>> = self.sessions.values().cloned().collect();
        all.sort_by_key(|s| s.id());
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::interaction::Cancelled;
    use crate::state::location::{LocationCore, LocationOptions, LocationRegistry};
    use pretty_assertions::assert_eq;

    /// Location that records joins and leaves.
    struct Room {
        core: LocationCore,
        log: Mutex<Vec<String>>,
    }

    impl Room {
        fn create(registry: &Arc<LocationRegistry>, has_chat: bool) -> Arc<Room> {
            let options = LocationOptions {
                has_chat,
                persistent: true,
                ..LocationOptions::default()
            };
            let room = Arc::new(Room {
                core: LocationCore::new(registry, options),
                log: Mutex::new(Vec::new()),
            });
            registry.register(room.clone());
            room
        }
    }

    impl Location for Room {
        fn core(&self) -> &LocationCore {
            &self.core
        }

        fn kind(&self) -> &'static str {
            "room"
        }

        fn join(&self, session: &Arc<Session>) {
            self.log.lock().push(format!("join {}", session.name()));
            self.core.add_member(session);
            self.send_init(session);
        }

        fn leave(&self, session: &Arc<Session>) {
            self.log.lock().push(format!("leave {}", session.name()));
            self.core.remove_member(session);
        }

        fn send_init(&self, session: &Arc<Session>) {
            session.send(json!({"command": "room.init"}));
        }

        fn handle_request(
            &self,
            _session: &Arc<Session>,
            command: &str,
            _data: &Value,
        ) -> Result<bool, LocationError> {
            Ok(command == "room.ping")
        }
    }

    fn session(name: &str) -> Arc<Session> {
        Arc::new(Session::new(1, name, false))
    }

    #[test]
    fn test_send_and_take() {
        let alice = session("Alice");
        alice.send(json!({"command": "a"}));
        alice.send(json!({"command": "b"}));

        assert_eq!(alice.take_messages(), vec![json!({"command": "a"}), json!({"command": "b"})]);
    }

    #[test]
    fn test_permanent_messages() {
        let alice = session("Alice");
        alice.send_permanent("waiting", json!({"command": "w"}));
        alice.send_permanent("other", json!({"command": "o"}));
        assert_eq!(alice.take_messages().len(), 2);

        alice.remove_permanent(Some("waiting"));
        assert_eq!(
            alice.permanent_messages(),
            vec![PermanentMessage {
                group: "other".to_string(),
                message: json!({"command": "o"}),
            }]
        );

        alice.remove_permanent(None);
        assert!(alice.permanent_messages().is_empty());
    }

    #[test]
    fn test_new_connection_bumps_epoch_and_clears() {
        let alice = session("Alice");
        alice.send(json!({"command": "stale"}));

        assert_eq!(alice.handle_new_connection(), 1);
        assert_eq!(alice.handle_new_connection(), 2);

        let messages = alice.take_messages();
        assert_eq!(
            messages,
            vec![
                json!({"command": "set_client_info", "id": 1, "name": "Alice", "devtest": false, "admin": false}),
                json!({"command": "chat.enable"}),
            ]
        );
    }

    #[test]
    fn test_reconnect_replays_in_order() {
        let registry = LocationRegistry::new();
        let room = Room::create(&registry, true);
        let alice = session("Alice");
        alice.move_to(Some(room));
        alice.send_permanent("waiting", json!({"command": "w"}));
        let _handle = alice.query("choice", json!({"question": "Q?"}));
        alice.take_messages();

        alice.handle_new_connection();

        let commands: Vec<Value> = alice
            .take_messages()
            .into_iter()
            .map(|m| m["command"].clone())
            .collect();
        assert_eq!(
            commands,
            vec![
                json!("set_client_info"),
                json!("chat.enable"),
                json!("room.init"),
                json!("w"),
                json!("choice"),
            ]
        );
    }

    #[test]
    fn test_reconnect_mid_query_replays_payload_verbatim() {
        let alice = session("Alice");
        let _handle = alice.query("choice", json!({"question": "Q?", "answers": ["Yes", "No"]}));
        let sent = alice.take_messages();

        alice.handle_new_connection();

        let replayed = alice.take_messages();
        assert_eq!(replayed.last(), sent.last());
    }

    #[test]
    fn test_chat_history_replayed() {
        let alice = Arc::new(Session::with_options(
            1,
            "Alice",
            false,
            SessionOptions {
                chat_history_len: 2,
                devtest: false,
            },
        ));
        for n in 0..3 {
            alice.send_chat_message(json!({"command": "chat.message", "message": n}));
        }
        alice.take_messages();

        alice.handle_new_connection();

        let messages = alice.take_messages();
        assert_eq!(messages[1], json!({"command": "chat.enable"}));
        assert_eq!(messages[2]["message"], json!(1));
        assert_eq!(messages[3]["message"], json!(2));
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn test_disabled_chat_is_recorded_not_sent() {
        let alice = session("Alice");
        alice.disable_chat();
        alice.send_chat_message(json!({"command": "chat.message", "message": "hi"}));
        assert_eq!(alice.take_messages(), vec![json!({"command": "chat.disable"})]);

        alice.enable_chat();
        assert_eq!(
            alice.take_messages(),
            vec![
                json!({"command": "chat.enable"}),
                json!({"command": "chat.message", "message": "hi"}),
            ]
        );
    }

    #[test]
    fn test_post_response() {
        let alice = session("Alice");
        let epoch = alice.handle_new_connection();
        let mut handle = alice.query("choice", json!({}));

        alice.post_response(epoch, &json!({"id": handle.id(), "value": 1})).unwrap();

        assert_eq!(handle.try_result(), Some(Ok(json!(1))));
    }

    #[test]
    fn test_post_response_invalid_id() {
        let alice = session("Alice");
        let mut handle = alice.query("choice", json!({}));

        let err = alice.post_response(0, &json!({"id": 99, "value": 1})).unwrap_err();

        assert!(matches!(err, SessionError::InvalidQueryId(99)));
        assert!(err.is_protocol_violation());
        assert!(handle.try_result().is_none());
        assert_eq!(alice.pending_queries().len(), 1);
    }

    #[test]
    fn test_post_response_malformed() {
        let alice = session("Alice");
        let err = alice.post_response(0, &json!({"value": 1})).unwrap_err();
        assert!(matches!(err, SessionError::MalformedResponse));
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let alice = session("Alice");
        let old = alice.handle_new_connection();
        let mut handle = alice.query("choice", json!({}));
        alice.handle_new_connection();

        let err = alice.post_response(old, &json!({"id": handle.id(), "value": 1})).unwrap_err();
        assert!(matches!(err, SessionError::StaleEpoch { current: 2, got: 1 }));
        assert!(handle.try_result().is_none());

        assert!(alice.wait_for_messages(old).is_err());
        assert!(alice.wait_for_messages(old + 1).is_ok());
    }

    #[test]
    fn test_cancel_interactions() {
        let alice = session("Alice");
        let mut a = alice.query("a", json!({}));
        let mut b = alice.query("b", json!({}));
        alice.take_messages();

        alice.cancel_interactions(CancelReason::Resigned);

        let cancelled = Err(Cancelled::new(CancelReason::Resigned));
        assert_eq!(a.try_result(), Some(cancelled.clone()));
        assert_eq!(b.try_result(), Some(cancelled));
        assert!(alice.pending_queries().is_empty());
        assert_eq!(alice.take_messages(), vec![json!({"command": "cancel_interactions"})]);
    }

    #[test]
    fn test_move_to() {
        let registry = LocationRegistry::new();
        let first = Room::create(&registry, true);
        let second = Room::create(&registry, false);
        let alice = session("Alice");

        alice.move_to(Some(first.clone()));
        alice.send_permanent("waiting", json!({"command": "w"}));
        alice.move_to(Some(second.clone()));

        assert_eq!(*first.log.lock(), vec!["join Alice", "leave Alice"]);
        assert_eq!(*second.log.lock(), vec!["join Alice"]);
        assert_eq!(alice.location().map(|l| l.id()), Some(second.id()));
        assert!(alice.permanent_messages().is_empty());
        assert!(!alice.chat_enabled());
        assert!(first.core().members().is_empty());
        assert_eq!(second.core().members().len(), 1);
    }

    #[test]
    fn test_move_cancels_open_prompts() {
        let registry = LocationRegistry::new();
        let room = Room::create(&registry, true);
        let alice = session("Alice");
        let mut handle = alice.query("choice", json!({}));

        alice.move_to(Some(room));

        assert_eq!(
            handle.try_result(),
            Some(Err(Cancelled::new(CancelReason::Relocated)))
        );
    }

    #[test]
    fn test_handle_request() {
        let registry = LocationRegistry::new();
        let room = Room::create(&registry, true);
        let alice = session("Alice");

        assert!(matches!(
            alice.handle_request(0, &json!({"command": "room.ping"})),
            Err(SessionError::NoLocation)
        ));

        alice.move_to(Some(room));
        alice.handle_request(0, &json!({"command": "room.ping"})).unwrap();
        assert!(matches!(
            alice.handle_request(0, &json!({"foo": 1})),
            Err(SessionError::MissingCommand)
        ));
        assert!(matches!(
            alice.handle_request(0, &json!({"command": "nope"})),
            Err(SessionError::Unhandled(c)) if c == "nope"
        ));
    }

    #[test]
    fn test_quit() {
        let registry = LocationRegistry::new();
        let room = Room::create(&registry, true);
        let alice = session("Alice");
        alice.move_to(Some(room.clone()));
        let mut handle = alice.query("choice", json!({}));

        alice.quit("bye");

        assert!(alice.is_closed());
        assert!(alice.location().is_none());
        assert!(room.core().members().is_empty());
        assert_eq!(
            handle.try_result(),
            Some(Err(Cancelled::new(CancelReason::SessionClosed)))
        );
        assert_eq!(
            alice.take_messages().last(),
            Some(&json!({"command": "quit", "reason": "bye"}))
        );
    }

    #[test]
    fn test_manager_names() {
        let mut manager = SessionManager::new(SessionOptions::default());

        assert_eq!(manager.create("  ", false).unwrap_err(), NameError::Empty);

        let alice = manager.create("  Alice ", false).unwrap();
        assert_eq!(alice.name(), "Alice");
        assert_eq!(alice.id(), 1);

        assert_eq!(
            manager.create("Alice", false).unwrap_err(),
            NameError::Duplicate("Alice".to_string())
        );

        let bob = manager.create("Bob", true).unwrap();
        assert_eq!(bob.id(), 2);
        assert!(bob.is_admin());
        assert_eq!(manager.len(), 2);

        manager.remove(1);
        let alice_again = manager.create("Alice", false).unwrap();
        assert_eq!(alice_again.id(), 3);
    }

    #[test]
    fn test_manager_inactive() {
        let mut manager = SessionManager::new(SessionOptions::default());
        manager.create("Alice", false).unwrap();

        assert!(manager.inactive_since(Utc::now() - chrono::Duration::minutes(5)).is_empty());
        assert_eq!(manager.inactive_since(Utc::now() + chrono::Duration::minutes(5)).len(), 1);
    }
}
