//! Server state.
//!
//! - `session` - Logged-in participants, their outbox, epochs and queries
//! - `connection` - Long-poll message queue
//! - `interaction` - Query/response correlation and cancellation
//! - `location` - Shared contexts and the location registry
//! - `lobby` / `proposal` - Gathering players and proposing games
//! - `game` / `engine` - Turn-based games driven by declared states
//! - `waiting` - "Waiting for ..." messages
//! - `admin` - The admin room
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Server                                  │
//! │                                                                       │
//! │  ┌──────────────────┐   ┌───────────────────────────────────────┐    │
//! │  │  SessionManager  │   │           LocationRegistry            │    │
//! │  │                  │   │                                       │    │
//! │  │ id → Session ────┼──▶│ id → Lobby │ Game<R> │ AdminLocation  │    │
//! │  │      (weak link  │   │                                       │    │
//! │  │       to its     │   │ Lobby ──▶ Proposal (per-candidate     │    │
//! │  │       location)  │   │            invitation locks)          │    │
//! │  │                  │   │ Game  ──▶ Engine ──▶ GameRules        │    │
//! │  └──────────────────┘   └───────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport calls [`Server::connect`], [`Server::request`],
//! [`Server::respond`] and [`Server::poll`]; everything else happens by
//! messages queued on the sessions.

pub mod admin;
pub mod connection;
pub mod engine;
pub mod game;
pub mod interaction;
pub mod lobby;
pub mod location;
pub mod player;
pub mod proposal;
pub mod session;
pub mod text;
pub mod ui;
pub mod waiting;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ServerConfig;

pub use admin::AdminLocation;
pub use connection::{Delivery, MessageQueue, PollHandle};
pub use engine::{
    AfterResignation, GameRules, Next, RequestOutcome, State, StateName, Table, Transition,
    TurnError, Wake, INIT, STOP,
};
pub use game::{Game, GameError, GameFactory, GameSettings, GameStatus, Seating, StateGameFactory};
pub use interaction::{CancelReason, Cancelled, InteractionRegistry, QueryHandle, QueryId, QueryResult};
pub use lobby::{Lobby, LobbyError};
pub use location::{
    Location, LocationCore, LocationError, LocationId, LocationOptions, LocationRegistry,
};
pub use player::Player;
pub use proposal::{Proposal, ProposalError};
pub use session::{
    Epoch, NameError, PermanentMessage, Session, SessionError, SessionId, SessionManager,
    SessionOptions,
};
pub use waiting::WaitingMessagesManager;

/// Errors returned to the transport.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Unknown session {0}.")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("You must be admin to do this.")]
    Privilege,
}

/// Everything one server instance owns.
pub struct Server {
    config: ServerConfig,
    sessions: Mutex<SessionManager>,
    locations: Arc<LocationRegistry>,
    admin: Arc<AdminLocation>,

    /// Where freshly registered sessions go
    default_location: Mutex<Option<Arc<dyn Location>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let locations = LocationRegistry::new();
        let admin = AdminLocation::new(&locations);
        Self {
            sessions: Mutex::new(SessionManager::new(config.session_options())),
            config,
            locations,
            admin,
            default_location: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn locations(&self) -> &Arc<LocationRegistry> {
        &self.locations
    }

    pub fn admin(&self) -> &Arc<AdminLocation> {
        &self.admin
    }

    pub fn set_default_location(&self, location: Arc<dyn Location>) {
        *self.default_location.lock() = Some(location);
    }

    /// Create a lobby for the games `factory` builds, set up from the
    /// server configuration.
    pub fn create_lobby(
        &self,
        factory: Arc<dyn GameFactory>,
        min_players: usize,
        max_players: usize,
    ) -> Result<Arc<Lobby>, LobbyError> {
        Lobby::new(
            &self.locations,
            self.config.game_settings(),
            factory,
            min_players,
            max_players,
        )
    }

    /// Log a new session in and move it to the default location.
    pub fn register(&self, name: &str, is_admin: bool) -> Result<Arc<Session>, ServerError> {
        let session = self.sessions.lock().create(name, is_admin)?;
        tracing::info!(session = session.id(), name = session.name(), is_admin, "session registered");

        let default = self.default_location.lock().clone();
        if let Some(location) = default {
            session.move_to(Some(location));
        }
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<Session>, ServerError> {
        self.sessions.lock().get(id).ok_or(ServerError::SessionNotFound(id))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// A page was (re)loaded: start a new epoch.
    pub fn connect(&self, id: SessionId) -> Result<Epoch, ServerError> {
        Ok(self.session(id)?.handle_new_connection())
    }

    /// Dispatch a `{command, ...}` request.
    ///
    /// Failures other than a stale epoch are also shown in the session's
    /// location as a system message.
    pub fn request(&self, id: SessionId, epoch: Epoch, data: &Value) -> Result<(), ServerError> {
        let session = self.session(id)?;

        if data.get("command").and_then(Value::as_str) == Some("go_to_admin") {
            session.check_epoch(epoch)?;
            if !session.is_admin() {
                tracing::warn!(session = id, "non-admin tried to enter the admin room");
                return Err(ServerError::Privilege);
            }
            session.move_to(Some(self.admin.clone()));
            return Ok(());
        }

        session.handle_request(epoch, data).map_err(|e| {
            report(&session, &e);
            e.into()
        })
    }

    /// Answer to a pending query.
    pub fn respond(&self, id: SessionId, epoch: Epoch, response: &Value) -> Result<(), ServerError> {
        let session = self.session(id)?;
        session.post_response(epoch, response).map_err(|e| {
            report(&session, &e);
            e.into()
        })
    }

    /// Long-poll for the session's messages.
    pub fn poll(&self, id: SessionId, epoch: Epoch) -> Result<PollHandle, ServerError> {
        Ok(self.session(id)?.wait_for_messages(epoch)?)
    }

    /// Log a session out.
    pub fn quit(&self, id: SessionId, reason: &str) -> Result<(), ServerError> {
        let session = self
            .sessions
            .lock()
            .remove(id)
            .ok_or(ServerError::SessionNotFound(id))?;
        session.quit(reason);
        Ok(())
    }

    /// Force-quit every session idle for longer than the configured timeout.
    pub fn sweep_inactive(&self) -> Vec<SessionId> {
        self.sweep_inactive_at(Utc::now())
    }

    pub fn sweep_inactive_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let cutoff = now - self.config.inactivity_timeout();
        let idle = self.sessions.lock().inactive_since(cutoff);
        if idle.is_empty() {
            return Vec::new();
        }

        let reason = format!(
            "You were inactive for more than {} minutes.",
            self.config.inactivity_timeout_secs / 60
        );
        for session in &idle {
            self.sessions.lock().remove(session.id());
            session.quit(&reason);
        }
        tracing::info!(count = idle.len(), "swept inactive sessions");
        idle.iter().map(|s| s.id()).collect()
    }
}

/// Show a failed request to the session's location.
fn report(session: &Arc<Session>, error: &SessionError) {
    if matches!(error, SessionError::StaleEpoch { .. }) {
        return;
    }
    let text = if error.is_protocol_violation() {
        tracing::warn!(session = session.id(), %error, "protocol violation");
        format!("Communication error. Expect weird things. [{}]", error)
    } else {
        tracing::error!(session = session.id(), %error, "request failed");
        format!("An error occurred. Expect weird things. [{}]", error)
    };
    match session.location() {
        Some(location) => location.system_message(&text),
        None => ui::say(session, &text),
    }
}
