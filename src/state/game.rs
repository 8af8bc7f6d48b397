//! Games as locations.
//!
//! A [`Game`] seats the sessions it was created with, owns the turn
//! [`Engine`] behind a mutex and carries out the engine's effects (spawned
//! player actions, announcements, the end) after the lock is released.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};

use super::engine::{Effect, Effects, Engine, GameRules, StateName, Table, Ticket, TurnError};
use super::interaction::CancelReason;
use super::location::{
    handle_base_request, Location, LocationCore, LocationError, LocationOptions, LocationRegistry,
};
use super::player::Player;
use super::session::{Session, SessionId};
use super::text::{english_join_list, singular_s};

/// Game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameStatus {
    /// Created, not started yet
    #[default]
    Idle,
    InProgress,
    Finished,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
        }
    }
}

/// Game errors.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("It is not your turn (waiting for {expected}, got {got}).")]
    OutOfTurn { expected: SessionId, got: SessionId },

    #[error("Player {0} is not awake.")]
    NotAwake(SessionId),

    #[error("The game is not waiting for anybody.")]
    NotWaiting,

    #[error("The game is not running.")]
    NotRunning,

    #[error("Unknown state '{0}'.")]
    UnknownState(String),

    #[error("STOP cannot be declared as a state.")]
    ReservedState,

    #[error("Session {0} does not play in this game.")]
    NotPlayer(SessionId),

    #[error("The game has already started.")]
    AlreadyStarted,

    #[error("A game needs at least one player.")]
    NoPlayers,

    #[error("The player order must name every active player once.")]
    InvalidPlayerOrder,

    #[error("{0}")]
    Rules(String),
}

impl GameError {
    /// Errors only a tampered or confused client can cause.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::OutOfTurn { .. } | Self::NotAwake(_) | Self::NotWaiting | Self::NotPlayer(_)
        )
    }
}

/// How players are seated at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Seating {
    #[default]
    Shuffled,
    AsGiven,
}

/// How a lobby sets up the games it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameSettings {
    pub options: LocationOptions,
    pub seating: Seating,
}

/// A running game.
pub struct Game<R: GameRules> {
    core: LocationCore,
    identifier: String,
    me: Weak<Self>,

    /// Where `games.base.leave` sends a player (usually the lobby)
    return_to: Option<Weak<dyn Location>>,

    engine: Mutex<Engine<R>>,
}

impl<R: GameRules> Game<R> {
    /// Create and register a game, then move `sessions` into it.
    ///
    /// The game is not started; call [`start`](Self::start).
    pub fn create(
        registry: &Arc<LocationRegistry>,
        options: LocationOptions,
        identifier: &str,
        rules: R,
        sessions: &[Arc<Session>],
        seating: Seating,
        return_to: Option<Weak<dyn Location>>,
    ) -> Result<Arc<Self>, GameError> {
        if sessions.is_empty() {
            return Err(GameError::NoPlayers);
        }
        let mut seated = sessions.to_vec();
        if seating == Seating::Shuffled {
            seated.shuffle(&mut rand::thread_rng());
        }
        let players: Vec<Player> = seated
            .into_iter()
            .enumerate()
            .map(|(seat, session)| Player::new(session, seat))
            .collect();
        let engine = Engine::new(rules, Table::new(identifier, players.clone()))?;

        let game = Arc::new_cyclic(|me| Self {
            core: LocationCore::new(registry, options),
            identifier: identifier.to_string(),
            me: me.clone(),
            return_to,
            engine: Mutex::new(engine),
        });
        let location: Arc<dyn Location> = game.clone();
        registry.register(Arc::clone(&location));
        tracing::info!(game = identifier, id = game.id(), players = players.len(), "game created");

        for player in &players {
            player.session().move_to(Some(Arc::clone(&location)));
        }
        Ok(game)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Enter `INIT` and wake the first players.
    pub fn start(&self) -> Result<(), GameError> {
        let effects = self.engine.lock().start()?;
        tracing::info!(game = %self.identifier, id = self.id(), "game started");
        self.apply(effects);
        Ok(())
    }

    pub fn status(&self) -> GameStatus {
        let engine = self.engine.lock();
        if engine.has_ended() {
            GameStatus::Finished
        } else if engine.is_running() {
            GameStatus::InProgress
        } else {
            GameStatus::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine.lock().is_running()
    }

    pub fn state(&self) -> StateName {
        self.engine.lock().table().state()
    }

    /// States entered so far, in order.
    pub fn history(&self) -> Vec<StateName> {
        self.engine.lock().history().to_vec()
    }

    /// Active players in turn order.
    pub fn players(&self) -> Vec<Player> {
        self.engine.lock().table().players().to_vec()
    }

    /// Every player, resigned ones included.
    pub fn all_players(&self) -> Vec<Player> {
        self.engine.lock().table().all_players().to_vec()
    }

    /// Players the game is waiting for.
    pub fn awake_players(&self) -> Vec<SessionId> {
        self.engine.lock().awake_players()
    }

    /// What waiting players are shown right now.
    pub fn waiting_message(&self) -> Option<String> {
        self.engine.lock().waiting().current_message()
    }

    /// Look at the rules and table under the game lock.
    pub fn inspect<T>(&self, f: impl FnOnce(&R, &Table) -> T) -> T {
        let engine = self.engine.lock();
        f(engine.rules(), engine.table())
    }

    /// A [`Wake::Deferred`](super::engine::Wake::Deferred) player is done.
    pub fn player_done(&self, id: SessionId) -> Result<(), GameError> {
        let effects = self.engine.lock().player_done(id)?;
        self.apply(effects);
        Ok(())
    }

    pub fn resign(&self, id: SessionId) -> Result<(), GameError> {
        let effects = self.engine.lock().resign(id)?;
        self.apply(effects);
        Ok(())
    }

    pub fn end_game(&self) {
        let effects = self.engine.lock().end_game();
        self.apply(effects);
    }

    fn action_finished(&self, id: SessionId, ticket: Ticket, result: Result<R::Action, TurnError>) {
        let effects = self.engine.lock().action_finished(id, ticket, result);
        self.apply(effects);
    }

    fn apply(&self, effects: Effects<R::Action>) {
        for effect in effects {
            match effect {
                Effect::Spawn {
                    player,
                    ticket,
                    future,
                } => {
                    let game = self.me.clone();
                    tokio::spawn(async move {
                        let result = future.await;
                        if let Some(game) = game.upgrade() {
                            game.action_finished(player, ticket, result);
                        }
                    });
                }
                Effect::Announce(text) => self.core.system_message(&text),
                Effect::Finished { winners } => self.finish(&winners),
            }
        }
    }

    fn finish(&self, winners: &[Player]) {
        let players = self.all_players();
        for player in &players {
            player.session().cancel_interactions(CancelReason::GameEnded);
        }
        if !winners.is_empty() {
            let names: Vec<&str> = winners.iter().map(Player::name).collect();
            self.core.system_message(&format!(
                "{} win{}!",
                english_join_list(&names),
                singular_s(winners.len() as i64)
            ));
        }
        let end = self.end_message(winners);
        for player in &players {
            player.send(end.clone());
        }
    }

    fn end_message(&self, winners: &[Player]) -> Value {
        let winners: Vec<&str> = winners.iter().map(Player::name).collect();
        json!({
            "command": "games.base.display_end_message",
            "game": self.identifier,
            "winners": winners,
            "log": null,
        })
    }

    fn init_messages(&self, engine: &Engine<R>, id: SessionId) -> Vec<Value> {
        let table = engine.table();
        let rules = engine.rules();

        let mut players = Map::new();
        for player in table.all_players() {
            players.insert(player.id().to_string(), json!(player.name()));
        }
        let mut messages = vec![json!({
            "command": "games.base.init",
            "game": self.identifier,
            "players": players,
        })];

        if let Some(update) = table.player(id).and_then(|me| rules.private_ui_update(table, me)) {
            messages.push(update);
        }
        messages.extend(
            table
                .all_players()
                .iter()
                .filter_map(|p| rules.public_ui_update(table, p)),
        );
        messages.extend(rules.game_ui_update(table));
        if engine.has_ended() {
            messages.push(self.end_message(engine.winners()));
        }
        messages
    }

    fn is_playing(&self, id: SessionId) -> bool {
        let engine = self.engine.lock();
        engine.is_running() && engine.table().is_active(id)
    }
}

impl<R: GameRules> Location for Game<R> {
    fn core(&self) -> &LocationCore {
        &self.core
    }

    fn kind(&self) -> &'static str {
        "game"
    }

    fn describe(&self) -> Value {
        let players: Vec<Value> = self.all_players().iter().map(Player::to_json).collect();
        json!({
            "id": self.id(),
            "kind": self.kind(),
            "game": self.identifier,
            "players": players,
            "status": self.status().as_str(),
            "state": self.state(),
        })
    }

    fn leave(&self, session: &Arc<Session>) {
        if self.is_playing(session.id()) {
            if let Err(e) = self.resign(session.id()) {
                tracing::warn!(game = %self.identifier, session = session.id(), error = %e, "resign on leave failed");
            }
        }
        self.core.remove_member(session);
    }

    fn send_init(&self, session: &Arc<Session>) {
        let messages = {
            let engine = self.engine.lock();
            self.init_messages(&engine, session.id())
        };
        for message in messages {
            session.send(message);
        }
    }

    fn handle_request(
        &self,
        session: &Arc<Session>,
        command: &str,
        data: &Value,
    ) -> Result<bool, LocationError> {
        match command {
            "games.base.resign" => {
                self.resign(session.id())?;
                Ok(true)
            }
            "games.base.leave" => {
                let target = self
                    .return_to
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| LocationError::BadRequest("nowhere to go back to".to_string()))?;
                session.move_to(Some(target));
                Ok(true)
            }
            _ => {
                let outcome = self.engine.lock().handle_request(session.id(), command, data);
                let (handled, effects) = outcome?;
                self.apply(effects);
                if handled {
                    Ok(true)
                } else {
                    handle_base_request(self, session, command, data)
                }
            }
        }
    }

    fn cheat(&self, session: &Arc<Session>, command: &str) -> Result<(), LocationError> {
        self.engine.lock().cheat(session.id(), command);
        Ok(())
    }
}

/// Builds games for a lobby.
pub trait GameFactory: Send + Sync {
    /// Identifier of the games built, e.g. `"belote"`.
    fn identifier(&self) -> &str;

    /// Create and start a game for `sessions`; `lobby` is where they go back to.
    fn create(
        &self,
        registry: &Arc<LocationRegistry>,
        sessions: &[Arc<Session>],
        settings: GameSettings,
        lobby: Weak<dyn Location>,
    ) -> Result<Arc<dyn Location>, GameError>;
}

/// [`GameFactory`] for [`Game`]s, building fresh rules for every game.
pub struct StateGameFactory<R, F> {
    identifier: String,
    build: F,
    _rules: PhantomData<fn() -> R>,
}

impl<R, F> StateGameFactory<R, F>
where
    R: GameRules,
    F: Fn(&[Arc<Session>]) -> R + Send + Sync,
{
    pub fn new(identifier: &str, build: F) -> Self {
        Self {
            identifier: identifier.to_string(),
            build,
            _rules: PhantomData,
        }
    }
}

impl<R, F> GameFactory for StateGameFactory<R, F>
where
    R: GameRules,
    F: Fn(&[Arc<Session>]) -> R + Send + Sync,
{
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn create(
        &self,
        registry: &Arc<LocationRegistry>,
        sessions: &[Arc<Session>],
        settings: GameSettings,
        lobby: Weak<dyn Location>,
    ) -> Result<Arc<dyn Location>, GameError> {
        let rules = (self.build)(sessions);
        let game = Game::create(
            registry,
            settings.options,
            &self.identifier,
            rules,
            sessions,
            settings.seating,
            Some(lobby),
        )?;
        game.start()?;
        Ok(game)
    }
}
