//! Game lobbies.
//!
//! A lobby is a persistent location where players gather, propose games to
//! each other and return to when a game is over. It knows one kind of game
//! through its [`GameFactory`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::game::{GameError, GameFactory, GameSettings};
use super::location::{
    handle_base_request, Location, LocationCore, LocationError, LocationOptions, LocationRegistry,
};
use super::proposal::{Proposal, ProposalError};
use super::session::{Session, SessionId};
use super::text::plural_s;
use super::ui;

/// Lobby construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("Invalid player range {min}..={max}.")]
    InvalidPlayerRange { min: usize, max: usize },
}

/// A lobby for one kind of game.
pub struct Lobby {
    core: LocationCore,
    me: Weak<Self>,

    /// Smallest game, counting the proposer
    min_players: usize,

    /// Largest game, counting the proposer
    max_players: usize,

    factory: Arc<dyn GameFactory>,

    /// Passed to the factory for every game
    settings: GameSettings,

    proposals: Mutex<Vec<Arc<Proposal>>>,

    /// One lock per member, held while that member is being invited
    proposal_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,

    games: Mutex<Vec<Weak<dyn Location>>>,
}

impl Lobby {
    /// Create and register a lobby. Lobbies are always persistent; their
    /// games are not.
    pub fn new(
        registry: &Arc<LocationRegistry>,
        settings: GameSettings,
        factory: Arc<dyn GameFactory>,
        min_players: usize,
        max_players: usize,
    ) -> Result<Arc<Self>, LobbyError> {
        if min_players == 0 || min_players > max_players {
            return Err(LobbyError::InvalidPlayerRange {
                min: min_players,
                max: max_players,
            });
        }
        let options = LocationOptions {
            persistent: true,
            ..settings.options
        };
        let settings = GameSettings {
            options: LocationOptions {
                persistent: false,
                ..settings.options
            },
            ..settings
        };
        let lobby = Arc::new_cyclic(|me| Self {
            core: LocationCore::new(registry, options),
            me: me.clone(),
            min_players,
            max_players,
            factory,
            settings,
            proposals: Mutex::new(Vec::new()),
            proposal_locks: Mutex::new(HashMap::new()),
            games: Mutex::new(Vec::new()),
        });
        registry.register(lobby.clone());
        tracing::info!(lobby = lobby.id(), game = lobby.factory.identifier(), "lobby created");
        Ok(lobby)
    }

    pub fn game_identifier(&self) -> &str {
        self.factory.identifier()
    }

    pub fn min_players(&self) -> usize {
        self.min_players
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// What the games started here are created with.
    pub fn game_settings(&self) -> GameSettings {
        self.settings
    }

    /// Open proposals.
    pub fn proposals(&self) -> Vec<Arc<Proposal>> {
        self.proposals.lock().clone()
    }

    /// Games started from this lobby that still exist.
    pub fn games(&self) -> Vec<Arc<dyn Location>> {
        self.games.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Propose a game to the members in `player_ids`; the proposer is
    /// always a candidate.
    pub fn propose_game(
        &self,
        proposer: &Arc<Session>,
        player_ids: &[SessionId],
    ) -> Result<Arc<Proposal>, ProposalError> {
        if !self.core.contains(proposer.id()) {
            return Err(ProposalError::ProposerNotInLobby);
        }
        let mut candidates = vec![Arc::clone(proposer)];
        candidates.extend(
            self.core
                .members()
                .into_iter()
                .filter(|s| s.id() != proposer.id() && player_ids.contains(&s.id())),
        );
        self.check_player_count(candidates.len())?;

        let proposal = Proposal::new(self.me.clone(), candidates);
        self.proposals.lock().push(Arc::clone(&proposal));
        tracing::info!(
            lobby = self.id(),
            proposer = proposer.id(),
            candidates = proposal.candidates().len(),
            "game proposed"
        );
        tokio::spawn(Arc::clone(&proposal).run());
        Ok(proposal)
    }

    fn check_player_count(&self, count: usize) -> Result<(), ProposalError> {
        let others = |n: usize| format!("{} other player{}", n - 1, plural_s(n as i64 - 1));
        let message = if self.min_players == self.max_players {
            (count != self.min_players).then(|| format!("You need to select exactly {}.", others(self.min_players)))
        } else if count < self.min_players {
            Some(format!("You need to select at least {}.", others(self.min_players)))
        } else if count > self.max_players {
            Some(format!("You need to select at most {}.", others(self.max_players)))
        } else {
            None
        };
        match message {
            Some(message) => Err(ProposalError::PlayerCount(message)),
            None => Ok(()),
        }
    }

    /// The invitation lock of `id`, created on first use.
    pub(crate) fn proposal_lock(&self, id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.proposal_locks.lock().entry(id).or_default())
    }

    pub(crate) fn remove_proposal(&self, proposal: &Arc<Proposal>) {
        self.proposals.lock().retain(|p| !Arc::ptr_eq(p, proposal));
    }

    /// Create a game for `sessions` through the factory.
    pub(crate) fn start_game(&self, sessions: &[Arc<Session>]) -> Result<(), GameError> {
        let Some(registry) = self.core.registry() else {
            tracing::warn!(lobby = self.id(), "no registry, game not started");
            return Ok(());
        };
        let lobby: Weak<dyn Location> = self.me.clone();
        let game = self.factory.create(&registry, sessions, self.settings, lobby)?;
        tracing::info!(lobby = self.id(), game = game.id(), "game started from lobby");

        let mut games = self.games.lock();
        games.retain(|g| g.strong_count() > 0);
        games.push(Arc::downgrade(&game));
        Ok(())
    }
}

impl Location for Lobby {
    fn core(&self) -> &LocationCore {
        &self.core
    }

    fn kind(&self) -> &'static str {
        "lobby"
    }

    fn describe(&self) -> Value {
        let members: Vec<Value> = self.core.members().iter().map(|s| s.to_json()).collect();
        json!({
            "id": self.id(),
            "kind": self.kind(),
            "game": self.game_identifier(),
            "members": members,
            "proposals": self.proposals.lock().len(),
        })
    }

    fn join(&self, session: &Arc<Session>) {
        self.core.broadcast(&json!({
            "command": "games.lobby.client_joins",
            "client_id": session.id(),
            "client_name": session.name(),
        }));
        self.core.add_member(session);
        self.send_init(session);
    }

    fn leave(&self, session: &Arc<Session>) {
        for proposal in self.proposals() {
            proposal.client_left_lobby(session);
        }
        self.proposal_locks.lock().remove(&session.id());
        self.core.remove_member(session);

        self.core.broadcast(&json!({
            "command": "games.lobby.client_leaves",
            "client_id": session.id(),
        }));
    }

    fn send_init(&self, session: &Arc<Session>) {
        let mut clients = Map::new();
        for member in self.core.members() {
            clients.insert(member.id().to_string(), json!(member.name()));
        }
        session.send(json!({
            "command": "games.lobby.init",
            "clients": clients,
            "min_players": self.min_players,
            "max_players": self.max_players,
        }));
    }

    fn handle_reconnect(&self, session: &Arc<Session>) {
        self.send_init(session);
        for proposal in self.proposals() {
            proposal.handle_reconnect(session);
        }
    }

    fn handle_request(
        &self,
        session: &Arc<Session>,
        command: &str,
        data: &Value,
    ) -> Result<bool, LocationError> {
        if command != "games.lobby.propose_game" {
            return handle_base_request(self, session, command, data);
        }

        let player_ids = data
            .get("players")
            .and_then(Value::as_array)
            .ok_or_else(|| LocationError::BadRequest("proposal without players".to_string()))?
            .iter()
            .map(|id| {
                id.as_u64()
                    .ok_or_else(|| LocationError::BadRequest(format!("invalid player id {}", id)))
            })
            .collect::<Result<Vec<SessionId>, _>>()?;

        match self.propose_game(session, &player_ids) {
            Ok(_) => Ok(true),
            Err(ProposalError::PlayerCount(message)) => {
                ui::say(session, &message);
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn settle() {
        for _ in 0..40 {
            tokio::task::yield_now().await;
        }
    }

    struct Table {
        core: LocationCore,
    }

    impl Location for Table {
        fn core(&self) -> &LocationCore {
            &self.core
        }

        fn kind(&self) -> &'static str {
            "table"
        }
    }

    /// Records the games it is asked to create.
    #[derive(Default)]
    struct Recorder {
        created: Mutex<Vec<Vec<SessionId>>>,
    }

    impl GameFactory for Recorder {
        fn identifier(&self) -> &str {
            "test"
        }

        fn create(
            &self,
            registry: &Arc<LocationRegistry>,
            sessions: &[Arc<Session>],
            settings: GameSettings,
            _lobby: Weak<dyn Location>,
        ) -> Result<Arc<dyn Location>, GameError> {
            self.created.lock().push(sessions.iter().map(|s| s.id()).collect());
            let table: Arc<dyn Location> = Arc::new(Table {
                core: LocationCore::new(registry, settings.options),
            });
            registry.register(Arc::clone(&table));
            for session in sessions {
                session.move_to(Some(Arc::clone(&table)));
            }
            Ok(table)
        }
    }

    struct Fixture {
        _registry: Arc<LocationRegistry>,
        lobby: Arc<Lobby>,
        recorder: Arc<Recorder>,
        sessions: Vec<Arc<Session>>,
    }

    impl Fixture {
        fn new(min: usize, max: usize, names: &[&str]) -> Self {
            let registry = LocationRegistry::new();
            let recorder = Arc::new(Recorder::default());
            let lobby = Lobby::new(&registry, GameSettings::default(), recorder.clone(), min, max).unwrap();
            let sessions: Vec<Arc<Session>> = names
                .iter()
                .enumerate()
                .map(|(i, name)| Arc::new(Session::new(i as u64 + 1, *name, false)))
                .collect();
            for session in &sessions {
                session.move_to(Some(lobby.clone()));
                session.take_messages();
            }
            Self {
                _registry: registry,
                lobby,
                recorder,
                sessions,
            }
        }

        fn session(&self, index: usize) -> &Arc<Session> {
            &self.sessions[index]
        }
    }

    fn questions(session: &Session) -> Vec<String> {
        session
            .pending_queries()
            .iter()
            .filter_map(|q| q["question"].as_str().map(str::to_string))
            .collect()
    }

    fn answer(session: &Session, value: Value) {
        let id = session
            .pending_queries()
            .last()
            .and_then(|q| q["id"].as_u64())
            .unwrap();
        session.post_response(session.epoch(), &json!({"id": id, "value": value})).unwrap();
    }

    fn said(session: &Session) -> Vec<String> {
        session
            .take_messages()
            .iter()
            .filter(|m| m["command"] == "say")
            .filter_map(|m| m["message"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_invalid_player_range() {
        let registry = LocationRegistry::new();
        let recorder: Arc<dyn GameFactory> = Arc::new(Recorder::default());
        let err = Lobby::new(&registry, GameSettings::default(), Arc::clone(&recorder), 3, 2).err();
        assert_eq!(err, Some(LobbyError::InvalidPlayerRange { min: 3, max: 2 }));
        assert!(Lobby::new(&registry, GameSettings::default(), recorder, 0, 2).is_err());
    }

    #[test]
    fn test_join_and_leave_are_announced() {
        let f = Fixture::new(1, 2, &["Alice"]);
        let bob = Arc::new(Session::new(2, "Bob", false));

        bob.move_to(Some(f.lobby.clone()));

        assert!(f.session(0).take_messages().contains(&json!({
            "command": "games.lobby.client_joins",
            "client_id": 2,
            "client_name": "Bob",
        })));
        assert!(bob.take_messages().contains(&json!({
            "command": "games.lobby.init",
            "clients": {"1": "Alice", "2": "Bob"},
            "min_players": 1,
            "max_players": 2,
        })));

        bob.move_to(None);
        assert_eq!(
            f.session(0).take_messages(),
            vec![json!({"command": "games.lobby.client_leaves", "client_id": 2})]
        );
        assert!(f.lobby.core().is_persistent());
    }

    #[tokio::test]
    async fn test_decline_cancels_proposal() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let (alice, bob) = (f.session(0), f.session(1));

        f.lobby.propose_game(alice, &[2]).unwrap();
        settle().await;
        assert_eq!(questions(alice), vec!["Do you want to start a game with Bob?"]);
        assert_eq!(questions(bob), vec!["Do you want to start a game with Alice?"]);

        answer(bob, json!(1));
        settle().await;

        assert_eq!(said(bob), vec!["You decline."]);
        assert!(!alice.has_pending_queries());
        assert_eq!(said(alice), vec!["Bob declines."]);
        assert!(f.lobby.proposals().is_empty());
        assert!(f.recorder.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_accept_after_decline_starts_nothing() {
        let f = Fixture::new(3, 3, &["Alice", "Bob", "Carol"]);
        let (alice, bob, carol) = (f.session(0), f.session(1), f.session(2));
        let proposal = f.lobby.propose_game(alice, &[2, 3]).unwrap();
        settle().await;
        answer(alice, json!(0));
        settle().await;
        carol.take_messages();

        answer(carol, json!(0));
        answer(bob, json!(1));
        settle().await;

        assert!(proposal.is_declined());
        assert!(!proposal.is_accepted());
        assert!(f.recorder.created.lock().is_empty());
        assert!(!alice.has_pending_queries());
        assert!(!carol.has_pending_queries());
        assert!(said(carol).contains(&"Bob declines.".to_string()));
        assert!(f.lobby.proposals().is_empty());
    }

    #[tokio::test]
    async fn test_everyone_accepts_starts_one_game() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let (alice, bob) = (f.session(0), f.session(1));
        let proposal = f.lobby.propose_game(alice, &[2]).unwrap();
        settle().await;

        answer(alice, json!(0));
        settle().await;
        assert_eq!(proposal.accepted(), vec![1]);
        assert_eq!(alice.pending_queries()[0]["command"], "ui.link");
        assert_eq!(said(bob), vec!["Alice accepts."]);

        answer(bob, json!("0"));
        settle().await;

        assert!(proposal.is_accepted());
        assert_eq!(*f.recorder.created.lock(), vec![vec![1, 2]]);
        assert!(!alice.has_pending_queries());
        assert_eq!(alice.location().map(|l| l.kind()), Some("table"));
        assert_eq!(bob.location().map(|l| l.kind()), Some("table"));
        assert!(f.lobby.proposals().is_empty());
        assert_eq!(f.lobby.games().len(), 1);
        assert_eq!(f.lobby.core().member_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_link_declines() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let (alice, bob) = (f.session(0), f.session(1));
        f.lobby.propose_game(alice, &[2]).unwrap();
        settle().await;
        answer(alice, json!(0));
        settle().await;
        bob.take_messages();

        answer(alice, Value::Null);
        settle().await;

        assert_eq!(said(alice), vec!["You decline."]);
        assert!(!bob.has_pending_queries());
        assert_eq!(said(bob), vec!["Alice declines."]);

        assert!(f.recorder.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shared_candidate_is_asked_once_at_a_time() {
        let f = Fixture::new(2, 3, &["Alice", "Bob", "Carol"]);
        let (alice, bob, carol) = (f.session(0), f.session(1), f.session(2));

        let first = f.lobby.propose_game(alice, &[2]).unwrap();
        let second = f.lobby.propose_game(carol, &[2]).unwrap();
        settle().await;

        assert_eq!(questions(bob), vec!["Do you want to start a game with Alice?"]);
        assert_eq!(questions(carol), vec!["Do you want to start a game with Bob?"]);

        answer(bob, json!(1));
        settle().await;

        assert!(first.is_declined());
        assert!(!second.is_declined());
        assert_eq!(questions(bob), vec!["Do you want to start a game with Carol?"]);
    }

    #[tokio::test]
    async fn test_leaving_lobby_declines() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let (alice, bob) = (f.session(0), f.session(1));
        let proposal = f.lobby.propose_game(alice, &[2]).unwrap();
        settle().await;

        bob.move_to(None);
        settle().await;

        assert!(proposal.is_declined());
        assert!(!alice.has_pending_queries());
        assert_eq!(said(alice), vec!["Bob declines."]);
    }

    #[tokio::test]
    async fn test_reconnect_repeats_prompt_after_accept() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let alice = f.session(0);
        f.lobby.propose_game(alice, &[2]).unwrap();
        settle().await;
        answer(alice, json!(0));
        settle().await;

        alice.handle_new_connection();

        let replay = alice.take_messages();
        assert!(replay.contains(&json!({"command": "say", "message": "Do you want to start a game with Bob?"})));
        assert_eq!(replay.last().map(|m| m["command"].clone()), Some(json!("ui.link")));
    }

    #[tokio::test]
    async fn test_solitaire_prompt() {
        let f = Fixture::new(1, 2, &["Alice"]);
        f.lobby.propose_game(f.session(0), &[]).unwrap();
        settle().await;

        assert_eq!(questions(f.session(0)), vec!["Do you want to start a solitaire game?"]);
    }

    #[tokio::test]
    async fn test_player_count_is_checked() {
        let f = Fixture::new(2, 2, &["Alice", "Bob"]);
        let alice = f.session(0);

        let handled = f
            .lobby
            .handle_request(alice, "games.lobby.propose_game", &json!({"players": []}))
            .unwrap();

        assert!(handled);
        assert_eq!(said(alice), vec!["You need to select exactly 1 other player."]);
        assert!(f.lobby.proposals().is_empty());

        let f = Fixture::new(2, 3, &["A", "B", "C", "D"]);
        let err = f.lobby.propose_game(f.session(0), &[2, 3, 4]).err();
        assert_eq!(
            err,
            Some(ProposalError::PlayerCount("You need to select at most 2 other players.".to_string()))
        );
        let f = Fixture::new(3, 4, &["A", "B", "C"]);
        let err = f.lobby.propose_game(f.session(0), &[2]).err();
        assert_eq!(
            err,
            Some(ProposalError::PlayerCount("You need to select at least 2 other players.".to_string()))
        );
    }

    #[test]
    fn test_malformed_proposal() {
        let f = Fixture::new(1, 2, &["Alice"]);
        let err = f
            .lobby
            .handle_request(f.session(0), "games.lobby.propose_game", &json!({"players": ["x"]}))
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_proposer_must_be_member() {
        let f = Fixture::new(1, 2, &["Alice"]);
        let stranger = Arc::new(Session::new(9, "Eve", false));
        assert_eq!(
            f.lobby.propose_game(&stranger, &[1]).err(),
            Some(ProposalError::ProposerNotInLobby)
        );
    }
}
