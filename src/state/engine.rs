//! Turn engine.
//!
//! A game declares named [`State`]s. The engine enters a state, optionally
//! runs its `pre` hook, wakes the players one after another (or all at
//! once), waits until every woken player is done, runs `post` and moves on
//! to the state named by `next`. [`STOP`] is terminal.
//!
//! ```text
//!   Enter(name) ──condition false──────────────────────────┐
//!       │                                                  │
//!       ▼ pre ──SwitchTo(other)──▶ Enter(other)            │
//!       │                                                  │
//!       ▼ wake targets                                     │
//!   ┌───────────────────────────────┐                      │
//!   │ sequential: one at a time,    │                      │
//!   │   next only after player_done │                      │
//!   │ simultaneous: all at once,    │                      │
//!   │   done when all have finished │                      │
//!   └───────────────┬───────────────┘                      │
//!                   ▼ post                                 │
//!               Enter(next) ◀──────────────────────────────┘
//! ```
//!
//! A woken player either finishes on the spot ([`Wake::Done`]), reports
//! later through `player_done` ([`Wake::Deferred`]), or runs an async
//! action ([`Wake::Pending`]) whose result is applied when it completes.
//! Completions carry a ticket, so a result arriving after its player
//! resigned or after the game ended is ignored.
//!
//! The engine itself never blocks and never spawns; it returns [`Effect`]s
//! for the owning game to carry out once its lock is released.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::game::GameError;
use super::interaction::{CancelReason, Cancelled};
use super::player::Player;
use super::session::SessionId;
use super::waiting::WaitingMessagesManager;

/// Name of a declared state.
pub type StateName = &'static str;

/// Entered when the game starts. Added automatically when not declared.
pub const INIT: StateName = "INIT";

/// Terminal state; reaching it ends the game.
pub const STOP: StateName = "STOP";

/// Identifies one wake-up of one player.
pub type Ticket = u64;

/// Signals raised inside a turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The player sent a move outside the options they were given
    #[error("It looks like {name} tried to cheat ({description}).")]
    Cheater {
        player: SessionId,
        name: String,
        description: String,
    },

    /// Stop the game immediately
    #[error("The game ends.")]
    EndGame,

    /// A query of the player was cancelled
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("{0}")]
    Failed(String),
}

/// Result of a `pre` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    /// Jump to another state, skipping this one's wake-up, `post` and `next`
    SwitchTo(StateName),
}

/// What the game wants after a player resigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterResignation {
    Continue,
    EndGame,
}

/// Outcome of a rules-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Unhandled,
    Handled,
    /// Handled, and the requesting player finished its turn
    TurnDone,
}

/// How a woken player proceeds.
pub enum Wake<A> {
    /// Finished already
    Done,
    /// Will be reported through `player_done`
    Deferred,
    /// Done when the future completes; its action is then applied
    Pending(BoxFuture<'static, Result<A, TurnError>>),
}

impl<A> Wake<A> {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<A, TurnError>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

/// Where a state goes when it is done.
pub enum Next<R> {
    To(StateName),
    With(fn(&R, &Table) -> StateName),
}

/// A declared state.
pub struct State<R> {
    name: StateName,
    condition: Option<fn(&R, &Table) -> bool>,
    pre: Option<fn(&mut R, &mut Table) -> Result<Transition, TurnError>>,
    post: Option<fn(&mut R, &mut Table) -> Result<(), TurnError>>,
    next: Next<R>,
    wake_players: bool,
    wake_all: bool,
    simultaneous: bool,
    show_waiting_for: bool,
    waiting_message: Option<&'static str>,
}

impl<R> State<R> {
    /// A state that wakes the active players in order and then stops.
    pub fn new(name: StateName) -> Self {
        Self {
            name,
            condition: None,
            pre: None,
            post: None,
            next: Next::To(STOP),
            wake_players: true,
            wake_all: false,
            simultaneous: false,
            show_waiting_for: false,
            waiting_message: None,
        }
    }

    pub fn name(&self) -> StateName {
        self.name
    }

    /// Skip the state (straight to `next`) when this returns false.
    pub fn condition(mut self, condition: fn(&R, &Table) -> bool) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn pre(mut self, pre: fn(&mut R, &mut Table) -> Result<Transition, TurnError>) -> Self {
        self.pre = Some(pre);
        self
    }

    pub fn post(mut self, post: fn(&mut R, &mut Table) -> Result<(), TurnError>) -> Self {
        self.post = Some(post);
        self
    }

    pub fn next(mut self, next: StateName) -> Self {
        self.next = Next::To(next);
        self
    }

    pub fn next_with(mut self, next: fn(&R, &Table) -> StateName) -> Self {
        self.next = Next::With(next);
        self
    }

    /// Do not wake anybody; go from `pre` straight to `post`.
    pub fn no_wake(mut self) -> Self {
        self.wake_players = false;
        self
    }

    /// Wake resigned players too.
    pub fn wake_all(mut self) -> Self {
        self.wake_all = true;
        self
    }

    /// Wake every target at once instead of one after another.
    pub fn simultaneous(mut self) -> Self {
        self.simultaneous = true;
        self
    }

    /// Show the others who the game is waiting for.
    pub fn show_waiting_for(mut self) -> Self {
        self.show_waiting_for = true;
        self
    }

    /// Like [`show_waiting_for`](Self::show_waiting_for) with a custom
    /// template (`{}` is the player's name).
    pub fn waiting_message(mut self, template: &'static str) -> Self {
        self.show_waiting_for = true;
        self.waiting_message = Some(template);
        self
    }
}

/// Game-specific behavior plugged into the engine.
///
/// Only [`states`](GameRules::states) and [`wake`](GameRules::wake) are
/// required.
pub trait GameRules: Send + Sized + 'static {
    /// Result of an async player action, applied by [`apply`](GameRules::apply).
    type Action: Send + 'static;

    fn states(&self) -> Vec<State<Self>>;

    /// Wake `player` in `state`.
    fn wake(
        &mut self,
        table: &mut Table,
        state: StateName,
        player: &Player,
    ) -> Result<Wake<Self::Action>, TurnError>;

    /// Apply the result of a [`Wake::Pending`] action.
    fn apply(
        &mut self,
        _table: &mut Table,
        _state: StateName,
        _player: &Player,
        _action: Self::Action,
    ) -> Result<(), TurnError> {
        Ok(())
    }

    /// Game-specific requests from a player.
    fn handle_request(
        &mut self,
        _table: &mut Table,
        _player: &Player,
        _command: &str,
        _data: &Value,
    ) -> Result<RequestOutcome, TurnError> {
        Ok(RequestOutcome::Unhandled)
    }

    /// Called after `player` left the active players.
    fn after_resignation(&mut self, _table: &mut Table, _player: &Player) -> AfterResignation {
        AfterResignation::Continue
    }

    /// Winners announced at the end.
    fn winners(&self, _table: &Table) -> Vec<SessionId> {
        Vec::new()
    }

    fn game_ui_update(&self, _table: &Table) -> Option<Value> {
        None
    }

    /// What `player` alone may see (e.g. their hand).
    fn private_ui_update(&self, _table: &Table, _player: &Player) -> Option<Value> {
        None
    }

    /// What everyone may see about `player`.
    fn public_ui_update(&self, _table: &Table, _player: &Player) -> Option<Value> {
        None
    }

    fn cheat(&mut self, _table: &mut Table, _player: &Player, _command: &str) {}

    /// Called exactly once, when the game ends.
    fn on_game_end(&mut self, _table: &Table) {}
}

/// The players of a game as the rules see them.
#[derive(Debug)]
pub struct Table {
    identifier: String,

    /// Active players in turn order
    players: Vec<Player>,

    /// Every player, including resigned ones, in seat order
    all_players: Vec<Player>,

    state: StateName,
}

impl Table {
    pub fn new(identifier: impl Into<String>, players: Vec<Player>) -> Self {
        Self {
            identifier: identifier.into(),
            all_players: players.clone(),
            players,
            state: INIT,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The current state.
    pub fn state(&self) -> StateName {
        self.state
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn all_players(&self) -> &[Player] {
        &self.all_players
    }

    pub fn player(&self, id: SessionId) -> Option<&Player> {
        self.all_players.iter().find(|p| p.id() == id)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.players.iter().any(|p| p.id() == id)
    }

    pub fn player_ids(&self) -> Vec<SessionId> {
        self.players.iter().map(Player::id).collect()
    }

    /// Reorder the active players, e.g. so the trick winner leads.
    ///
    /// `order` must name every active player exactly once.
    pub fn set_player_order(&mut self, order: &[SessionId]) -> Result<(), GameError> {
        let mut current = self.player_ids();
        let mut wanted = order.to_vec();
        current.sort_unstable();
        wanted.sort_unstable();
        if current != wanted {
            return Err(GameError::InvalidPlayerOrder);
        }

        let mut reordered = Vec::with_capacity(order.len());
        for id in order {
            if let Some(player) = self.players.iter().find(|p| p.id() == *id) {
                reordered.push(player.clone());
            }
        }
        self.players = reordered;
        Ok(())
    }

    /// Send `message` to every player, resigned ones included.
    pub fn broadcast(&self, message: &Value) {
        for player in &self.all_players {
            player.send(message.clone());
        }
    }

    fn remove_active(&mut self, id: SessionId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.id() != id);
        self.players.len() != before
    }
}

/// Work for the owning game to do after releasing its lock.
pub(crate) enum Effect<A> {
    /// Run a player's async action and report it with `action_finished`
    Spawn {
        player: SessionId,
        ticket: Ticket,
        future: BoxFuture<'static, Result<A, TurnError>>,
    },
    /// A system message for every member of the game
    Announce(String),
    /// The game reached its end
    Finished { winners: Vec<Player> },
}

pub(crate) type Effects<A> = Vec<Effect<A>>;

#[derive(Debug, Clone, Copy)]
enum Step {
    Enter(StateName),
    Wake,
    Leave,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Busy,
    Sequential {
        targets: Vec<SessionId>,
        index: usize,
        wake_all: bool,
    },
    Simultaneous {
        targets: Vec<SessionId>,
        finished: HashSet<SessionId>,
        wake_all: bool,
    },
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct Awake {
    ticket: Ticket,
    shows_waiting: bool,
}

/// The state machine of one game.
pub(crate) struct Engine<R: GameRules> {
    rules: R,
    table: Table,
    states: Arc<HashMap<StateName, State<R>>>,
    phase: Phase,
    awake: HashMap<SessionId, Awake>,
    next_ticket: Ticket,
    running: bool,
    history: Vec<StateName>,
    winners: Vec<Player>,
    waiting: WaitingMessagesManager,
}

impl<R: GameRules> Engine<R> {
    /// Collect and check the declared states.
    pub(crate) fn new(rules: R, table: Table) -> Result<Self, GameError> {
        let declared = rules.states();
        let first = declared.first().map(State::name);

        let mut states = HashMap::new();
        for state in declared {
            if state.name == STOP {
                return Err(GameError::ReservedState);
            }
            states.insert(state.name, state);
        }
        if !states.contains_key(INIT) {
            let after = first.unwrap_or(STOP);
            states.insert(INIT, State::new(INIT).no_wake().next(after));
        }
        for state in states.values() {
            if let Next::To(target) = state.next {
                if target != STOP && !states.contains_key(target) {
                    return Err(GameError::UnknownState(target.to_string()));
                }
            }
        }

        let waiting = WaitingMessagesManager::new(table.all_players.clone());
        Ok(Self {
            rules,
            table,
            states: Arc::new(states),
            phase: Phase::Idle,
            awake: HashMap::new(),
            next_ticket: 1,
            running: false,
            history: Vec::new(),
            winners: Vec::new(),
            waiting,
        })
    }

    pub(crate) fn rules(&self) -> &R {
        &self.rules
    }

    pub(crate) fn table(&self) -> &Table {
        &self.table
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn has_ended(&self) -> bool {
        matches!(self.phase, Phase::Stopped)
    }

    pub(crate) fn history(&self) -> &[StateName] {
        &self.history
    }

    /// Winners, once the game ended.
    pub(crate) fn winners(&self) -> &[Player] {
        &self.winners
    }

    /// Players the engine is currently waiting for.
    pub(crate) fn awake_players(&self) -> Vec<SessionId> {
        let mut awake: Vec<SessionId> = self.awake.keys().copied().collect();
        awake.sort_unstable();
        awake
    }

    pub(crate) fn waiting(&self) -> &WaitingMessagesManager {
        &self.waiting
    }

    pub(crate) fn start(&mut self) -> Result<Effects<R::Action>, GameError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(GameError::AlreadyStarted);
        }
        self.running = true;
        let mut effects = Vec::new();
        self.drive(Step::Enter(INIT), &mut effects);
        Ok(effects)
    }

    /// A [`Wake::Deferred`] player reports that it is done.
    pub(crate) fn player_done(&mut self, id: SessionId) -> Result<Effects<R::Action>, GameError> {
        if !self.running {
            return Err(GameError::NotRunning);
        }
        match &self.phase {
            Phase::Sequential { targets, index, .. } => match targets.get(*index) {
                Some(&current) if current != id => {
                    return Err(GameError::OutOfTurn {
                        expected: current,
                        got: id,
                    })
                }
                Some(_) => {}
                None => return Err(GameError::NotWaiting),
            },
            Phase::Simultaneous { .. } => {}
            _ => return Err(GameError::NotWaiting),
        }
        if !self.awake.contains_key(&id) {
            return Err(GameError::NotAwake(id));
        }

        let mut effects = Vec::new();
        self.complete(id, &mut effects);
        Ok(effects)
    }

    /// A [`Wake::Pending`] action finished.
    pub(crate) fn action_finished(
        &mut self,
        id: SessionId,
        ticket: Ticket,
        result: Result<R::Action, TurnError>,
    ) -> Effects<R::Action> {
        let mut effects = Vec::new();
        if !self.running {
            return effects;
        }
        if self.awake.get(&id).map(|a| a.ticket) != Some(ticket) {
            tracing::debug!(game = %self.table.identifier, player = id, ticket, "ignoring stale action");
            return effects;
        }

        let result = result.and_then(|action| {
            let state = self.table.state;
            match self.table.player(id).cloned() {
                Some(player) => self.rules.apply(&mut self.table, state, &player, action),
                None => Ok(()),
            }
        });
        match result {
            Ok(()) => self.complete(id, &mut effects),
            Err(e) => {
                self.absorb_player_error(id, e, &mut effects);
                self.resume(&mut effects);
            }
        }
        effects
    }

    /// Remove `id` from the active players.
    pub(crate) fn resign(&mut self, id: SessionId) -> Result<Effects<R::Action>, GameError> {
        if self.table.player(id).is_none() {
            return Err(GameError::NotPlayer(id));
        }
        if !self.running {
            return Err(GameError::NotRunning);
        }
        let mut effects = Vec::new();
        if self.table.is_active(id) {
            self.resign_player(id, &mut effects);
            self.resume(&mut effects);
        }
        Ok(effects)
    }

    /// End the game now.
    pub(crate) fn end_game(&mut self) -> Effects<R::Action> {
        let mut effects = Vec::new();
        self.finish(&mut effects);
        effects
    }

    pub(crate) fn handle_request(
        &mut self,
        id: SessionId,
        command: &str,
        data: &Value,
    ) -> Result<(bool, Effects<R::Action>), GameError> {
        let Some(player) = self.table.player(id).cloned() else {
            return Ok((false, Vec::new()));
        };
        let mut effects = Vec::new();
        match self.rules.handle_request(&mut self.table, &player, command, data) {
            Ok(RequestOutcome::Unhandled) => Ok((false, effects)),
            Ok(RequestOutcome::Handled) => Ok((true, effects)),
            Ok(RequestOutcome::TurnDone) => Ok((true, self.player_done(id)?)),
            Err(TurnError::Failed(message)) => Err(GameError::Rules(message)),
            Err(e) => {
                self.absorb_player_error(id, e, &mut effects);
                self.resume(&mut effects);
                Ok((true, effects))
            }
        }
    }

    pub(crate) fn cheat(&mut self, id: SessionId, command: &str) {
        if let Some(player) = self.table.player(id).cloned() {
            self.rules.cheat(&mut self.table, &player, command);
        }
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    fn drive(&mut self, mut step: Step, effects: &mut Effects<R::Action>) {
        let states = Arc::clone(&self.states);
        while self.running {
            let next = match step {
                Step::Enter(STOP) => {
                    self.finish(effects);
                    None
                }
                Step::Enter(name) => match states.get(name) {
                    Some(state) => self.enter(state, effects),
                    None => {
                        self.fail(format!("Unknown state '{}'.", name), effects);
                        self.finish(effects);
                        None
                    }
                },
                Step::Wake | Step::Leave => match states.get(self.table.state) {
                    Some(state) if matches!(step, Step::Wake) => self.wake_targets(state, effects),
                    Some(state) => self.leave(state, effects),
                    None => None,
                },
            };
            match next {
                Some(following) => step = following,
                None => return,
            }
        }
    }

    fn enter(&mut self, state: &State<R>, effects: &mut Effects<R::Action>) -> Option<Step> {
        self.table.state = state.name;
        self.phase = Phase::Busy;

        if let Some(condition) = state.condition {
            if !condition(&self.rules, &self.table) {
                tracing::debug!(game = %self.table.identifier, state = state.name, "skip state");
                return Some(Step::Enter(self.next_of(state)));
            }
        }
        tracing::debug!(game = %self.table.identifier, state = state.name, "enter state");
        self.history.push(state.name);

        if let Some(pre) = state.pre {
            match pre(&mut self.rules, &mut self.table) {
                Ok(Transition::Continue) => {}
                Ok(Transition::SwitchTo(other)) => return Some(Step::Enter(other)),
                Err(e) => {
                    if !self.absorb(e, effects) {
                        return None;
                    }
                }
            }
        }

        if state.wake_players {
            Some(Step::Wake)
        } else {
            Some(Step::Leave)
        }
    }

    fn leave(&mut self, state: &State<R>, effects: &mut Effects<R::Action>) -> Option<Step> {
        self.phase = Phase::Busy;
        if let Some(post) = state.post {
            if let Err(e) = post(&mut self.rules, &mut self.table) {
                if !self.absorb(e, effects) {
                    return None;
                }
            }
        }
        Some(Step::Enter(self.next_of(state)))
    }

    fn next_of(&self, state: &State<R>) -> StateName {
        match state.next {
            Next::To(name) => name,
            Next::With(next) => next(&self.rules, &self.table),
        }
    }

    fn wake_targets(&mut self, state: &State<R>, effects: &mut Effects<R::Action>) -> Option<Step> {
        let targets: Vec<SessionId> = if state.wake_all {
            self.table.all_players.iter().map(Player::id).collect()
        } else {
            self.table.player_ids()
        };
        if targets.is_empty() {
            return Some(Step::Leave);
        }

        if state.simultaneous {
            self.phase = Phase::Simultaneous {
                targets: targets.clone(),
                finished: HashSet::new(),
                wake_all: state.wake_all,
            };
            for id in targets {
                if !self.running {
                    return None;
                }
                if self.is_target(id) {
                    self.wake_one(state, id, effects);
                }
            }
            (self.running && self.phase_complete()).then_some(Step::Leave)
        } else {
            self.phase = Phase::Sequential {
                targets,
                index: 0,
                wake_all: state.wake_all,
            };
            self.advance(state, effects)
        }
    }

    /// Wake sequential targets until one has to be waited for.
    fn advance(&mut self, state: &State<R>, effects: &mut Effects<R::Action>) -> Option<Step> {
        loop {
            if !self.running {
                return None;
            }
            let Phase::Sequential { targets, index, .. } = &mut self.phase else {
                return None;
            };
            let Some(&id) = targets.get(*index) else {
                return Some(Step::Leave);
            };
            if self.awake.contains_key(&id) {
                return None;
            }
            if !state.wake_all && !self.table.is_active(id) {
                *index += 1;
                continue;
            }
            if self.wake_one(state, id, effects) {
                return None;
            }
        }
    }

    /// Wake one player. Returns true when the engine has to wait for it.
    fn wake_one(&mut self, state: &State<R>, id: SessionId, effects: &mut Effects<R::Action>) -> bool {
        let Some(player) = self.table.player(id).cloned() else {
            self.mark_done(id);
            return false;
        };
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.awake.insert(
            id,
            Awake {
                ticket,
                shows_waiting: false,
            },
        );
        tracing::debug!(game = %self.table.identifier, state = state.name, player = id, ticket, "wake");

        match self.rules.wake(&mut self.table, state.name, &player) {
            Ok(Wake::Done) => {
                self.mark_done(id);
                false
            }
            Ok(Wake::Deferred) => {
                self.start_waiting(state, id);
                true
            }
            Ok(Wake::Pending(future)) => {
                self.start_waiting(state, id);
                effects.push(Effect::Spawn {
                    player: id,
                    ticket,
                    future,
                });
                true
            }
            Err(e) => {
                self.absorb_player_error(id, e, effects);
                false
            }
        }
    }

    /// Start the waiting message of an awake player, if the state shows one.
    fn start_waiting(&mut self, state: &State<R>, id: SessionId) {
        if !state.show_waiting_for {
            return;
        }
        if let Some(awake) = self.awake.get_mut(&id) {
            awake.shows_waiting = true;
            self.waiting.start_activity(id, state.waiting_message);
        }
    }

    /// Record that `id` finished its part of the current state.
    fn mark_done(&mut self, id: SessionId) {
        if let Some(awake) = self.awake.remove(&id) {
            if awake.shows_waiting {
                self.waiting.end_activity(id);
            }
        }
        match &mut self.phase {
            Phase::Sequential { targets, index, .. } => {
                if targets.get(*index) == Some(&id) {
                    *index += 1;
                }
            }
            Phase::Simultaneous { finished, .. } => {
                finished.insert(id);
            }
            _ => {}
        }
    }

    fn complete(&mut self, id: SessionId, effects: &mut Effects<R::Action>) {
        self.mark_done(id);
        self.resume(effects);
    }

    /// Continue after a completion or resignation outside the drive loop.
    fn resume(&mut self, effects: &mut Effects<R::Action>) {
        if !self.running {
            return;
        }
        let states = Arc::clone(&self.states);
        let Some(state) = states.get(self.table.state) else {
            return;
        };
        let step = match self.phase {
            Phase::Sequential { .. } => self.advance(state, effects),
            Phase::Simultaneous { .. } => self.phase_complete().then_some(Step::Leave),
            _ => None,
        };
        if let Some(step) = step {
            self.drive(step, effects);
        }
    }

    fn is_target(&self, id: SessionId) -> bool {
        match &self.phase {
            Phase::Sequential { targets, .. } | Phase::Simultaneous { targets, .. } => {
                targets.contains(&id)
            }
            _ => false,
        }
    }

    fn phase_complete(&self) -> bool {
        match &self.phase {
            Phase::Sequential { targets, index, .. } => *index >= targets.len(),
            Phase::Simultaneous {
                targets, finished, ..
            } => targets.iter().all(|t| finished.contains(t)),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Failures, resignation and the end
    // ------------------------------------------------------------------

    /// Handle an error from a state hook. Returns false when the game ended.
    fn absorb(&mut self, e: TurnError, effects: &mut Effects<R::Action>) -> bool {
        match e {
            TurnError::EndGame => self.finish(effects),
            TurnError::Cheater { player, .. } => {
                tracing::warn!(game = %self.table.identifier, player, "{}", e);
                effects.push(Effect::Announce(e.to_string()));
                self.resign_player(player, effects);
            }
            TurnError::Cancelled(_) => {}
            TurnError::Failed(message) => self.fail(message, effects),
        }
        self.running
    }

    /// Handle an error raised while `id` was awake.
    fn absorb_player_error(&mut self, id: SessionId, e: TurnError, effects: &mut Effects<R::Action>) {
        match e {
            TurnError::Cheater { player, .. } => {
                tracing::warn!(game = %self.table.identifier, player, "{}", e);
                effects.push(Effect::Announce(e.to_string()));
                let active = self.table.is_active(player);
                self.resign_player(player, effects);
                if player != id || !active {
                    self.mark_done(id);
                }
            }
            TurnError::EndGame => self.finish(effects),
            TurnError::Cancelled(_) => self.mark_done(id),
            TurnError::Failed(message) => {
                self.fail(message, effects);
                self.mark_done(id);
            }
        }
    }

    fn fail(&self, message: String, effects: &mut Effects<R::Action>) {
        tracing::error!(game = %self.table.identifier, state = self.table.state, %message, "turn failed");
        effects.push(Effect::Announce(format!(
            "An error occurred. Expect weird things. [{}]",
            message
        )));
    }

    /// Take `id` out of the active players and fix up the current phase.
    ///
    /// Outside a `wake_all` state the player leaves the wake targets; inside
    /// one a resigning player counts as finished.
    fn resign_player(&mut self, id: SessionId, effects: &mut Effects<R::Action>) {
        let Some(player) = self.table.player(id).cloned() else {
            return;
        };
        let was_active = self.table.remove_active(id);
        let was_awake = self.awake.remove(&id).is_some();
        self.waiting.clear_player(id);

        match &mut self.phase {
            Phase::Sequential {
                targets,
                index,
                wake_all,
            } => {
                if let Some(pos) = targets.iter().position(|t| *t == id) {
                    if *wake_all {
                        if pos == *index && was_awake {
                            *index += 1;
                        }
                    } else {
                        targets.remove(pos);
                        if pos < *index {
                            *index -= 1;
                        }
                    }
                }
            }
            Phase::Simultaneous {
                targets,
                finished,
                wake_all,
            } => {
                if *wake_all {
                    if targets.contains(&id) {
                        finished.insert(id);
                    }
                } else {
                    targets.retain(|t| *t != id);
                    finished.remove(&id);
                }
            }
            _ => {}
        }

        if !was_active {
            return;
        }
        tracing::info!(game = %self.table.identifier, player = id, "player resigned");
        player.session().cancel_interactions(CancelReason::Resigned);
        effects.push(Effect::Announce(format!("{} resigns.", player.name())));

        let verdict = self.rules.after_resignation(&mut self.table, &player);
        if self.table.players.is_empty() || verdict == AfterResignation::EndGame {
            self.finish(effects);
        }
    }

    /// Reach the end exactly once.
    fn finish(&mut self, effects: &mut Effects<R::Action>) {
        if !self.running {
            return;
        }
        self.running = false;
        self.phase = Phase::Stopped;
        self.table.state = STOP;
        self.history.push(STOP);
        self.awake.clear();
        self.waiting.clear_all();

        let winners: Vec<Player> = self
            .rules
            .winners(&self.table)
            .into_iter()
            .filter_map(|id| self.table.player(id).cloned())
            .collect();
        self.rules.on_game_end(&self.table);
        tracing::info!(game = %self.table.identifier, winners = winners.len(), "game ended");
        self.winners = winners.clone();
        effects.push(Effect::Finished { winners });
    }
}
