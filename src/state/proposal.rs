//! Game proposals.
//!
//! A proposal asks every candidate, one invitation per candidate, whether
//! they want to play. Invitations go through a per-candidate lock owned by
//! the lobby, so a candidate named in two proposals is asked about the
//! second only once the first one is settled.
//!
//! When every candidate accepted, the lobby starts the game. A single
//! decline (or a candidate leaving the lobby) cancels the whole proposal.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::interaction::CancelReason;
use super::lobby::Lobby;
use super::location::Location;
use super::session::{Session, SessionId};
use super::text::english_join_list;
use super::ui;

/// Why a proposal could not be made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    /// Too few or too many players selected (the message is shown as is)
    #[error("{0}")]
    PlayerCount(String),

    #[error("You are not in this lobby.")]
    ProposerNotInLobby,
}

#[derive(Debug, Default)]
struct ProposalState {
    /// Candidates already asked; only they hear about a decline
    invited: HashSet<SessionId>,
    accepted: HashSet<SessionId>,
    is_accepted: bool,
    is_declined: bool,
}

/// A pending invitation to start a game.
pub struct Proposal {
    lobby: Weak<Lobby>,
    candidates: Vec<Arc<Session>>,
    state: Mutex<ProposalState>,
}

impl Proposal {
    pub(crate) fn new(lobby: Weak<Lobby>, candidates: Vec<Arc<Session>>) -> Arc<Self> {
        Arc::new(Self {
            lobby,
            candidates,
            state: Mutex::new(ProposalState::default()),
        })
    }

    pub fn candidates(&self) -> &[Arc<Session>] {
        &self.candidates
    }

    pub fn is_candidate(&self, id: SessionId) -> bool {
        self.candidates.iter().any(|c| c.id() == id)
    }

    pub fn is_accepted(&self) -> bool {
        self.state.lock().is_accepted
    }

    pub fn is_declined(&self) -> bool {
        self.state.lock().is_declined
    }

    /// Candidates who accepted so far.
    pub fn accepted(&self) -> Vec<SessionId> {
        let mut accepted: Vec<SessionId> = self.state.lock().accepted.iter().copied().collect();
        accepted.sort_unstable();
        accepted
    }

    /// Invite every candidate, then drop out of the lobby's list.
    pub(crate) async fn run(self: Arc<Self>) {
        let invitations = self.candidates.iter().map(|c| self.invite(Arc::clone(c)));
        futures::future::join_all(invitations).await;

        if let Some(lobby) = self.lobby.upgrade() {
            lobby.remove_proposal(&self);
        }
        tracing::debug!(candidates = self.candidates.len(), "proposal settled");
    }

    async fn invite(&self, candidate: Arc<Session>) {
        let Some(lock) = self.lobby.upgrade().map(|l| l.proposal_lock(candidate.id())) else {
            return;
        };
        let _guard = lock.lock_owned().await;

        {
            let mut state = self.state.lock();
            if state.is_declined {
                return;
            }
            state.invited.insert(candidate.id());
        }

        let prompt = self.prompt_for(&candidate);
        match ui::ask_yes_no(&candidate, &prompt, true).await {
            Ok(true) => self.accept(&candidate).await,
            Ok(false) => self.decline(&candidate),
            Err(cancelled) => {
                tracing::debug!(session = candidate.id(), %cancelled, "invitation cancelled");
            }
        }
    }

    async fn accept(&self, candidate: &Arc<Session>) {
        let everyone = {
            let mut state = self.state.lock();
            if state.is_declined || state.is_accepted {
                return;
            }
            state.accepted.insert(candidate.id());
            state.is_accepted = state.accepted.len() == self.candidates.len();
            state.is_accepted
        };

        if everyone {
            for c in &self.candidates {
                c.cancel_interactions(CancelReason::GameStarting);
            }
            self.start_game();
            return;
        }

        for other in self.invited_except(candidate.id()) {
            ui::say(&other, &format!("{} accepts.", candidate.name()));
        }
        if ui::link(candidate, "Cancel", "You accept.").await.is_ok() {
            self.decline(candidate);
        }
    }

    /// `decliner` turns the proposal down; nothing happens once accepted.
    pub(crate) fn decline(&self, decliner: &Session) {
        let invited = {
            let mut state = self.state.lock();
            if state.is_accepted || state.is_declined {
                return;
            }
            state.is_declined = true;
            state.accepted.remove(&decliner.id());
            state.invited.clone()
        };
        tracing::info!(session = decliner.id(), "proposal declined");

        for c in self.candidates.iter().filter(|c| invited.contains(&c.id())) {
            if c.id() == decliner.id() {
                ui::say(c, "You decline.");
            } else {
                c.cancel_interactions(CancelReason::ClientDeclined);
                ui::say(c, &format!("{} declines.", decliner.name()));
            }
        }
    }

    pub(crate) fn client_left_lobby(&self, session: &Session) {
        if self.is_candidate(session.id()) {
            self.decline(session);
        }
    }

    /// An accepted candidate lost the prompt with its page; say it again.
    pub(crate) fn handle_reconnect(&self, session: &Session) {
        if self.state.lock().accepted.contains(&session.id()) {
            ui::say(session, &self.prompt_for(session));
        }
    }

    fn invited_except(&self, id: SessionId) -> Vec<Arc<Session>> {
        let state = self.state.lock();
        self.candidates
            .iter()
            .filter(|c| c.id() != id && state.invited.contains(&c.id()))
            .cloned()
            .collect()
    }

    fn prompt_for(&self, session: &Session) -> String {
        if self.candidates.len() == 1 {
            return "Do you want to start a solitaire game?".to_string();
        }
        let others: Vec<&str> = self
            .candidates
            .iter()
            .filter(|c| c.id() != session.id())
            .map(|c| c.name())
            .collect();
        format!("Do you want to start a game with {}?", english_join_list(&others))
    }

    fn start_game(&self) {
        let Some(lobby) = self.lobby.upgrade() else {
            tracing::warn!("proposal accepted after its lobby went away");
            return;
        };
        if let Err(e) = lobby.start_game(&self.candidates) {
            tracing::error!(lobby = lobby.id(), error = %e, "could not start game");
            lobby.system_message(&format!("An error occurred. Expect weird things. [{}]", e));
        }
    }
}
