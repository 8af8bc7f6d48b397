//! In-game players.
//!
//! A player is a session seated at a game. It does whatever the physical
//! player would do and talks to the browser through its session.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use super::engine::TurnError;
use super::session::{Session, SessionId};
use super::ui;

/// A session seated at a game.
#[derive(Debug, Clone)]
pub struct Player {
    session: Arc<Session>,
    seat: usize,
}

impl PartialEq for Player {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Player {}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.session.name())
    }
}

impl Player {
    pub fn new(session: Arc<Session>, seat: usize) -> Self {
        Self { session, seat }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// Seat number, fixed when the game is created.
    pub fn seat(&self) -> usize {
        self.seat
    }

    pub fn send(&self, message: Value) {
        self.session.send(message);
    }

    pub fn say(&self, message: &str) {
        ui::say(&self.session, message);
    }

    /// Build the error raised when this player sends an impossible move.
    pub fn cheater(&self, description: impl Into<String>) -> TurnError {
        TurnError::Cheater {
            player: self.id(),
            name: self.name().to_string(),
            description: description.into(),
        }
    }

    /// Ask the player to pick one of `answers`.
    ///
    /// Unlike [`ui::ask_choice`] this asks only once: the options come from
    /// the game, so an answer outside them means a tampered client.
    pub async fn choose(&self, question: &str, answers: &[String]) -> Result<usize, TurnError> {
        let value = self
            .session
            .query(
                "choice",
                json!({
                    "question": question,
                    "answers": answers,
                    "leave_question": false,
                }),
            )
            .await?;
        ui::parse_choice(&value, answers.len()).ok_or_else(|| {
            self.cheater(format!("answered {} to a question with {} options", value, answers.len()))
        })
    }

    pub async fn ask_yes_no(&self, question: &str) -> Result<bool, TurnError> {
        let answers = ["Yes".to_string(), "No".to_string()];
        Ok(self.choose(question, &answers).await? == 0)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id(),
            "name": self.name(),
            "seat": self.seat,
        })
    }
}
