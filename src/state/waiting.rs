//! "Who are we waiting for" messages.
//!
//! Each player has a stack of activity messages: a nested sub-activity can
//! override the shown reason without losing the outer one. Players with a
//! non-empty stack are *active*; everyone else is *waiting* and is shown a
//! message naming the active players. When every player is active nobody is
//! waiting.
//!
//! Only sessions whose displayed text actually changes are sent anything.

use std::collections::HashMap;

use serde_json::json;

use super::player::Player;
use super::session::SessionId;
use super::text::{english_join_list, fill};

/// Permanent-message group used for the waiting message.
pub const WAITING_MESSAGE_GROUP: &str = "games.base.waiting_message";

/// Template when a single player is active.
pub const DEFAULT_MESSAGE: &str = "Waiting for {}.";

/// Template when several players are active.
pub const PLURAL_MESSAGE: &str = "Waiting for {} to finish.";

/// Tracks activity stacks and the waiting message each player sees.
#[derive(Debug)]
pub struct WaitingMessagesManager {
    /// Every player of the game, in seat order
    players: Vec<Player>,

    /// Activity stack per player (already resolved to a template)
    stacks: HashMap<SessionId, Vec<String>>,

    /// What each player currently has on screen
    displayed: HashMap<SessionId, String>,

    default_message: String,
    plural_message: String,
}

impl WaitingMessagesManager {
    pub fn new(players: Vec<Player>) -> Self {
        Self {
            players,
            stacks: HashMap::new(),
            displayed: HashMap::new(),
            default_message: DEFAULT_MESSAGE.to_string(),
            plural_message: PLURAL_MESSAGE.to_string(),
        }
    }

    /// Override the single and plural templates.
    pub fn with_messages(mut self, default_message: &str, plural_message: &str) -> Self {
        self.default_message = default_message.to_string();
        self.plural_message = plural_message.to_string();
        self
    }

    /// Push an activity for `player`; `None` uses the default template.
    pub fn start_activity(&mut self, player: SessionId, message: Option<&str>) {
        let template = message.unwrap_or(&self.default_message).to_string();
        self.stacks.entry(player).or_default().push(template);
        self.refresh();
    }

    /// Pop the innermost activity of `player`.
    pub fn end_activity(&mut self, player: SessionId) {
        if let Some(stack) = self.stacks.get_mut(&player) {
            stack.pop();
            if stack.is_empty() {
                self.stacks.remove(&player);
            }
        }
        self.refresh();
    }

    /// Drop every activity of `player` (e.g. on resignation).
    pub fn clear_player(&mut self, player: SessionId) {
        if self.stacks.remove(&player).is_some() {
            self.refresh();
        }
    }

    /// Drop every activity of every player.
    pub fn clear_all(&mut self) {
        self.stacks.clear();
        self.refresh();
    }

    /// Players with at least one activity, in seat order.
    pub fn active_players(&self) -> Vec<SessionId> {
        self.players
            .iter()
            .map(Player::id)
            .filter(|id| self.is_active(*id))
            .collect()
    }

    /// Players shown a waiting message, in seat order.
    pub fn waiting_players(&self) -> Vec<SessionId> {
        let active = self.active_players();
        if active.is_empty() || active.len() == self.players.len() {
            return Vec::new();
        }
        self.players
            .iter()
            .map(Player::id)
            .filter(|id| !active.contains(id))
            .collect()
    }

    pub fn several_players_are_active(&self) -> bool {
        self.active_players().len() > 1
    }

    /// The text waiting players see, if anyone is active.
    pub fn current_message(&self) -> Option<String> {
        let active: Vec<&Player> = self
            .players
            .iter()
            .filter(|p| self.is_active(p.id()))
            .collect();
        match active.as_slice() {
            [] => None,
            [only] => {
                let template = self.stacks.get(&only.id()).and_then(|s| s.last())?;
                Some(fill(template, only.name()))
            }
            several => {
                let names: Vec<&str> = several.iter().map(|p| p.name()).collect();
                Some(fill(&self.plural_message, &english_join_list(&names)))
            }
        }
    }

    /// What `player` currently has on screen.
    pub fn displayed_for(&self, player: SessionId) -> Option<&str> {
        self.displayed.get(&player).map(String::as_str)
    }

    fn is_active(&self, player: SessionId) -> bool {
        self.stacks.get(&player).is_some_and(|s| !s.is_empty())
    }

    /// Re-send the message to every player whose display changed.
    fn refresh(&mut self) {
        let message = self.current_message();
        let waiting = self.waiting_players();

        for player in &self.players {
            let wanted = if waiting.contains(&player.id()) {
                message.clone()
            } else {
                None
            };
            if wanted.as_ref() == self.displayed.get(&player.id()) {
                continue;
            }
            match wanted {
                Some(text) => {
                    send_message_to(player, &text);
                    self.displayed.insert(player.id(), text);
                }
                None => {
                    clear_messages_for(player);
                    self.displayed.remove(&player.id());
                }
            }
        }
    }
}

fn send_message_to(player: &Player, text: &str) {
    let session = player.session();
    session.remove_permanent(Some(WAITING_MESSAGE_GROUP));
    session.send_permanent(
        WAITING_MESSAGE_GROUP,
        json!({"command": "games.base.show_waiting_message", "message": text}),
    );
}

fn clear_messages_for(player: &Player) {
    let session = player.session();
    session.send(json!({"command": "games.base.remove_waiting_message"}));
    session.remove_permanent(Some(WAITING_MESSAGE_GROUP));
}
