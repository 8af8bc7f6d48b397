//! Gamehall State Library
//!
//! Server-side state for a browser-based multiplayer board/card game hall.
//!
//! # Overview
//!
//! - **Sessions** - One per logged-in participant: an outbox delivered by
//!   long-polling, a reconnect epoch, permanent messages and pending
//!   queries that are replayed when the page reloads.
//!
//! - **Queries** - A question sent to the browser is an awaitable
//!   [`QueryHandle`]; it resolves with the answer or with [`Cancelled`]
//!   when the session moves, resigns or the game ends.
//!
//! - **Locations** - Lobbies, games and the admin room own their members
//!   and route requests. Lobbies run game proposals; games run a turn
//!   engine over declared states.
//!
//! # Design Principles
//!
//! 1. **No networking** - The transport calls into a [`Server`] and reads
//!    the messages queued on each session.
//!
//! 2. **No global state** - A [`Server`] owns every session and location.
//!
//! 3. **Short locks** - State sits behind `parking_lot` mutexes that are
//!    never held across an `.await`.
//!
//! 4. **JSON messages** - Everything sent to clients is a
//!    `serde_json::Value` with a `command` field.
//!
//! # Example
//!
//! ```rust
//! use gamehall_state::{config::ServerConfig, Location, Server};
//! use serde_json::json;
//!
//! let server = Server::new(ServerConfig::default());
//! let root = server.register("root", true).unwrap();
//! let epoch = server.connect(root.id()).unwrap();
//!
//! server.request(root.id(), epoch, &json!({"command": "go_to_admin"})).unwrap();
//! assert_eq!(root.location().map(|l| l.kind()), Some("admin"));
//! ```

pub mod config;
pub mod state;

// Re-export everything from state module at crate root
pub use state::*;
