//! Query/response correlation.
//!
//! Server logic asks a session a question with [`InteractionRegistry::open`]
//! and awaits the returned [`QueryHandle`]. The client answers with
//! `{id, value}`; the answer is matched by id, so several queries may be
//! outstanding at once and resolve in any order.
//!
//! ```text
//!   open("choice", ..) ──▶ pending[7] = {payload, tx} ──▶ client
//!                                   │
//!   resolve(7, value) ──────────────┤──▶ handle resolves Ok(value)
//!   cancel_all(reason) ─────────────┘──▶ handle resolves Err(Cancelled)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// Per-session query id. Ids start at 1 and are never reused.
pub type QueryId = u64;

/// Why pending interactions were cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    #[default]
    Generic,
    /// The session moved to another location
    Relocated,
    /// A proposal the session belongs to is turning into a game
    GameStarting,
    /// Another candidate declined the proposal
    ClientDeclined,
    /// The player resigned or was forced to
    Resigned,
    /// The game reached its end
    GameEnded,
    /// The session quit or was swept for inactivity
    SessionClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Generic => "interaction cancelled",
            Self::Relocated => "moved to another location",
            Self::GameStarting => "game is starting",
            Self::ClientDeclined => "proposal was declined",
            Self::Resigned => "player resigned",
            Self::GameEnded => "game ended",
            Self::SessionClosed => "session closed",
        };
        write!(f, "{}", text)
    }
}

/// Control signal delivered to a suspended query instead of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Interaction cancelled ({reason}).")]
pub struct Cancelled {
    pub reason: CancelReason,
}

impl Cancelled {
    pub fn new(reason: CancelReason) -> Self {
        Self { reason }
    }
}

/// What a query resolves to.
pub type QueryResult = Result<Value, Cancelled>;

#[derive(Debug)]
struct PendingQuery {
    payload: Value,
    tx: oneshot::Sender<QueryResult>,
}

/// Outstanding queries of one session.
#[derive(Debug)]
pub struct InteractionRegistry {
    next_id: QueryId,
    pending: BTreeMap<QueryId, PendingQuery>,
}

impl Default for InteractionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Register a new query.
    ///
    /// Returns the payload to send to the client (`params` plus `command`
    /// and `id`) and the handle the caller awaits.
    pub fn open(&mut self, command: &str, params: Value) -> (Value, QueryHandle) {
        let id = self.next_id;
        self.next_id += 1;

        let mut payload = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        payload.insert("command".to_string(), Value::String(command.to_string()));
        payload.insert("id".to_string(), Value::from(id));
        let payload = Value::Object(payload);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingQuery {
                payload: payload.clone(),
                tx,
            },
        );
        (payload, QueryHandle { id, rx })
    }

    /// Resolve query `id` with `value`.
    ///
    /// Returns false (and changes nothing) when no such query is pending.
    pub fn resolve(&mut self, id: QueryId, value: Value) -> bool {
        let Some(query) = self.pending.remove(&id) else {
            return false;
        };
        // The caller may have stopped waiting; the id is consumed either way.
        let _ = query.tx.send(Ok(value));
        true
    }

    /// Cancel every pending query with `reason`. Returns how many were pending.
    pub fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (_, query) in pending {
            let _ = query.tx.send(Err(Cancelled::new(reason)));
        }
        count
    }

    /// Payloads of the pending queries, oldest first.
    pub fn pending_payloads(&self) -> Vec<Value> {
        self.pending.values().map(|q| q.payload.clone()).collect()
    }

    pub fn contains(&self, id: QueryId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Awaitable answer to one query.
///
/// If the registry is dropped without answering, the handle resolves as
/// cancelled with [`CancelReason::SessionClosed`].
#[derive(Debug)]
pub struct QueryHandle {
    id: QueryId,
    rx: oneshot::Receiver<QueryResult>,
}

impl QueryHandle {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The result if the query was already answered or cancelled.
    pub fn try_result(&mut self) -> Option<QueryResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(Cancelled::new(CancelReason::SessionClosed)))
            }
        }
    }
}

impl Future for QueryHandle {
    type Output = QueryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Cancelled::new(CancelReason::SessionClosed))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_open_builds_payload() {
        let mut registry = InteractionRegistry::new();
        let (payload, handle) = registry.open("choice", json!({"question": "Q?"}));

        assert_eq!(payload, json!({"command": "choice", "id": 1, "question": "Q?"}));
        assert_eq!(handle.id(), 1);
        assert!(registry.contains(1));
    }

    #[test]
    fn test_ids_increase() {
        let mut registry = InteractionRegistry::new();
        let (_, first) = registry.open("a", Value::Null);
        assert!(registry.resolve(first.id(), json!(null)));
        let (_, second) = registry.open("b", Value::Null);

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
    }

    #[test]
    fn test_resolve_matching_id() {
        let mut registry = InteractionRegistry::new();
        let (_, mut handle) = registry.open("choice", json!({}));

        assert!(registry.resolve(1, json!(3)));

        assert_eq!(handle.try_result(), Some(Ok(json!(3))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_unknown_id_keeps_pending() {
        let mut registry = InteractionRegistry::new();
        let (_, mut handle) = registry.open("choice", json!({}));

        assert!(!registry.resolve(42, json!(3)));

        assert!(handle.try_result().is_none());
        assert!(registry.contains(1));
    }

    #[test]
    fn test_resolve_twice_fails() {
        let mut registry = InteractionRegistry::new();
        let (_, _handle) = registry.open("choice", json!({}));

        assert!(registry.resolve(1, json!("a")));
        assert!(!registry.resolve(1, json!("b")));
    }

    #[test]
    fn test_out_of_order_answers() {
        let mut registry = InteractionRegistry::new();
        let (_, mut outer) = registry.open("choice", json!({}));
        let (_, mut inner) = registry.open("choice", json!({}));

        assert!(registry.resolve(2, json!("inner")));
        assert!(outer.try_result().is_none());
        assert!(registry.resolve(1, json!("outer")));

        assert_eq!(inner.try_result(), Some(Ok(json!("inner"))));
        assert_eq!(outer.try_result(), Some(Ok(json!("outer"))));
    }

    #[test]
    fn test_cancel_all() {
        let mut registry = InteractionRegistry::new();
        let (_, mut a) = registry.open("a", json!({}));
        let (_, mut b) = registry.open("b", json!({}));

        assert_eq!(registry.cancel_all(CancelReason::Resigned), 2);

        let cancelled = Err(Cancelled::new(CancelReason::Resigned));
        assert_eq!(a.try_result(), Some(cancelled.clone()));
        assert_eq!(b.try_result(), Some(cancelled));
        assert!(registry.is_empty());
        assert!(!registry.resolve(1, json!(null)));
    }

    #[test]
    fn test_pending_payloads_in_id_order() {
        let mut registry = InteractionRegistry::new();
        let (_, _a) = registry.open("a", json!({"x": 1}));
        let (_, _b) = registry.open("b", json!({"x": 2}));

        assert_eq!(
            registry.pending_payloads(),
            vec![
                json!({"command": "a", "id": 1, "x": 1}),
                json!({"command": "b", "id": 2, "x": 2}),
            ]
        );
    }

    #[test]
    fn test_dropped_registry_cancels() {
        let mut registry = InteractionRegistry::new();
        let (_, mut handle) = registry.open("a", json!({}));
        drop(registry);

        assert_eq!(
            handle.try_result(),
            Some(Err(Cancelled::new(CancelReason::SessionClosed)))
        );
    }

    #[tokio::test]
    async fn test_handle_awaits_answer() {
        let mut registry = InteractionRegistry::new();
        let (_, handle) = registry.open("a", json!({}));
        registry.resolve(handle.id(), json!({"ok": true}));

        assert_eq!(handle.await, Ok(json!({"ok": true})));
    }
}
