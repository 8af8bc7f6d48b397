//! Outbound message queue.
//!
//! Buffers messages for one session and hands them to the long-poll that is
//! currently parked for it. At most one poll is parked at a time: a newer
//! poll (usually a second browser tab) supersedes the older one.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;

/// What a parked long-poll is answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Messages in the order they were queued.
    Messages(Vec<Value>),

    /// A newer poll replaced this one, or the session reconnected.
    Superseded,
}

impl Delivery {
    /// Messages carried by this delivery (empty when superseded).
    pub fn into_messages(self) -> Vec<Value> {
        match self {
            Self::Messages(messages) => messages,
            Self::Superseded => Vec::new(),
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

/// Receiving half handed to the transport for one long-poll.
#[derive(Debug)]
pub struct PollHandle {
    rx: oneshot::Receiver<Delivery>,
}

impl PollHandle {
    /// Wait until the poll is answered.
    ///
    /// A queue that is dropped while the poll is parked answers it as
    /// superseded.
    pub async fn wait(self) -> Delivery {
        self.rx.await.unwrap_or(Delivery::Superseded)
    }

    /// Take the answer if it already arrived.
    pub fn try_take(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

/// Per-session outbound buffer with long-poll waiter registration.
#[derive(Debug, Default)]
pub struct MessageQueue {
    /// Messages not yet handed to a poll
    buffer: VecDeque<Value>,

    /// The parked long-poll, only ever held while `buffer` is empty
    waiter: Option<oneshot::Sender<Delivery>>,

    /// Total messages handed to polls
    delivered: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, answering the parked poll if there is one.
    pub fn put(&mut self, message: Value) {
        self.buffer.push_back(message);
        self.flush_to_waiter();
    }

    /// Park a long-poll.
    ///
    /// An already parked poll is answered with [`Delivery::Superseded`]
    /// first. If messages are buffered the new poll is answered right away.
    pub fn wait_for_messages(&mut self) -> PollHandle {
        if let Some(previous) = self.waiter.take() {
            if !previous.is_closed() {
                tracing::warn!("long-poll connected twice, superseding the older one");
            }
            let _ = previous.send(Delivery::Superseded);
        }

        let (tx, rx) = oneshot::channel();
        self.waiter = Some(tx);
        self.flush_to_waiter();
        PollHandle { rx }
    }

    /// Remove and return every buffered message.
    pub fn get_all(&mut self) -> Vec<Value> {
        self.buffer.drain(..).collect()
    }

    /// Drop every buffered message.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// The client reconnected: stale messages are dropped and the old poll
    /// is disconnected.
    pub fn client_reconnected(&mut self) {
        self.clear();
        if let Some(previous) = self.waiter.take() {
            let _ = previous.send(Delivery::Superseded);
        }
    }

    /// Whether a live poll is parked.
    pub fn has_waiter(&self) -> bool {
        self.waiter.as_ref().is_some_and(|w| !w.is_closed())
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total messages handed to polls so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn flush_to_waiter(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        if waiter.is_closed() {
            // The poll timed out on the transport side; keep buffering.
            return;
        }

        let batch: Vec<Value> = self.buffer.drain(..).collect();
        let count = batch.len() as u64;
        match waiter.send(Delivery::Messages(batch)) {
            Ok(()) => self.delivered += count,
            Err(Delivery::Messages(batch)) => {
                for message in batch.into_iter().rev() {
                    self.buffer.push_front(message);
                }
            }
            Err(Delivery::Superseded) => {}
        }
    }
}
