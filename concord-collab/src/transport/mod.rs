//! Pluggable message transport.
//!
//! ```text
//!            open()                 link up
//!  Closed ───────────► Opening ───────────────► Open
//!    ▲                    │                      │
//!    │     close()        │ connect failed       │ link lost
//!    └────────────────────┴──────► Error ◄───────┘
//! ```
//!
//! A transport is a capability: open, close, send, and two subscriptions
//! (inbound envelopes and state changes). Subscriptions are channels;
//! dropping the receiver unsubscribes. Both implementations deliver
//! envelopes to each subscriber in the order they were received, which
//! preserves per-document ordering end to end.

pub mod bus;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::protocol::{Envelope, ProtocolError};

pub use bus::{BusRegistry, BusTransport};
pub use ws::WsTransport;

/// Per-subscriber buffer used when none is configured.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Error,
}

impl TransportState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Closed, Opening)
                | (Opening, Open)
                | (Opening, Error)
                | (Opening, Closed)
                | (Open, Error)
                | (Open, Closed)
                | (Error, Closed)
        )
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open (state {0:?})")]
    NotOpen(TransportState),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Receiving end of an `on_message` subscription.
pub type Inbox = mpsc::Receiver<Envelope>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Peer id this transport sends as.
    fn local_id(&self) -> &str;

    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self);

    /// Send one envelope. Fails unless the transport is open.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Subscribe to inbound envelopes.
    fn on_message(&self) -> Inbox;

    /// Subscribe to state changes.
    fn on_state(&self) -> watch::Receiver<TransportState>;

    fn state(&self) -> TransportState {
        *self.on_state().borrow()
    }
}

/// Fan-out of inbound envelopes to every live subscriber.
///
/// Delivery never blocks: a subscriber whose buffer is full loses the
/// envelope (counted in `dropped`) and a closed subscriber is pruned.
#[derive(Clone)]
pub struct Subscribers {
    inner: Arc<Mutex<Vec<mpsc::Sender<Envelope>>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl Subscribers {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> Inbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver to all subscribers; returns how many accepted it.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let mut subs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subs.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("subscriber lagging, dropped {} envelope", envelope.kind());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

/// Watch-backed state holder that enforces the transition table.
pub(crate) struct StateCell {
    tx: watch::Sender<TransportState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(TransportState::Closed);
        Self { tx }
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.tx.borrow()
    }

    /// Move to `next` if allowed; returns whether the state changed.
    pub(crate) fn set(&self, next: TransportState) -> bool {
        self.tx.send_if_modified(|cur| {
            if cur.can_transition(next) {
                log::debug!("transport {:?} -> {:?}", *cur, next);
                *cur = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn hello() -> Envelope {
        Envelope::new("a", Message::Hello { doc_id: "d".into() })
    }

    #[test]
    fn test_transition_table() {
        use TransportState::*;
        assert!(Closed.can_transition(Opening));
        assert!(Opening.can_transition(Open));
        assert!(Open.can_transition(Error));
        assert!(Error.can_transition(Closed));
        assert!(!Closed.can_transition(Open));
        assert!(!Error.can_transition(Open));
        assert!(!Open.can_transition(Opening));
    }

    #[test]
    fn test_state_cell_rejects_invalid() {
        let cell = StateCell::new();
        let rx = cell.subscribe();
        assert!(!cell.set(TransportState::Open));
        assert!(cell.set(TransportState::Opening));
        assert!(cell.set(TransportState::Open));
        assert_eq!(*rx.borrow(), TransportState::Open);
    }

    #[tokio::test]
    async fn test_subscribers_fan_out_and_prune() {
        let subs = Subscribers::new(4);
        let mut a = subs.subscribe();
        let b = subs.subscribe();
        assert_eq!(subs.deliver(&hello()), 2);
        drop(b);
        assert_eq!(subs.deliver(&hello()), 1);
        assert_eq!(subs.len(), 1);
        assert_eq!(a.recv().await.unwrap().kind(), "hello");
    }

    #[test]
    fn test_subscribers_count_drops() {
        let subs = Subscribers::new(1);
        let _rx = subs.subscribe();
        assert_eq!(subs.deliver(&hello()), 1);
        assert_eq!(subs.deliver(&hello()), 0);
        assert_eq!(subs.dropped(), 1);
    }
}
