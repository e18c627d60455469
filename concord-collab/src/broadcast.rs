//! Per-document fan-out with backpressure.
//!
//! A [`Room`] is owned by exactly one document worker, so membership needs
//! no lock. Each session has a bounded outbound queue; a full queue drops
//! the message for that session only and counts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated on the send path without locking.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

/// One connected session's outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    pub client_id: String,
    tx: mpsc::Sender<Envelope>,
}

impl SessionHandle {
    pub fn new(session_id: u64, client_id: impl Into<String>, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            session_id,
            client_id: client_id.into(),
            tx,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The subscribers of one document.
pub struct Room {
    doc_id: String,
    sessions: HashMap<u64, SessionHandle>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Room {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            sessions: HashMap::new(),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Add (or replace) a session.
    pub fn join(&mut self, handle: SessionHandle) {
        log::debug!("session {} ({}) joined {}", handle.session_id, handle.client_id, self.doc_id);
        self.sessions.insert(handle.session_id, handle);
    }

    pub fn leave(&mut self, session_id: u64) -> Option<SessionHandle> {
        self.sessions.remove(&session_id)
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.sessions.values().map(|s| s.client_id.clone()).collect()
    }

    fn push(&self, handle: &SessionHandle, envelope: Envelope) -> bool {
        match handle.tx.try_send(envelope.to(handle.client_id.clone())) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("session {} outbound queue full, message dropped", handle.session_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send to one session, addressed to its client.
    pub fn send_to(&self, session_id: u64, envelope: Envelope) -> bool {
        match self.sessions.get(&session_id) {
            Some(handle) => self.push(handle, envelope),
            None => false,
        }
    }

    /// Send to every session except `except`. Returns the number queued.
    /// Sessions whose queue has closed are removed.
    pub fn broadcast_except(&mut self, except: Option<u64>, envelope: &Envelope) -> usize {
        self.sessions.retain(|_, h| !h.is_closed());
        self.sessions
            .values()
            .filter(|h| Some(h.session_id) != except)
            .filter(|h| self.push(h, envelope.clone()))
            .count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.sent(),
            messages_dropped: self.stats.dropped(),
            active_peers: self.sessions.len(),
        }
    }

    /// Shared handle to the counters, readable from other tasks.
    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }
}
