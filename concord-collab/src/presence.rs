//! Presence awareness: who is looking at what.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! PresenceTable::update_local()   (rate-limited)
//!       │
//!       ▼
//! presence{docId, cursor?, selection?}  ──► server relays to the doc's
//!                                           other sessions
//!       ▼
//! remote PresenceTable::observe()  (newest atMs wins, idle peers expire)
//! ```
//!
//! Cursor and selection are opaque JSON; the replication layer never
//! interprets them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{Envelope, Message};

/// One remote peer's last known presence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub peer: String,
    pub cursor: Option<Value>,
    pub selection: Option<Value>,
    /// Sender clock of the newest update.
    pub at_ms: u64,
    #[serde(skip)]
    last_seen: Instant,
}

impl PeerPresence {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Presence state for one document as seen by one peer.
pub struct PresenceTable {
    local_id: String,
    doc_id: String,
    peers: HashMap<String, PeerPresence>,
    last_broadcast: Option<Instant>,
    broadcast_interval: Duration,
    idle_timeout: Duration,
}

impl PresenceTable {
    /// 30 updates per second, peers idle after 30 s.
    pub fn new(local_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::with_timing(local_id, doc_id, Duration::from_millis(33), Duration::from_secs(30))
    }

    pub fn with_timing(
        local_id: impl Into<String>,
        doc_id: impl Into<String>,
        broadcast_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            doc_id: doc_id.into(),
            peers: HashMap::new(),
            last_broadcast: None,
            broadcast_interval,
            idle_timeout,
        }
    }

    /// Record a presence envelope. Returns false if it was ignored (own
    /// message, other document, or older than what we have).
    pub fn observe(&mut self, envelope: &Envelope) -> bool {
        let Message::Presence {
            doc_id,
            cursor,
            selection,
        } = &envelope.body
        else {
            return false;
        };
        if envelope.from == self.local_id || *doc_id != self.doc_id {
            return false;
        }
        if let Some(existing) = self.peers.get(&envelope.from) {
            if envelope.at_ms < existing.at_ms {
                return false;
            }
        }
        self.peers.insert(
            envelope.from.clone(),
            PeerPresence {
                peer: envelope.from.clone(),
                cursor: cursor.clone(),
                selection: selection.clone(),
                at_ms: envelope.at_ms,
                last_seen: Instant::now(),
            },
        );
        true
    }

    /// Build a presence message for the local cursor, or `None` if the
    /// previous one went out less than one interval ago.
    pub fn update_local(&mut self, cursor: Option<Value>, selection: Option<Value>) -> Option<Message> {
        if let Some(last) = self.last_broadcast {
            if last.elapsed() < self.broadcast_interval {
                return None;
            }
        }
        Some(self.force_local(cursor, selection))
    }

    /// Build a presence message regardless of rate limiting.
    pub fn force_local(&mut self, cursor: Option<Value>, selection: Option<Value>) -> Message {
        self.last_broadcast = Some(Instant::now());
        Message::Presence {
            doc_id: self.doc_id.clone(),
            cursor,
            selection,
        }
    }

    pub fn peer(&self, peer: &str) -> Option<&PeerPresence> {
        self.peers.get(peer)
    }

    pub fn remove(&mut self, peer: &str) -> Option<PeerPresence> {
        self.peers.remove(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Non-idle peers, sorted by id.
    pub fn active(&self) -> Vec<PeerPresence> {
        let mut active: Vec<PeerPresence> = self
            .peers
            .values()
            .filter(|p| !p.is_idle(self.idle_timeout))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.peer.cmp(&b.peer));
        active
    }

    /// Remove peers idle for longer than the timeout.
    pub fn cleanup_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("presence: expired {} idle peer(s) on {}", stale.len(), self.doc_id);
        }
        stale
    }
}
