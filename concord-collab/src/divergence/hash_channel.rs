//! Reference-hash channel.
//!
//! ```text
//!   every publish_interval                       on hash_announce
//!   local state ──► size guard ──► H(canonical)     peer tag, hash
//!                      │                 │               │
//!                 too big: degraded      ▼               ▼
//!                                   ┌──────────────────────────┐
//!                                   │ HashChannel              │
//!                                   │  reference = "peer-r"    │
//!                                   │  peers { tag → last ann }│
//!                                   └────────────┬─────────────┘
//!                                                │ evaluate(now)
//!                   hash ≠ reference for ≥ debounce → hash_mismatch
//! ```
//!
//! Hashing runs on its own timer and never touches the op path. A state
//! whose canonical form exceeds `max_state_bytes` is not hashed at all; the
//! announcement goes out marked degraded instead.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use concord_core::time::now_ms;
use concord_core::{canonical_hash, canonical_len};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::conflict::{ConflictCandidate, ConflictKind, ConflictSink, RecommendedAction, Severity};
use crate::protocol::{Envelope, Message};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashChannelConfig {
    /// A mismatch must persist this long before it is flagged. Default: 3s.
    pub debounce_ms: u64,
    /// Announcement period. Default: 5s.
    pub publish_interval_ms: u64,
    /// Largest canonical state that is hashed. Default: 1 MiB.
    pub max_state_bytes: usize,
}

impl Default for HashChannelConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            publish_interval_ms: 5_000,
            max_state_bytes: 1024 * 1024,
        }
    }
}

impl HashChannelConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 50,
            publish_interval_ms: 20,
            max_state_bytes: 4 * 1024,
        }
    }
}

/// One replica's published hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashAnnouncement {
    pub client_tag: String,
    /// `None` when hashing was skipped.
    #[serde(default)]
    pub hash: Option<String>,
    pub ts_ms: u64,
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Mismatch,
    Degraded,
    NoReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHealth {
    pub client_tag: String,
    pub hash: Option<String>,
    pub last_seen_ms: u64,
    pub degraded: bool,
    pub mismatched: bool,
}

/// Sync-health snapshot for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub status: HealthStatus,
    pub reference: Option<String>,
    pub peers: Vec<PeerHealth>,
}

struct Tracked {
    ann: HashAnnouncement,
    mismatch_since: Option<u64>,
    flagged: bool,
}

/// Reference tracking and mismatch debouncing.
pub struct HashChannel {
    config: HashChannelConfig,
    local_tag: String,
    reference: Option<String>,
    peers: BTreeMap<String, Tracked>,
    conflicts: Option<Arc<dyn ConflictSink>>,
}

impl HashChannel {
    pub fn new(config: HashChannelConfig, local_tag: impl Into<String>) -> Self {
        Self {
            config,
            local_tag: local_tag.into(),
            reference: None,
            peers: BTreeMap::new(),
            conflicts: None,
        }
    }

    pub fn with_conflicts(mut self, sink: Arc<dyn ConflictSink>) -> Self {
        self.conflicts = Some(sink);
        self
    }

    pub fn config(&self) -> &HashChannelConfig {
        &self.config
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    /// Mark `tag` (possibly the local tag) as the reference, or clear it.
    pub fn set_reference(&mut self, tag: Option<String>) {
        if self.reference != tag {
            log::info!("hash reference set to {tag:?}");
            self.reference = tag;
            for t in self.peers.values_mut() {
                t.mismatch_since = None;
                t.flagged = false;
            }
        }
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Hash the local state (size guard applied) and record it.
    pub fn announce_local(&mut self, state: &Value, now: u64) -> HashAnnouncement {
        let ann = match canonical_len(state, self.config.max_state_bytes) {
            Some(_) => HashAnnouncement {
                client_tag: self.local_tag.clone(),
                hash: Some(canonical_hash(state)),
                ts_ms: now,
                degraded: false,
            },
            None => {
                log::warn!(
                    "state exceeds {} bytes, skipping hash",
                    self.config.max_state_bytes
                );
                HashAnnouncement {
                    client_tag: self.local_tag.clone(),
                    hash: None,
                    ts_ms: now,
                    degraded: true,
                }
            }
        };
        self.observe(ann.clone());
        ann
    }

    /// Record an announcement from any replica.
    pub fn observe(&mut self, ann: HashAnnouncement) {
        match self.peers.get_mut(&ann.client_tag) {
            Some(t) => t.ann = ann,
            None => {
                self.peers.insert(
                    ann.client_tag.clone(),
                    Tracked {
                        ann,
                        mismatch_since: None,
                        flagged: false,
                    },
                );
            }
        }
    }

    pub fn forget(&mut self, tag: &str) {
        self.peers.remove(tag);
    }

    fn reference_hash(&self) -> Option<&str> {
        let tag = self.reference.as_deref()?;
        self.peers.get(tag)?.ann.hash.as_deref()
    }

    /// Advance debounce timers, raise conflicts for new mismatches, and
    /// return the resulting health snapshot.
    pub fn evaluate(&mut self, now: u64) -> SyncHealth {
        let reference = self.reference.clone();
        let ref_hash = self.reference_hash().map(str::to_string);
        let debounce = self.config.debounce_ms;
        let mut raised = Vec::new();

        for (tag, t) in self.peers.iter_mut() {
            let differs = match (&ref_hash, &t.ann.hash) {
                (Some(r), Some(h)) => Some(tag) != reference.as_ref() && h != r,
                _ => false,
            };
            if !differs {
                t.mismatch_since = None;
                t.flagged = false;
                continue;
            }
            let since = *t.mismatch_since.get_or_insert(now);
            if !t.flagged && now.saturating_sub(since) >= debounce {
                t.flagged = true;
                raised.push((tag.clone(), t.ann.hash.clone()));
            }
        }

        if let (Some(sink), Some(reference), Some(ref_hash)) = (&self.conflicts, &reference, &ref_hash) {
            for (tag, hash) in raised {
                let candidate = ConflictCandidate::new(
                    ConflictKind::HashMismatch,
                    Severity::Warn,
                    format!("replica {tag} disagrees with reference {reference}"),
                )
                .source_peer(tag)
                .related("reference", reference.clone())
                .payload(json!({"hash": hash, "referenceHash": ref_hash}))
                .action(RecommendedAction::RequestSnapshot);
                sink.raise(candidate);
            }
        }
        self.health()
    }

    /// Current health without advancing timers.
    pub fn health(&self) -> SyncHealth {
        let peers: Vec<PeerHealth> = self
            .peers
            .iter()
            .map(|(tag, t)| PeerHealth {
                client_tag: tag.clone(),
                hash: t.ann.hash.clone(),
                last_seen_ms: t.ann.ts_ms,
                degraded: t.ann.degraded,
                mismatched: t.flagged,
            })
            .collect();

        let local_degraded = self
            .peers
            .get(&self.local_tag)
            .is_some_and(|t| t.ann.degraded);
        let status = if self.reference_hash().is_none() {
            if local_degraded || self.reference_is_degraded() {
                HealthStatus::Degraded
            } else {
                HealthStatus::NoReference
            }
        } else if local_degraded {
            HealthStatus::Degraded
        } else if peers.iter().any(|p| p.mismatched) {
            HealthStatus::Mismatch
        } else {
            HealthStatus::Ok
        };

        SyncHealth {
            status,
            reference: self.reference.clone(),
            peers,
        }
    }

    fn reference_is_degraded(&self) -> bool {
        self.reference
            .as_deref()
            .and_then(|tag| self.peers.get(tag))
            .is_some_and(|t| t.ann.degraded)
    }
}

/// Shared handle used by the monitor task and its owner.
pub type SharedHashChannel = Arc<Mutex<HashChannel>>;

/// Periodically announce the local hash over `transport` and fold in
/// peers' announcements. Stops when the state sender is dropped.
pub fn spawn_hash_monitor(
    transport: Arc<dyn Transport>,
    channel: SharedHashChannel,
    mut state: watch::Receiver<Value>,
    health: watch::Sender<SyncHealth>,
) -> JoinHandle<()> {
    let period = {
        let ch = channel.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_millis(ch.config().publish_interval_ms.max(1))
    };
    let mut inbox = transport.on_message();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = state.borrow_and_update().clone();
                    let (ann, report) = {
                        let mut ch = channel.lock().unwrap_or_else(PoisonError::into_inner);
                        let now = now_ms();
                        let ann = ch.announce_local(&snapshot, now);
                        (ann, ch.evaluate(now))
                    };
                    health.send_replace(report);
                    let env = Envelope::new(transport.local_id(), Message::HashAnnounce(ann));
                    if let Err(e) = transport.send(env).await {
                        log::debug!("hash announce not sent: {e}");
                    }
                }
                msg = inbox.recv() => {
                    let Some(env) = msg else { break };
                    if let Message::HashAnnounce(ann) = env.body {
                        let report = {
                            let mut ch = channel.lock().unwrap_or_else(PoisonError::into_inner);
                            ch.observe(ann);
                            ch.evaluate(now_ms())
                        };
                        health.send_replace(report);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("hash monitor stopped");
    })
}
