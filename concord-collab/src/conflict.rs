//! Deduplicating, TTL-bounded inbox of conflict records.
//!
//! Every component that detects trouble (rejected ops, failed migrations,
//! hash mismatches, transport faults) raises a [`ConflictCandidate`]. The
//! store turns candidates into [`ConflictRecord`]s keyed by a content hash,
//! so the same underlying condition raised twice lands on one record.
//!
//! ```text
//! raise ─► id = H({localClientTag, kind, severity, sourcePeer, related, payload})
//!            │
//!            ├─ exists  → merge fields, severity = max, status unchanged
//!            └─ missing → create (open, or acked by auto-ack policy)
//!            │
//!            ▼
//!        cleanup: drop resolved > resolvedTTL, ignored > ignoredTTL,
//!                 then trim oldest beyond capacity
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use concord_core::canonical_hash;
use concord_core::time::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    HashMismatch,
    OpApplyFailed,
    SnapshotApplyFailed,
    SchemaMismatch,
    PolicyViolation,
    TransportError,
    Unknown,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::HashMismatch => "hash_mismatch",
            ConflictKind::OpApplyFailed => "op_apply_failed",
            ConflictKind::SnapshotApplyFailed => "snapshot_apply_failed",
            ConflictKind::SchemaMismatch => "schema_mismatch",
            ConflictKind::PolicyViolation => "policy_violation",
            ConflictKind::TransportError => "transport_error",
            ConflictKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Acked,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConflictStatus::Resolved | ConflictStatus::Ignored)
    }
}

/// What an operator (or automation) should do about a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    None,
    RequestSnapshot,
    Resync,
    Reconnect,
    Repropose,
    Inspect,
}

/// A raised condition, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCandidate {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub source_peer: Option<String>,
    pub related: Map<String, Value>,
    pub payload: Value,
    pub title: String,
    pub detail: Option<String>,
    pub recommended_action: RecommendedAction,
}

impl ConflictCandidate {
    pub fn new(kind: ConflictKind, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            source_peer: None,
            related: Map::new(),
            payload: Value::Null,
            title: title.into(),
            detail: None,
            recommended_action: RecommendedAction::None,
        }
    }

    pub fn source_peer(mut self, peer: impl Into<String>) -> Self {
        self.source_peer = Some(peer.into());
        self
    }

    pub fn related(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.related.insert(key.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn action(mut self, action: RecommendedAction) -> Self {
        self.recommended_action = action;
        self
    }
}

/// A deduplicated conflict record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub severity: Severity,
    pub kind: ConflictKind,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub payload: Value,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub related: Map<String, Value>,
    pub recommended_action: RecommendedAction,
    pub occurrences: u32,
    pub created_at: u64,
    pub updated_at: u64,
    /// When `status` last changed. Terminal TTLs run from here.
    #[serde(default)]
    pub status_changed_at: u64,
    /// Store-local write order, breaks ties between equal timestamps.
    #[serde(skip)]
    touched: u64,
}

/// Auto-ack rule: a new record is acked immediately when its severity and
/// kind both match. An empty list matches everything on that axis; a
/// policy with both lists empty is disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAckPolicy {
    pub severities: Vec<Severity>,
    pub kinds: Vec<ConflictKind>,
}

impl Default for AutoAckPolicy {
    fn default() -> Self {
        Self {
            severities: vec![Severity::Info],
            kinds: vec![ConflictKind::TransportError],
        }
    }
}

impl AutoAckPolicy {
    pub fn disabled() -> Self {
        Self {
            severities: Vec::new(),
            kinds: Vec::new(),
        }
    }

    fn matches(&self, severity: Severity, kind: ConflictKind) -> bool {
        if self.severities.is_empty() && self.kinds.is_empty() {
            return false;
        }
        (self.severities.is_empty() || self.severities.contains(&severity))
            && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictStoreConfig {
    /// Tag of the local client; part of every record id.
    pub local_client_tag: String,
    /// Resolved records older than this are dropped. Default: 24h.
    pub resolved_ttl_ms: u64,
    /// Ignored records older than this are dropped. Default: 7d.
    pub ignored_ttl_ms: u64,
    /// Maximum number of records kept. Default: 500.
    pub capacity: usize,
    /// Maximum number of records returned by `list`. Default: 200.
    pub max_list: usize,
    pub auto_ack: AutoAckPolicy,
}

impl Default for ConflictStoreConfig {
    fn default() -> Self {
        Self {
            local_client_tag: "local".to_string(),
            resolved_ttl_ms: 24 * 60 * 60 * 1000,
            ignored_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            capacity: 500,
            max_list: 200,
            auto_ack: AutoAckPolicy::default(),
        }
    }
}

impl ConflictStoreConfig {
    /// Small windows for tests.
    pub fn for_testing() -> Self {
        Self {
            local_client_tag: "test".to_string(),
            resolved_ttl_ms: 1_000,
            ignored_ttl_ms: 2_000,
            capacity: 8,
            max_list: 4,
            auto_ack: AutoAckPolicy::default(),
        }
    }
}

/// Dashboard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCounts {
    pub open: usize,
    pub acked: usize,
    pub resolved: usize,
    pub ignored: usize,
    pub critical_open: usize,
}

/// Filter for [`ConflictStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictQuery {
    pub statuses: Vec<ConflictStatus>,
    pub severities: Vec<Severity>,
    pub kinds: Vec<ConflictKind>,
    /// Case-insensitive substring over title, detail, kind and source peer.
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl ConflictQuery {
    fn matches(&self, r: &ConflictRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&r.status) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&r.severity) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&r.kind) {
            return false;
        }
        match &self.text {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                let hay = [
                    Some(r.title.as_str()),
                    r.detail.as_deref(),
                    Some(r.kind.as_str()),
                    r.source_peer.as_deref(),
                ];
                hay.iter()
                    .flatten()
                    .any(|h| h.to_lowercase().contains(&needle))
            }
            _ => true,
        }
    }
}

/// Counts plus a filtered record list, as consumed by dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSnapshot {
    #[serde(flatten)]
    pub counts: ConflictCounts,
    pub records: Vec<ConflictRecord>,
}

/// The conflict inbox.
pub struct ConflictStore {
    config: ConflictStoreConfig,
    records: HashMap<String, ConflictRecord>,
    next_touch: u64,
}

impl ConflictStore {
    pub fn new(config: ConflictStoreConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            next_touch: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ConflictStoreConfig::default())
    }

    pub fn config(&self) -> &ConflictStoreConfig {
        &self.config
    }

    /// Deterministic id of a candidate. Timestamps never participate.
    pub fn conflict_id(&self, c: &ConflictCandidate) -> String {
        let basis = json!({
            "localClientTag": self.config.local_client_tag,
            "kind": c.kind,
            "severity": c.severity,
            "sourcePeer": c.source_peer,
            "related": c.related,
            "payload": c.payload,
        });
        format!("cf_{}", &canonical_hash(&basis)[..24])
    }

    /// Insert or merge a candidate, then run cleanup. Returns the record.
    pub fn add(&mut self, candidate: ConflictCandidate, now: u64) -> ConflictRecord {
        let id = self.conflict_id(&candidate);
        self.next_touch += 1;
        let touch = self.next_touch;

        let record = match self.records.get_mut(&id) {
            Some(existing) => {
                if !existing.status.is_terminal() {
                    existing.title = candidate.title;
                    existing.detail = candidate.detail;
                    existing.payload = candidate.payload;
                }
                for (k, v) in candidate.related {
                    existing.related.insert(k, v);
                }
                existing.severity = existing.severity.max(candidate.severity);
                existing.recommended_action = candidate.recommended_action;
                existing.occurrences = existing.occurrences.saturating_add(1);
                existing.updated_at = now;
                existing.touched = touch;
                log::debug!(
                    "conflict {id} re-raised ({} occurrences, status {:?})",
                    existing.occurrences,
                    existing.status
                );
                existing.clone()
            }
            None => {
                let status = if self.config.auto_ack.matches(candidate.severity, candidate.kind) {
                    ConflictStatus::Acked
                } else {
                    ConflictStatus::Open
                };
                let record = ConflictRecord {
                    id: id.clone(),
                    severity: candidate.severity,
                    kind: candidate.kind,
                    status,
                    source_peer: candidate.source_peer,
                    title: candidate.title,
                    detail: candidate.detail,
                    payload: candidate.payload,
                    related: candidate.related,
                    recommended_action: candidate.recommended_action,
                    occurrences: 1,
                    created_at: now,
                    updated_at: now,
                    status_changed_at: now,
                    touched: touch,
                };
                match record.severity {
                    Severity::Critical => log::error!("conflict {id}: {} ({})", record.title, record.kind),
                    Severity::Warn => log::warn!("conflict {id}: {} ({})", record.title, record.kind),
                    Severity::Info => log::info!("conflict {id}: {} ({})", record.title, record.kind),
                }
                self.records.insert(id.clone(), record.clone());
                record
            }
        };

        self.cleanup(now);
        record
    }

    pub fn get(&self, id: &str) -> Option<&ConflictRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn set_status(&mut self, id: &str, status: ConflictStatus, now: u64) -> bool {
        match self.records.get_mut(id) {
            Some(r) => {
                r.status = status;
                r.updated_at = now;
                r.status_changed_at = now;
                true
            }
            None => false,
        }
    }

    pub fn ack(&mut self, id: &str, now: u64) -> bool {
        self.set_status(id, ConflictStatus::Acked, now)
    }

    pub fn resolve(&mut self, id: &str, now: u64) -> bool {
        self.set_status(id, ConflictStatus::Resolved, now)
    }

    pub fn ignore(&mut self, id: &str, now: u64) -> bool {
        self.set_status(id, ConflictStatus::Ignored, now)
    }

    /// Explicitly reopen a record; re-raising alone never does this.
    pub fn reopen(&mut self, id: &str, now: u64) -> bool {
        self.set_status(id, ConflictStatus::Open, now)
    }

    /// Drop terminal records whose status is older than its TTL, then trim to capacity (oldest first).
    pub fn cleanup(&mut self, now: u64) -> usize {
        let before = self.records.len();
        let resolved_ttl = self.config.resolved_ttl_ms;
        let ignored_ttl = self.config.ignored_ttl_ms;
        self.records.retain(|_, r| {
            let age = now.saturating_sub(r.status_changed_at);
            match r.status {
                ConflictStatus::Resolved => age <= resolved_ttl,
                ConflictStatus::Ignored => age <= ignored_ttl,
                _ => true,
            }
        });

        if self.records.len() > self.config.capacity {
            let mut order: Vec<(u64, u64, String)> = self
                .records
                .values()
                .map(|r| (r.updated_at, r.touched, r.id.clone()))
                .collect();
            order.sort();
            let excess = self.records.len() - self.config.capacity;
            for (_, _, id) in order.into_iter().take(excess) {
                self.records.remove(&id);
            }
        }

        let removed = before - self.records.len();
        if removed > 0 {
            log::debug!("conflict cleanup removed {removed} records");
        }
        removed
    }

    pub fn counts(&self) -> ConflictCounts {
        let mut c = ConflictCounts::default();
        for r in self.records.values() {
            match r.status {
                ConflictStatus::Open => {
                    c.open += 1;
                    if r.severity == Severity::Critical {
                        c.critical_open += 1;
                    }
                }
                ConflictStatus::Acked => c.acked += 1,
                ConflictStatus::Resolved => c.resolved += 1,
                ConflictStatus::Ignored => c.ignored += 1,
            }
        }
        c
    }

    /// Matching records, most recently updated first, capped.
    pub fn list(&self, query: &ConflictQuery) -> Vec<ConflictRecord> {
        let cap = query
            .limit
            .map_or(self.config.max_list, |l| l.min(self.config.max_list));
        let mut hits: Vec<&ConflictRecord> =
            self.records.values().filter(|r| query.matches(r)).collect();
        hits.sort_by(|a, b| (b.updated_at, b.touched).cmp(&(a.updated_at, a.touched)));
        hits.into_iter().take(cap).cloned().collect()
    }

    pub fn snapshot(&self, query: &ConflictQuery) -> ConflictSnapshot {
        ConflictSnapshot {
            counts: self.counts(),
            records: self.list(query),
        }
    }
}

/// Anything conflicts can be reported into.
pub trait ConflictSink: Send + Sync {
    /// Raise a candidate; returns the record id.
    fn raise(&self, candidate: ConflictCandidate) -> String;
}

impl ConflictSink for Mutex<ConflictStore> {
    fn raise(&self, candidate: ConflictCandidate) -> String {
        let mut store = self.lock().unwrap_or_else(PoisonError::into_inner);
        store.add(candidate, now_ms()).id
    }
}
