//! Tamper-evident audit trail.
//!
//! ```text
//!  event 0            event 1            event 2
//! ┌───────────┐      ┌───────────┐      ┌───────────┐
//! │ seq, type │      │ seq, type │      │ seq, type │
//! │ payload   │      │ payload   │      │ payload   │
//! │ prevHash ─┼─ ∅   │ prevHash ─┼──►h0 │ prevHash ─┼──►h1
//! │ hash = h0 │      │ hash = h1 │      │ hash = h2 │
//! └───────────┘      └───────────┘      └───────────┘
//!   h(i) = H(canonical(event_i without "hash"))
//! ```
//!
//! [`AuditLog`] appends and persists as JSONL, [`verify_chain`] checks the
//! links and [`replay`] rebuilds a deterministic key-path store from the
//! whitelisted event types.

pub mod chain;
pub mod journal;
pub mod replay;

use concord_core::canonical_hash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use self::chain::{verify_chain, ChainFault, ChainReport};
pub use self::journal::{AuditConfig, AuditError, AuditLog};
pub use self::replay::{replay, ReplayConfig, ReplayResult};

/// Replayable: write one value at `payload.path`.
pub const STATE_SET: &str = "state.set";
/// Replayable: write every `{path, value}` in `payload.writes`, atomically.
pub const STATE_SET_MANY: &str = "state.set_many";
/// Replay marker opening a pipeline run.
pub const PIPELINE_START: &str = "pipeline.start";
/// Replay marker closing a pipeline run.
pub const PIPELINE_END: &str = "pipeline.end";
/// Non-replayable record of a rejected op.
pub const OP_REJECTED: &str = "op.rejected";

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub seq: u64,
    pub session_id: String,
    pub client_id: String,
    pub ts_wall_ms: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ok: bool,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl AuditEvent {
    /// The event as JSON, minus its own `hash`.
    fn hash_basis(&self) -> Value {
        let mut m = Map::new();
        m.insert("seq".into(), self.seq.into());
        m.insert("sessionId".into(), self.session_id.clone().into());
        m.insert("clientId".into(), self.client_id.clone().into());
        m.insert("tsWallMs".into(), self.ts_wall_ms.into());
        m.insert("type".into(), self.event_type.clone().into());
        m.insert("ok".into(), self.ok.into());
        m.insert("payload".into(), self.payload.clone());
        if let Some(prev) = &self.prev_hash {
            m.insert("prevHash".into(), prev.clone().into());
        }
        Value::Object(m)
    }

    /// Recompute this event's hash from its content.
    pub fn compute_hash(&self) -> String {
        canonical_hash(&self.hash_basis())
    }

    /// Set `prev_hash` and seal the event with its own hash.
    pub fn seal(mut self, prev_hash: Option<String>) -> Self {
        self.prev_hash = prev_hash;
        self.hash = Some(self.compute_hash());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> AuditEvent {
        AuditEvent {
            seq: 0,
            session_id: "s".into(),
            client_id: "c".into(),
            ts_wall_ms: 10,
            event_type: STATE_SET.into(),
            ok: true,
            payload: json!({"path": "docs.d", "value": 1}),
            prev_hash: None,
            hash: None,
        }
    }

    #[test]
    fn test_hash_excludes_own_hash() {
        let sealed = event().seal(None);
        let mut tampered_hash = sealed.clone();
        tampered_hash.hash = Some("0".repeat(64));
        assert_eq!(sealed.compute_hash(), tampered_hash.compute_hash());
    }

    #[test]
    fn test_hash_covers_prev_hash() {
        let a = event().seal(None);
        let b = event().seal(Some("ab".into()));
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_wire_names() {
        let v = serde_json::to_value(event().seal(None)).unwrap();
        assert_eq!(v["type"], json!("state.set"));
        assert!(v.get("tsWallMs").is_some());
        assert!(v.get("prevHash").is_none());
        assert_eq!(v["hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_hash_basis_matches_serialized_form() {
        let sealed = event().seal(Some("p".into()));
        let mut v = serde_json::to_value(&sealed).unwrap();
        v.as_object_mut().unwrap().remove("hash");
        assert_eq!(canonical_hash(&v), sealed.compute_hash());
    }
}
