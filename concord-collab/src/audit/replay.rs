//! Deterministic replay of an audit trail into a key-path store.
//!
//! Only whitelisted event types are interpreted. Every write must land
//! under one of the allowed prefixes; anything else is counted as
//! rejected and never applied, so replaying an untrusted log can only
//! touch the subtrees it was allowed to.

use concord_core::{canonical_hash, KeyPath};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AuditEvent, PIPELINE_END, PIPELINE_START, STATE_SET, STATE_SET_MANY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Dot-path prefixes writes may target. Default: `["docs"]`.
    pub allowed_prefixes: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            allowed_prefixes: vec!["docs".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub state: Value,
    pub applied: usize,
    pub ignored: usize,
    pub rejected: usize,
    /// Pipeline markers seen.
    pub markers: usize,
    pub state_hash: String,
}

struct Replayer {
    prefixes: Vec<KeyPath>,
    state: Value,
    applied: usize,
    ignored: usize,
    rejected: usize,
    markers: usize,
}

impl Replayer {
    fn new(config: &ReplayConfig) -> Self {
        let prefixes = config
            .allowed_prefixes
            .iter()
            .filter_map(|p| match KeyPath::parse(p) {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!("ignoring replay prefix '{p}': {e}");
                    None
                }
            })
            .collect();
        Self {
            prefixes,
            state: json!({}),
            applied: 0,
            ignored: 0,
            rejected: 0,
            markers: 0,
        }
    }

    fn allowed(&self, raw: &Value) -> Option<KeyPath> {
        let path = KeyPath::parse(raw.as_str()?).ok()?;
        self.prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
            .then_some(path)
    }

    /// Validate every write of an event before touching the store.
    fn writes(&self, event: &AuditEvent) -> Option<Vec<(KeyPath, Value)>> {
        match event.event_type.as_str() {
            STATE_SET => {
                let path = self.allowed(event.payload.get("path")?)?;
                Some(vec![(path, event.payload.get("value")?.clone())])
            }
            STATE_SET_MANY => event
                .payload
                .get("writes")?
                .as_array()?
                .iter()
                .map(|w| Some((self.allowed(w.get("path")?)?, w.get("value")?.clone())))
                .collect(),
            _ => None,
        }
    }

    fn step(&mut self, event: &AuditEvent) {
        match event.event_type.as_str() {
            STATE_SET | STATE_SET_MANY if event.ok => {
                let Some(writes) = self.writes(event) else {
                    log::debug!("replay rejected event {} ({})", event.seq, event.event_type);
                    self.rejected += 1;
                    return;
                };
                let mut next = self.state.clone();
                for (path, value) in writes {
                    if path.set(&mut next, value, true).is_err() {
                        self.rejected += 1;
                        return;
                    }
                }
                self.state = next;
                self.applied += 1;
            }
            PIPELINE_START | PIPELINE_END => self.markers += 1,
            _ => self.ignored += 1,
        }
    }

    fn finish(self) -> ReplayResult {
        ReplayResult {
            state_hash: canonical_hash(&self.state),
            state: self.state,
            applied: self.applied,
            ignored: self.ignored,
            rejected: self.rejected,
            markers: self.markers,
        }
    }
}

/// Replay `events` in order from an empty store.
pub fn replay(events: &[AuditEvent], config: &ReplayConfig) -> ReplayResult {
    let mut r = Replayer::new(config);
    for event in events {
        r.step(event);
    }
    r.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, event_type: &str, payload: Value) -> AuditEvent {
        AuditEvent {
            seq,
            session_id: "s".into(),
            client_id: "c".into(),
            ts_wall_ms: seq,
            event_type: event_type.into(),
            ok: true,
            payload,
            prev_hash: None,
            hash: None,
        }
    }

    #[test]
    fn test_replay_builds_state() {
        let events = vec![
            ev(0, PIPELINE_START, json!({"name": "run"})),
            ev(1, STATE_SET, json!({"path": "docs.d1.opt.bounds.lo", "value": [0, 0, 0]})),
            ev(2, STATE_SET_MANY, json!({"writes": [
                {"path": "docs.d1.opt.bounds.hi", "value": [1, 1, 1]},
                {"path": "docs.d1.name", "value": "x"}
            ]})),
            ev(3, "ui.click", json!({})),
            ev(4, PIPELINE_END, json!({})),
        ];
        let r = replay(&events, &ReplayConfig::default());
        assert_eq!(r.applied, 2);
        assert_eq!(r.ignored, 1);
        assert_eq!(r.markers, 2);
        assert_eq!(r.rejected, 0);
        assert_eq!(
            r.state,
            json!({"docs": {"d1": {"name": "x", "opt": {"bounds": {"lo": [0, 0, 0], "hi": [1, 1, 1]}}}}})
        );
        assert_eq!(r.state_hash, canonical_hash(&r.state));
    }

    #[test]
    fn test_replay_rejects_outside_prefix() {
        let events = vec![
            ev(0, STATE_SET, json!({"path": "system.root", "value": true})),
            ev(1, STATE_SET, json!({"path": "docs.__proto__.x", "value": 1})),
            ev(2, STATE_SET_MANY, json!({"writes": [
                {"path": "docs.ok", "value": 1},
                {"path": "secrets.key", "value": 2}
            ]})),
        ];
        let r = replay(&events, &ReplayConfig::default());
        assert_eq!(r.rejected, 3);
        assert_eq!(r.applied, 0);
        assert_eq!(r.state, json!({}));
    }

    #[test]
    fn test_replay_skips_failed_events() {
        let mut failed = ev(0, STATE_SET, json!({"path": "docs.a", "value": 1}));
        failed.ok = false;
        let r = replay(&[failed], &ReplayConfig::default());
        assert_eq!(r.ignored, 1);
        assert_eq!(r.state, json!({}));
    }

    #[test]
    fn test_replay_write_conflict_rolls_back_event() {
        let events = vec![
            ev(0, STATE_SET, json!({"path": "docs.a", "value": 1})),
            ev(1, STATE_SET_MANY, json!({"writes": [
                {"path": "docs.b", "value": 1},
                {"path": "docs.a.deep", "value": 2}
            ]})),
        ];
        let r = replay(&events, &ReplayConfig::default());
        assert_eq!(r.applied, 1);
        assert_eq!(r.rejected, 1);
        assert_eq!(r.state, json!({"docs": {"a": 1}}));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events: Vec<_> = (0..20)
            .map(|i| ev(i, STATE_SET, json!({"path": format!("docs.k{}", i % 7), "value": i})))
            .collect();
        let a = replay(&events, &ReplayConfig::default());
        let b = replay(&events, &ReplayConfig::default());
        assert_eq!(a.state_hash, b.state_hash);
    }

    #[test]
    fn test_custom_prefixes() {
        let config = ReplayConfig {
            allowed_prefixes: vec!["app.settings".into()],
        };
        let events = vec![
            ev(0, STATE_SET, json!({"path": "app.settings.theme", "value": "dark"})),
            ev(1, STATE_SET, json!({"path": "app.secrets", "value": "x"})),
        ];
        let r = replay(&events, &config);
        assert_eq!((r.applied, r.rejected), (1, 1));
    }
}
