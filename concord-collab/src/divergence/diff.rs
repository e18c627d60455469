//! Bounded structural diff between a local tree and a reference tree.

use concord_core::{canonical_hash, to_canonical_string};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path reported for a difference at the root itself.
pub const ROOT_PATH: &str = "$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffLimits {
    /// Deepest level descended into; below it subtrees compare whole.
    pub max_depth: usize,
    /// Entries collected before the walk stops.
    pub max_diffs: usize,
    /// Longest canonical rendering of a reported value.
    pub max_value_chars: usize,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_depth: 12,
            max_diffs: 50,
            max_value_chars: 240,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Different JSON types at the same path.
    Type,
    /// Same type, different value.
    Value,
    /// Present in the reference only.
    MissingLocal,
    /// Present locally only.
    MissingRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Value>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceReport {
    pub ok: bool,
    pub local_hash: String,
    pub ref_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mismatch_path: Option<String>,
    pub diffs: Vec<DiffEntry>,
    /// True when the walk stopped at `max_diffs`.
    #[serde(default)]
    pub truncated: bool,
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

struct Walker<'a> {
    limits: &'a DiffLimits,
    diffs: Vec<DiffEntry>,
    first: Option<String>,
    truncated: bool,
}

impl Walker<'_> {
    fn full(&self) -> bool {
        self.diffs.len() >= self.limits.max_diffs
    }

    /// Canonical text cut to `max_value_chars`, ellipsis included.
    fn clip(&self, v: &Value) -> Value {
        let max = self.limits.max_value_chars;
        let text = to_canonical_string(v);
        if text.chars().count() <= max {
            return v.clone();
        }
        let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
        clipped.push('…');
        Value::String(clipped)
    }

    fn record(&mut self, path: &str, kind: DiffKind, local: Option<&Value>, reference: Option<&Value>) {
        let path = if path.is_empty() { ROOT_PATH } else { path };
        if self.first.is_none() {
            self.first = Some(path.to_string());
        }
        if self.full() {
            self.truncated = true;
            return;
        }
        let entry = DiffEntry {
            path: path.to_string(),
            kind,
            local: local.map(|v| self.clip(v)),
            reference: reference.map(|v| self.clip(v)),
        };
        self.diffs.push(entry);
    }

    fn walk(&mut self, path: &str, local: &Value, reference: &Value, depth: usize) {
        if self.truncated {
            return;
        }
        match (local, reference) {
            (Value::Object(l), Value::Object(r)) if depth < self.limits.max_depth => {
                self.walk_object(path, l, r, depth)
            }
            (Value::Array(l), Value::Array(r)) if depth < self.limits.max_depth && l.len() == r.len() => {
                for (i, (a, b)) in l.iter().zip(r).enumerate() {
                    self.walk(&join(path, &i.to_string()), a, b, depth + 1);
                }
            }
            _ if type_name(local) != type_name(reference) => {
                self.record(path, DiffKind::Type, Some(local), Some(reference))
            }
            _ => {
                if to_canonical_string(local) != to_canonical_string(reference) {
                    self.record(path, DiffKind::Value, Some(local), Some(reference));
                }
            }
        }
    }

    fn walk_object(&mut self, path: &str, l: &Map<String, Value>, r: &Map<String, Value>, depth: usize) {
        let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            if self.truncated {
                return;
            }
            let child = join(path, key);
            match (l.get(key), r.get(key)) {
                (Some(a), Some(b)) => self.walk(&child, a, b, depth + 1),
                (Some(a), None) => self.record(&child, DiffKind::MissingRef, Some(a), None),
                (None, Some(b)) => self.record(&child, DiffKind::MissingLocal, None, Some(b)),
                (None, None) => {}
            }
        }
    }
}

/// Diff `local` against `reference` within `limits`.
///
/// Object keys are visited in sorted order and arrays of equal length are
/// compared element-wise, so the report is deterministic. `ok` reflects the
/// collected entries only.
pub fn deep_diff(local: &Value, reference: &Value, limits: &DiffLimits) -> DivergenceReport {
    let mut w = Walker {
        limits,
        diffs: Vec::new(),
        first: None,
        truncated: false,
    };
    w.walk("", local, reference, 0);
    DivergenceReport {
        ok: w.diffs.is_empty(),
        local_hash: canonical_hash(local),
        ref_hash: canonical_hash(reference),
        first_mismatch_path: w.first,
        diffs: w.diffs,
        truncated: w.truncated,
    }
}
