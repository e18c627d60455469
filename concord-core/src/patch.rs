//! Document mutations.
//!
//! A [`Patch`] is a described change applied to a replica's JSON state:
//!
//! | Kind      | Effect                                   | Policy             |
//! |-----------|------------------------------------------|--------------------|
//! | `set`     | replace the whole state                  | strict             |
//! | `merge`   | shallow merge into the root object       | strict             |
//! | `path_set`| ordered `{path, value}` writes, LWW/path | strict or lww      |
//!
//! Application is copy-on-write: [`Patch::apply`] returns a new state and
//! leaves the input untouched on error, so a failed op never leaves a
//! half-applied document behind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::path::{check_key, KeyPath, PathError};

/// Maximum number of writes in one `path_set` patch.
pub const MAX_PATH_OPS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("merge value must be an object")]
    MergeNotObject,
    #[error("path_set has no ops")]
    EmptyPathSet,
    #[error("path_set has {0} ops (max {MAX_PATH_OPS})")]
    TooManyOps(usize),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Concurrency policy an op is arbitrated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// `base_version` must equal the replica version.
    Strict,
    /// Stale `base_version` is tolerated; later writes win per path.
    LwwPathset,
}

/// One write inside a `path_set` patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathOp {
    pub path: String,
    pub value: Value,
}

impl PathOp {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// A mutation of a replica's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Patch {
    Set { value: Value },
    Merge { value: Value },
    PathSet { ops: Vec<PathOp> },
}

impl Patch {
    pub fn set(value: Value) -> Self {
        Patch::Set { value }
    }

    pub fn merge(value: Value) -> Self {
        Patch::Merge { value }
    }

    pub fn path_set(ops: Vec<PathOp>) -> Self {
        Patch::PathSet { ops }
    }

    /// Short kind name used in logs and conflict payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Patch::Set { .. } => "set",
            Patch::Merge { .. } => "merge",
            Patch::PathSet { .. } => "path_set",
        }
    }

    /// True for kinds that are always arbitrated strictly.
    pub fn requires_strict(&self) -> bool {
        !matches!(self, Patch::PathSet { .. })
    }

    /// Check shape and every key/path without touching any state.
    pub fn validate(&self) -> Result<(), PatchError> {
        match self {
            Patch::Set { .. } => Ok(()),
            Patch::Merge { value } => {
                let map = value.as_object().ok_or(PatchError::MergeNotObject)?;
                for key in map.keys() {
                    check_key(key, key)?;
                }
                Ok(())
            }
            Patch::PathSet { ops } => {
                if ops.is_empty() {
                    return Err(PatchError::EmptyPathSet);
                }
                if ops.len() > MAX_PATH_OPS {
                    return Err(PatchError::TooManyOps(ops.len()));
                }
                for op in ops {
                    KeyPath::parse(&op.path)?;
                }
                Ok(())
            }
        }
    }

    /// Apply to `state`, returning the new state.
    pub fn apply(&self, state: &Value) -> Result<Value, PatchError> {
        match self {
            Patch::Set { value } => Ok(value.clone()),
            Patch::Merge { value } => {
                let incoming = value.as_object().ok_or(PatchError::MergeNotObject)?;
                let mut merged = match state {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                for (key, v) in incoming {
                    check_key(key, key)?;
                    merged.insert(key.clone(), v.clone());
                }
                Ok(Value::Object(merged))
            }
            Patch::PathSet { ops } => {
                if ops.is_empty() {
                    return Err(PatchError::EmptyPathSet);
                }
                let mut next = state.clone();
                for op in ops {
                    KeyPath::parse(&op.path)?
                        .set(&mut next, op.value.clone(), true)
                        .inspect_err(|e| log::debug!("path_set of {} ops stopped at '{}': {e}", ops.len(), op.path))?;
                }
                Ok(next)
            }
        }
    }

    /// Expand into `(path, value)` writes relative to `root`.
    ///
    /// `Set` becomes a single write at `root`, `Merge` one write per
    /// top-level key, `PathSet` its ops re-rooted. Applying the expansion in
    /// order to a tree holding the old state under `root` yields the new
    /// state under `root`.
    pub fn to_writes(&self, root: &KeyPath) -> Result<Vec<(KeyPath, Value)>, PatchError> {
        match self {
            Patch::Set { value } => Ok(vec![(root.clone(), value.clone())]),
            Patch::Merge { value } => {
                let map = value.as_object().ok_or(PatchError::MergeNotObject)?;
                map.iter()
                    .map(|(k, v)| {
                        let key = KeyPath::from_segments([k.as_str()])?;
                        Ok((key.prefixed(root)?, v.clone()))
                    })
                    .collect()
            }
            Patch::PathSet { ops } => ops
                .iter()
                .map(|op| Ok((KeyPath::parse(&op.path)?.prefixed(root)?, op.value.clone())))
                .collect(),
        }
    }
}
