//! Bounded dot-paths into JSON trees.
//!
//! Paths are parsed once into a [`KeyPath`] and every mutation walks the
//! tree by explicit descent. Reserved keys are refused outright so a patch
//! or a replayed log can never address object-prototype slots of a
//! JavaScript peer reading the same document.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum number of segments in a path.
pub const MAX_PATH_DEPTH: usize = 32;

/// Maximum length of a single segment.
pub const MAX_SEGMENT_LEN: usize = 256;

/// Keys no path may contain.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "prototype", "constructor"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' has an empty segment")]
    EmptySegment(String),
    #[error("path '{path}' uses reserved key '{key}'")]
    ReservedKey { path: String, key: String },
    #[error("path '{0}' is deeper than {MAX_PATH_DEPTH} segments")]
    TooDeep(String),
    #[error("path '{0}' has a segment longer than {MAX_SEGMENT_LEN} bytes")]
    SegmentTooLong(String),
    #[error("missing segment '{segment}' in '{path}'")]
    Missing { path: String, segment: String },
    #[error("cannot descend into non-object at '{segment}' in '{path}'")]
    NotAnObject { path: String, segment: String },
}

/// A validated dot-separated path such as `opt.bounds.lo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Parse and validate a dot-path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            let part = part.trim();
            if part.is_empty() {
                return Err(PathError::EmptySegment(raw.to_string()));
            }
            check_key(raw, part)?;
            segments.push(part.to_string());
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(PathError::TooDeep(raw.to_string()));
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments, applying the same checks.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        let joined = segments.join(".");
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        for s in &segments {
            if s.is_empty() || s.contains('.') {
                return Err(PathError::EmptySegment(joined));
            }
            check_key(&joined, s)?;
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(PathError::TooDeep(joined));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Return a new path with `prefix` prepended.
    pub fn prefixed(&self, prefix: &KeyPath) -> Result<Self, PathError> {
        Self::from_segments(prefix.segments.iter().chain(self.segments.iter()).cloned())
    }

    /// True if `prefix` equals this path or is a leading run of its segments.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix.segments.iter().zip(&self.segments).all(|(a, b)| a == b)
    }

    /// Read the value at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Result<&'a Value, PathError> {
        let mut cur = root;
        for seg in &self.segments {
            cur = match cur {
                Value::Object(map) => map.get(seg).ok_or_else(|| self.missing(seg))?,
                _ => return Err(self.not_object(seg)),
            };
        }
        Ok(cur)
    }

    /// Write `value` at this path.
    ///
    /// With `create`, missing intermediate objects are created and a
    /// non-object root is replaced by an empty object. Without it, every
    /// segment including the last must already exist.
    pub fn set(&self, root: &mut Value, value: Value, create: bool) -> Result<(), PathError> {
        if !root.is_object() {
            if !create {
                return Err(self.not_object(&self.segments[0]));
            }
            *root = Value::Object(Map::new());
        }
        let (last, parents) = self
            .segments
            .split_last()
            .ok_or(PathError::Empty)?;
        let mut cur = root;
        for seg in parents {
            let map = cur.as_object_mut().ok_or_else(|| self.not_object(seg))?;
            if !map.contains_key(seg) {
                if !create {
                    return Err(self.missing(seg));
                }
                map.insert(seg.clone(), Value::Object(Map::new()));
            }
            cur = map.get_mut(seg).ok_or_else(|| self.missing(seg))?;
            if !cur.is_object() {
                return Err(self.not_object(seg));
            }
        }
        let map = cur.as_object_mut().ok_or_else(|| self.not_object(last))?;
        if !create && !map.contains_key(last) {
            return Err(self.missing(last));
        }
        map.insert(last.clone(), value);
        Ok(())
    }

    /// Remove and return the value at this path.
    pub fn remove(&self, root: &mut Value) -> Result<Value, PathError> {
        let (last, parents) = self.segments.split_last().ok_or(PathError::Empty)?;
        let mut cur = root;
        for seg in parents {
            cur = match cur {
                Value::Object(map) => map.get_mut(seg).ok_or_else(|| self.missing(seg))?,
                _ => return Err(self.not_object(seg)),
            };
        }
        match cur {
            Value::Object(map) => map.remove(last).ok_or_else(|| self.missing(last)),
            _ => Err(self.not_object(last)),
        }
    }

    fn missing(&self, segment: &str) -> PathError {
        PathError::Missing {
            path: self.to_string(),
            segment: segment.to_string(),
        }
    }

    fn not_object(&self, segment: &str) -> PathError {
        PathError::NotAnObject {
            path: self.to_string(),
            segment: segment.to_string(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl std::str::FromStr for KeyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a single object key (used for `Merge` keys as well).
pub fn check_key(path: &str, key: &str) -> Result<(), PathError> {
    if RESERVED_KEYS.contains(&key) {
        log::warn!("reserved key '{key}' refused in '{path}'");
        return Err(PathError::ReservedKey {
            path: path.to_string(),
            key: key.to_string(),
        });
    }
    if key.len() > MAX_SEGMENT_LEN {
        log::debug!("key of {} bytes refused in '{path}'", key.len());
        return Err(PathError::SegmentTooLong(path.to_string()));
    }
    Ok(())
}
