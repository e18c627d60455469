//! Canonical serialization and content hashing.
//!
//! Every replica, the conflict store, the audit chain and the upgrade
//! coordinator compare state through this one primitive, so its output must
//! not depend on map insertion order, float spelling or platform.
//!
//! Rules:
//! ```text
//! object  → keys sorted by byte order, `{"k":v,...}` with no whitespace
//! array   → `[v,...]` in order
//! number  → integers as integers; floats with a zero fraction (inside the
//!           2^53 safe range) are written as integers; others use the
//!           shortest round-trip form
//! string  → JSON escaping, non-ASCII emitted as UTF-8
//! ```

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest integral float that is written without a fraction.
const SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Errors produced while canonicalizing arbitrary serializable values.
#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("value is not representable as JSON: {0}")]
    NotJson(String),
}

/// Destination for canonical output.
///
/// Writing straight into a hasher or a byte counter avoids materializing
/// large documents just to hash or measure them.
trait Sink {
    fn put(&mut self, s: &str) -> Result<(), Overflow>;
}

/// Signals that a bounded sink hit its limit.
#[derive(Debug)]
struct Overflow;

impl Sink for String {
    fn put(&mut self, s: &str) -> Result<(), Overflow> {
        self.push_str(s);
        Ok(())
    }
}

impl Sink for Sha256 {
    fn put(&mut self, s: &str) -> Result<(), Overflow> {
        self.update(s.as_bytes());
        Ok(())
    }
}

struct Counter {
    len: usize,
    limit: usize,
}

impl Sink for Counter {
    fn put(&mut self, s: &str) -> Result<(), Overflow> {
        self.len += s.len();
        if self.len > self.limit {
            return Err(Overflow);
        }
        Ok(())
    }
}

fn write_value<S: Sink>(value: &Value, out: &mut S) -> Result<(), Overflow> {
    match value {
        Value::Null => out.put("null"),
        Value::Bool(true) => out.put("true"),
        Value::Bool(false) => out.put("false"),
        Value::Number(n) => out.put(&number_text(n)),
        Value::String(s) => write_str(s, out),
        Value::Array(items) => {
            out.put("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.put(",")?;
                }
                write_value(item, out)?;
            }
            out.put("]")
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.put("{")?;
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.put(",")?;
                }
                write_str(key, out)?;
                out.put(":")?;
                write_value(&map[key], out)?;
            }
            out.put("}")
        }
    }
}

fn write_str<S: Sink>(s: &str, out: &mut S) -> Result<(), Overflow> {
    // Serializing a &str into JSON cannot fail.
    let quoted = serde_json::to_string(s).unwrap_or_default();
    out.put(&quoted)
}

fn number_text(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < SAFE_INTEGER => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

/// Serialize `value` canonically.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    // String sinks never overflow.
    let _ = write_value(value, &mut out);
    out
}

/// Lower-hex SHA-256 of the canonical serialization of `value`.
pub fn canonical_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    let _ = write_value(value, &mut hasher);
    hex::encode(hasher.finalize())
}

/// Lower-hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Canonical hash of any serializable value.
pub fn hash_serializable<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let json = serde_json::to_value(value).map_err(|e| CanonicalError::NotJson(e.to_string()))?;
    Ok(canonical_hash(&json))
}

/// Canonical length in bytes, or `None` once it exceeds `limit`.
///
/// Stops walking the tree as soon as the limit is crossed, so callers can
/// guard expensive hashing of oversized states cheaply.
pub fn canonical_len(value: &Value, limit: usize) -> Option<usize> {
    let mut counter = Counter { len: 0, limit };
    match write_value(value, &mut counter) {
        Ok(()) => Some(counter.len),
        Err(Overflow) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_compact() {
        let v = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        assert_eq!(to_canonical_string(&v), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_integral_floats_normalized() {
        assert_eq!(to_canonical_string(&json!(1.0)), "1");
        assert_eq!(to_canonical_string(&json!(-3.0)), "-3");
        assert_eq!(to_canonical_string(&json!(1.5)), "1.5");
        assert_eq!(canonical_hash(&json!({"x": 2.0})), canonical_hash(&json!({"x": 2})));
    }

    #[test]
    fn test_non_ascii_unescaped() {
        assert_eq!(to_canonical_string(&json!("héllo")), "\"héllo\"");
        assert_eq!(to_canonical_string(&json!("a\"b")), r#""a\"b""#);
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let mut a = serde_json::Map::new();
        a.insert("z".into(), json!(1));
        a.insert("a".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("a".into(), json!(2));
        b.insert("z".into(), json!(1));
        assert_eq!(canonical_hash(&Value::Object(a)), canonical_hash(&Value::Object(b)));
    }

    #[test]
    fn test_hash_matches_string_digest() {
        let v = json!({"k": [true, "v"]});
        assert_eq!(canonical_hash(&v), sha256_hex(to_canonical_string(&v).as_bytes()));
        assert_eq!(canonical_hash(&v).len(), 64);
    }

    #[test]
    fn test_canonical_len_bounded() {
        let v = json!({"a": "xxxxxxxxxx"});
        let exact = to_canonical_string(&v).len();
        assert_eq!(canonical_len(&v, 1024), Some(exact));
        assert_eq!(canonical_len(&v, exact), Some(exact));
        assert_eq!(canonical_len(&v, exact - 1), None);
    }

    #[test]
    fn test_hash_serializable_struct() {
        #[derive(Serialize)]
        struct Probe {
            b: u8,
            a: &'static str,
        }
        let h = hash_serializable(&Probe { b: 1, a: "x" }).unwrap();
        assert_eq!(h, canonical_hash(&json!({"a": "x", "b": 1})));
    }
}
