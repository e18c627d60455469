//! # concord-core: shared primitives for replicated JSON documents
//!
//! Everything in the replication stack that has to agree byte-for-byte
//! across processes lives here:
//!
//! - [`canonical`]: key-sorted, type-normalized serialization and the
//!   SHA-256 content hash every other component compares
//! - [`path`]: bounded dot-paths that refuse reserved keys
//! - [`patch`]: the `Set` / `Merge` / `PathSet` mutation model
//! - [`ids`] / [`time`]: session ids and wall-clock helpers

pub mod canonical;
pub mod ids;
pub mod patch;
pub mod path;
pub mod time;

pub use canonical::{
    canonical_hash, canonical_len, hash_serializable, sha256_hex, to_canonical_string, CanonicalError,
};
pub use patch::{ConcurrencyPolicy, Patch, PatchError, PathOp};
pub use path::{KeyPath, PathError};
