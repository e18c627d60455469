//! Divergence detection.
//!
//! Three tools at three costs:
//! - [`HashChannel`]: cheap periodic hash exchange against a reference peer
//! - [`deep_diff`]: bounded structural report once two trees are in hand
//! - [`locate_first_divergence`]: binary search over two audit trails

pub mod diff;
pub mod hash_channel;
pub mod locator;

pub use diff::{deep_diff, DiffEntry, DiffKind, DiffLimits, DivergenceReport};
pub use hash_channel::{
    spawn_hash_monitor, HashAnnouncement, HashChannel, HashChannelConfig, HealthStatus, PeerHealth,
    SharedHashChannel, SyncHealth,
};
pub use locator::{locate_first_divergence, LocateOutcome, LocateReport};
