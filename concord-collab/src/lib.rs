//! # concord-collab: replicated JSON documents with audit and consensus
//!
//! Keeps many replicas of a JSON document consistent, detects when they
//! drift, and coordinates schema upgrades across peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON messages    ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │   ws or in-proc    │ (central)    │
//! └──────┬──────┘      bus           └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                   ┌──────────────────┐
//! │ ClientCore  │                   │ ReplicaService   │
//! │ (resync on  │                   │ one worker / doc │──► AuditLog (hash chain)
//! │  mismatch)  │                   └──────┬───────────┘──► ConflictStore
//! └─────────────┘                          │
//!                                   ┌──────┴──────┐
//!                                   │ Room        │
//!                                   │ (fan-out)   │
//!                                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol, validated once at the boundary
//! - [`transport`]: pluggable transport (in-process bus, WebSocket)
//! - [`broadcast`]: per-document fan-out with backpressure
//! - [`replica`]: authoritative replicas and optimistic concurrency
//! - [`server`] / [`client`]: sync endpoints
//! - [`presence`]: cursor and selection awareness
//! - [`conflict`]: deduplicating conflict inbox
//! - [`divergence`]: hash channel, deep diff, first-divergence locator
//! - [`upgrade`]: propose / vote / apply schema migrations
//! - [`audit`]: hash-chained log and deterministic replay
//! - [`config`]: aggregated configuration

pub mod audit;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod divergence;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod transport;
pub mod upgrade;

// Re-exports for convenience
pub use audit::{replay, verify_chain, AuditConfig, AuditError, AuditEvent, AuditLog, ReplayConfig, ReplayResult};
pub use broadcast::{BroadcastStats, Room, SessionHandle};
pub use client::{Backoff, ClientConfig, ClientCore, ClientError, ClientEvent, SyncClient};
pub use config::{ConcordConfig, ConfigError};
pub use conflict::{
    ConflictCandidate, ConflictKind, ConflictQuery, ConflictRecord, ConflictSink, ConflictStatus,
    ConflictStore, ConflictStoreConfig, RecommendedAction, Severity,
};
pub use divergence::{
    deep_diff, locate_first_divergence, DiffLimits, DivergenceReport, HashChannel, HashChannelConfig, SyncHealth,
};
pub use presence::{PeerPresence, PresenceTable};
pub use protocol::{decode, Envelope, ErrorCode, Message, MessageLimits, ProtocolError};
pub use replica::{Replica, ReplicaConfig, ReplicaService};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use transport::{BusRegistry, BusTransport, Transport, TransportError, TransportState, WsTransport};
pub use upgrade::{StepRegistry, UpgradeConfig, UpgradeCoordinator, UpgradeError, UpgradePhase};
