//! Hash-chain verification.

use serde::Serialize;

use super::AuditEvent;

/// Why a chain stopped verifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFault {
    /// The event carries no hash at all.
    MissingHash,
    /// The stored hash does not match the recomputed one.
    HashMismatch,
    /// `prevHash` does not equal the previous event's hash.
    BrokenLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub ok: bool,
    /// Number of events that verified before the first fault.
    pub verified: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<ChainFault>,
}

impl ChainReport {
    fn broken(index: usize, fault: ChainFault) -> Self {
        Self {
            ok: false,
            verified: index,
            first_bad_index: Some(index),
            fault: Some(fault),
        }
    }
}

/// Verify hashes and links; stops at the first bad event.
///
/// The first event must not carry a `prevHash`. An edit to event `i`
/// breaks its own hash, so the report never points before `i`.
pub fn verify_chain(events: &[AuditEvent]) -> ChainReport {
    let mut prev: Option<&str> = None;
    for (i, event) in events.iter().enumerate() {
        let Some(stored) = event.hash.as_deref() else {
            return ChainReport::broken(i, ChainFault::MissingHash);
        };
        if event.compute_hash() != stored {
            return ChainReport::broken(i, ChainFault::HashMismatch);
        }
        if event.prev_hash.as_deref() != prev {
            return ChainReport::broken(i, ChainFault::BrokenLink);
        }
        prev = Some(stored);
    }
    ChainReport {
        ok: true,
        verified: events.len(),
        first_bad_index: None,
        fault: None,
    }
}
