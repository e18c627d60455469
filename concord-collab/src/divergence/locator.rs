//! First-divergence locator over two audit trails.
//!
//! Replays growing prefixes of both trails and binary-searches the
//! shortest prefix whose replayed state hashes differ. This assumes that
//! once two replays diverge they stay diverged; a later event that happens
//! to restore equality hides the earlier divergence from the search.

use serde::Serialize;

use crate::audit::{replay, AuditEvent, ReplayConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LocateOutcome {
    /// Same length, same final state.
    Identical,
    /// Replaying event `first_index` is where the states part ways.
    #[serde(rename_all = "camelCase")]
    Diverged { first_index: usize },
    /// The common prefix agrees but one trail is longer; divergence, if
    /// any, lies beyond `common_len`.
    #[serde(rename_all = "camelCase")]
    PendingPastCommonLength { common_len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocateReport {
    #[serde(flatten)]
    pub outcome: LocateOutcome,
    /// Number of prefix replays performed.
    pub replay_calls: usize,
    pub left_len: usize,
    pub right_len: usize,
}

struct Prober<'a> {
    left: &'a [AuditEvent],
    right: &'a [AuditEvent],
    config: &'a ReplayConfig,
    calls: usize,
}

impl Prober<'_> {
    /// Whether the first `n` events of each trail replay to the same state.
    fn agrees(&mut self, n: usize) -> bool {
        self.calls += 2;
        let a = replay(&self.left[..n], self.config);
        let b = replay(&self.right[..n], self.config);
        a.state_hash == b.state_hash
    }
}

/// Locate the first event at which `left` and `right` diverge.
pub fn locate_first_divergence(
    left: &[AuditEvent],
    right: &[AuditEvent],
    config: &ReplayConfig,
) -> LocateReport {
    let common = left.len().min(right.len());
    let mut p = Prober {
        left,
        right,
        config,
        calls: 0,
    };

    let outcome = if p.agrees(common) {
        if left.len() == right.len() {
            LocateOutcome::Identical
        } else {
            LocateOutcome::PendingPastCommonLength { common_len: common }
        }
    } else {
        // Invariant: prefix `lo` agrees, prefix `hi` differs.
        let (mut lo, mut hi) = (0usize, common);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if p.agrees(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        LocateOutcome::Diverged { first_index: hi - 1 }
    };

    log::debug!("locator finished with {outcome:?} after {} replays", p.calls);
    LocateReport {
        outcome,
        replay_calls: p.calls,
        left_len: left.len(),
        right_len: right.len(),
    }
}
