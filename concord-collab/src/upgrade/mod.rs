//! Peer-consensus schema upgrades.
//!
//! A coordinator proposes moving every replica from one schema version to
//! another along a registered step graph; peers vote; once the quorum rule
//! is satisfied the coordinator applies the plan and every peer re-applies
//! the *same* plan on receiving the apply-intent.
//!
//! ```text
//! idle ──propose──▶ proposed ──vote──▶ voting ──apply──▶ applying ──▶ completed
//!                        │                │                   │
//!                        └─────abort──────┴──── reject ───────┴──▶ failed / aborted
//! ```

pub mod coordinator;
pub mod plan;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use coordinator::{
    publish, spawn_upgrade_pump, Quorum, Role, SchemaDocument, UpgradeConfig, UpgradeCoordinator,
};
pub use plan::{FnStep, MigrationPlan, MigrationStep, PlanStep, StepRegistry};

/// Pre-apply fingerprint attached to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precheck {
    pub state_hash: String,
    pub schema_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProposal {
    pub proposal_id: String,
    pub from_schema: String,
    pub to_schema: String,
    pub plan: MigrationPlan,
    pub precheck: Precheck,
}

impl UpgradeProposal {
    pub fn new(plan: MigrationPlan, precheck: Precheck) -> Self {
        let proposal_id = Self::compute_id(&plan, &precheck);
        Self {
            proposal_id,
            from_schema: plan.from_schema.clone(),
            to_schema: plan.to_schema.clone(),
            plan,
            precheck,
        }
    }

    fn compute_id(plan: &MigrationPlan, precheck: &Precheck) -> String {
        let basis = serde_json::json!({
            "from": plan.from_schema,
            "to": plan.to_schema,
            "planId": plan.plan_id,
            "precheck": {
                "stateHash": precheck.state_hash,
                "schemaVersion": precheck.schema_version,
            },
        });
        format!("up_{}", &concord_core::canonical_hash(&basis)[..16])
    }

    /// True if `proposal_id` matches the proposal's content.
    pub fn is_consistent(&self) -> bool {
        self.plan.is_consistent()
            && self.from_schema == self.plan.from_schema
            && self.to_schema == self.plan.to_schema
            && self.proposal_id == Self::compute_id(&self.plan, &self.precheck)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Approve,
    Reject,
}

/// One peer's vote. The voter is carried in the body (`voter`) because the
/// envelope's `from` is the relaying peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeVote {
    pub proposal_id: String,
    pub voter: String,
    pub vote: Vote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    Idle,
    Proposed,
    Voting,
    Applying,
    Completed,
    Failed,
    Aborted,
}

impl UpgradePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradePhase::Completed | UpgradePhase::Failed | UpgradePhase::Aborted)
    }
}

/// Post-apply verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub ok: bool,
    pub state_hash: String,
    pub schema_version: String,
    /// Whether the migrated state carries a `schemaVersion` key at all.
    pub schema_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    pub proposal_id: String,
    pub phase: UpgradePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dashboard view of the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSnapshot {
    pub phase: UpgradePhase,
    pub peers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<UpgradeProposal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<Vec<UpgradeVote>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UpgradeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("document is already at schema {0}")]
    AlreadyAtSchema(String),
    #[error("no migration path from {from} to {to}")]
    NoPath { from: String, to: String },
    #[error("migration step '{0}' is not registered")]
    MissingStep(String),
    #[error("migration step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },
    #[error("plan {0} does not match its content")]
    PlanMismatch(String),
    #[error("only the coordinator may {0}")]
    NotCoordinator(&'static str),
    #[error("no proposal is being tracked")]
    NoProposal,
    #[error("vote references {got}, tracking {tracking}")]
    UnknownProposal { got: String, tracking: String },
    #[error("proposal has not been approved")]
    NotApproved,
    #[error("cannot {action} while {phase:?}")]
    InvalidPhase { action: &'static str, phase: UpgradePhase },
    #[error("verification failed: {0}")]
    VerifyFailed(String),
}
