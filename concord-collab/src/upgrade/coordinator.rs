//! Propose / vote / apply / verify state machine.
//!
//! The coordinator is synchronous: every operation returns the messages to
//! broadcast and the caller (or [`spawn_upgrade_pump`]) puts them on the
//! wire. Votes and apply-intents may arrive in any order relative to local
//! actions; anything referencing a proposal other than the tracked one is
//! dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use concord_core::canonical_hash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::plan::StepRegistry;
use super::{
    Precheck, UpgradeError, UpgradePhase, UpgradeProposal, UpgradeSnapshot, UpgradeStatus,
    UpgradeVote, VerifyReport, Vote,
};
use crate::conflict::{ConflictCandidate, ConflictKind, ConflictSink, RecommendedAction, Severity};
use crate::protocol::{Envelope, Message};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    /// Every live peer plus the local replica approves.
    Unanimous,
    /// Strictly more than half of `peers + 1` approve.
    Majority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub quorum: Quorum,
    /// When false the local replica acts alone and the role gate is off.
    pub collaborative: bool,
    /// Peer id allowed to propose and apply. `None` trusts any sender.
    pub coordinator_id: Option<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            quorum: Quorum::Unanimous,
            collaborative: true,
            coordinator_id: None,
        }
    }
}

/// State plus the schema it conforms to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub schema_version: String,
    pub state: Value,
}

impl SchemaDocument {
    pub fn new(schema_version: impl Into<String>, state: Value) -> Self {
        Self {
            schema_version: schema_version.into(),
            state,
        }
    }

    pub fn state_hash(&self) -> String {
        canonical_hash(&self.state)
    }
}

pub struct UpgradeCoordinator {
    local_id: String,
    role: Role,
    config: UpgradeConfig,
    registry: Arc<StepRegistry>,
    document: SchemaDocument,
    peers: BTreeSet<String>,
    phase: UpgradePhase,
    proposal: Option<UpgradeProposal>,
    votes: BTreeMap<String, UpgradeVote>,
    status: Option<UpgradeStatus>,
    peer_statuses: BTreeMap<String, UpgradeStatus>,
    conflicts: Option<Arc<dyn ConflictSink>>,
    outbox: Vec<Message>,
}

impl UpgradeCoordinator {
    pub fn new(
        local_id: impl Into<String>,
        role: Role,
        config: UpgradeConfig,
        registry: Arc<StepRegistry>,
        document: SchemaDocument,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            role,
            config,
            registry,
            document,
            peers: BTreeSet::new(),
            phase: UpgradePhase::Idle,
            proposal: None,
            votes: BTreeMap::new(),
            status: None,
            peer_statuses: BTreeMap::new(),
            conflicts: None,
            outbox: Vec::new(),
        }
    }

    pub fn with_conflicts(mut self, sink: Arc<dyn ConflictSink>) -> Self {
        self.conflicts = Some(sink);
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> UpgradePhase {
        self.phase
    }

    pub fn document(&self) -> &SchemaDocument {
        &self.document
    }

    pub fn proposal(&self) -> Option<&UpgradeProposal> {
        self.proposal.as_ref()
    }

    pub fn status(&self) -> Option<&UpgradeStatus> {
        self.status.as_ref()
    }

    /// Last status each peer broadcast for the tracked proposal.
    pub fn peer_statuses(&self) -> &BTreeMap<String, UpgradeStatus> {
        &self.peer_statuses
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(String::as_str)
    }

    pub fn peer_joined(&mut self, peer: impl Into<String>) {
        let peer = peer.into();
        if peer != self.local_id && self.peers.insert(peer.clone()) {
            log::debug!("upgrade peer joined: {peer}");
        }
    }

    /// Forget `peer` and expire its vote.
    pub fn peer_left(&mut self, peer: &str) {
        self.peers.remove(peer);
        if self.votes.remove(peer).is_some() {
            log::info!("vote from departed peer {peer} expired");
        }
    }

    fn require_coordinator(&self, action: &'static str) -> Result<(), UpgradeError> {
        if self.config.collaborative && self.role != Role::Coordinator {
            return Err(UpgradeError::NotCoordinator(action));
        }
        Ok(())
    }

    fn trusted_sender(&self, from: &str) -> bool {
        self.config
            .coordinator_id
            .as_deref()
            .map_or(true, |c| c == from)
    }

    /// Plan a migration to `to_schema` and start tracking it. Prior votes
    /// are discarded.
    ///
    /// When no plan connects the schemas the coordinator fails and the
    /// failed status is queued for [`take_outbound`](Self::take_outbound).
    pub fn propose(&mut self, to_schema: &str) -> Result<Message, UpgradeError> {
        self.require_coordinator("propose")?;
        if self.phase == UpgradePhase::Applying {
            return Err(UpgradeError::InvalidPhase {
                action: "propose",
                phase: self.phase,
            });
        }
        let plan = match self.registry.plan(&self.document.schema_version, to_schema) {
            Ok(plan) => plan,
            Err(e @ UpgradeError::AlreadyAtSchema(_)) => return Err(e),
            Err(e) => {
                let status = self.fail(None, e.to_string(), None);
                self.outbox.push(Message::UpgradeStatus(status));
                return Err(e);
            }
        };
        let precheck = Precheck {
            state_hash: self.document.state_hash(),
            schema_version: self.document.schema_version.clone(),
        };
        let proposal = UpgradeProposal::new(plan, precheck);
        log::info!(
            "proposing upgrade {} ({} -> {}, {} steps)",
            proposal.proposal_id,
            proposal.from_schema,
            proposal.to_schema,
            proposal.plan.steps.len()
        );
        self.track(proposal.clone());
        Ok(Message::UpgradePropose(proposal))
    }

    /// Messages produced outside a reply path, oldest first.
    pub fn take_outbound(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    fn track(&mut self, proposal: UpgradeProposal) {
        self.votes.clear();
        self.peer_statuses.clear();
        self.status = None;
        self.phase = UpgradePhase::Proposed;
        self.proposal = Some(proposal);
    }

    /// Cast the local vote on the tracked proposal. A reject also yields
    /// the failed status.
    pub fn vote(&mut self, vote: Vote, reason: Option<String>) -> Result<Vec<Message>, UpgradeError> {
        let proposal_id = self
            .proposal
            .as_ref()
            .map(|p| p.proposal_id.clone())
            .ok_or(UpgradeError::NoProposal)?;
        let ballot = UpgradeVote {
            proposal_id,
            voter: self.local_id.clone(),
            vote,
            reason,
        };
        let failed = self.record_vote(ballot.clone())?;
        let mut out = vec![Message::UpgradeVote(ballot)];
        out.extend(failed.map(Message::UpgradeStatus));
        Ok(out)
    }

    /// Count a vote. Votes for anything but the tracked proposal are refused.
    /// Returns the failed status when the vote is a reject.
    pub fn record_vote(&mut self, ballot: UpgradeVote) -> Result<Option<UpgradeStatus>, UpgradeError> {
        let tracking = self.proposal.as_ref().ok_or(UpgradeError::NoProposal)?;
        if ballot.proposal_id != tracking.proposal_id {
            return Err(UpgradeError::UnknownProposal {
                got: ballot.proposal_id,
                tracking: tracking.proposal_id.clone(),
            });
        }
        if !matches!(self.phase, UpgradePhase::Proposed | UpgradePhase::Voting) {
            return Err(UpgradeError::InvalidPhase {
                action: "vote",
                phase: self.phase,
            });
        }
        self.peer_joined(ballot.voter.clone());
        let rejected = ballot.vote == Vote::Reject;
        let voter = ballot.voter.clone();
        let reason = ballot.reason.clone().unwrap_or_default();
        self.votes.insert(voter.clone(), ballot);
        self.phase = UpgradePhase::Voting;
        if !rejected {
            return Ok(None);
        }
        Ok(Some(self.fail(None, format!("rejected by {voter}: {reason}"), None)))
    }

    pub fn votes(&self) -> impl Iterator<Item = &UpgradeVote> {
        self.votes.values()
    }

    /// Whether the tracked proposal meets the quorum rule. A single reject
    /// vetoes regardless of approvals.
    pub fn is_approved(&self) -> bool {
        if self.proposal.is_none() || self.votes.values().any(|v| v.vote == Vote::Reject) {
            return false;
        }
        let electorate = self.peers.len() + 1;
        let approvals = self
            .votes
            .values()
            .filter(|v| v.vote == Vote::Approve)
            .filter(|v| v.voter == self.local_id || self.peers.contains(&v.voter))
            .count();
        match self.config.quorum {
            Quorum::Unanimous => approvals == electorate,
            Quorum::Majority => approvals * 2 > electorate,
        }
    }

    /// Broadcast apply-intent, run the plan locally and report status.
    ///
    /// Execution failures do not surface as `Err`: the coordinator moves to
    /// `failed` and the returned status message carries the error.
    pub fn apply(&mut self) -> Result<Vec<Message>, UpgradeError> {
        self.require_coordinator("apply")?;
        let proposal = self.proposal.as_ref().ok_or(UpgradeError::NoProposal)?;
        if !matches!(self.phase, UpgradePhase::Proposed | UpgradePhase::Voting) {
            return Err(UpgradeError::InvalidPhase {
                action: "apply",
                phase: self.phase,
            });
        }
        if !self.is_approved() {
            return Err(UpgradeError::NotApproved);
        }
        let intent = Message::UpgradeApply {
            proposal_id: proposal.proposal_id.clone(),
            plan_id: proposal.plan.plan_id.clone(),
        };
        let status = self.execute_tracked();
        Ok(vec![intent, Message::UpgradeStatus(status)])
    }

    /// Abandon the tracked proposal.
    pub fn abort(&mut self) -> Result<Message, UpgradeError> {
        let proposal_id = self
            .proposal
            .as_ref()
            .map(|p| p.proposal_id.clone())
            .ok_or(UpgradeError::NoProposal)?;
        if self.phase == UpgradePhase::Applying || self.phase.is_terminal() {
            return Err(UpgradeError::InvalidPhase {
                action: "abort",
                phase: self.phase,
            });
        }
        self.phase = UpgradePhase::Aborted;
        let status = UpgradeStatus {
            proposal_id,
            phase: UpgradePhase::Aborted,
            verify: None,
            error: None,
        };
        self.status = Some(status.clone());
        log::info!("upgrade {} aborted", status.proposal_id);
        Ok(Message::UpgradeStatus(status))
    }

    /// React to an upgrade message from `from`. Returns replies to broadcast.
    pub fn handle(&mut self, from: &str, message: &Message) -> Vec<Message> {
        if from == self.local_id {
            return Vec::new();
        }
        self.peer_joined(from);
        match message {
            Message::UpgradePropose(p) => {
                if !self.trusted_sender(from) {
                    log::warn!("ignoring proposal from non-coordinator {from}");
                } else if !p.is_consistent() {
                    log::warn!("ignoring proposal {} with inconsistent id", p.proposal_id);
                } else if self.phase == UpgradePhase::Applying {
                    log::warn!("ignoring proposal {} while applying", p.proposal_id);
                } else {
                    if p.from_schema != self.document.schema_version {
                        self.raise(
                            Severity::Warn,
                            &p.proposal_id,
                            format!(
                                "proposal expects schema {}, local is {}",
                                p.from_schema, self.document.schema_version
                            ),
                        );
                    }
                    log::info!("tracking upgrade proposal {} from {from}", p.proposal_id);
                    self.track(p.clone());
                }
                Vec::new()
            }
            Message::UpgradeVote(ballot) => match self.record_vote(ballot.clone()) {
                Ok(failed) => failed.map(Message::UpgradeStatus).into_iter().collect(),
                Err(e) => {
                    log::warn!("vote from {from} dropped: {e}");
                    Vec::new()
                }
            },
            Message::UpgradeApply {
                proposal_id,
                plan_id,
            } => {
                let tracked = self
                    .proposal
                    .as_ref()
                    .is_some_and(|p| &p.proposal_id == proposal_id && &p.plan.plan_id == plan_id);
                if !tracked || !self.trusted_sender(from) {
                    log::warn!("apply-intent for untracked proposal {proposal_id} from {from}");
                    return Vec::new();
                }
                if !matches!(self.phase, UpgradePhase::Proposed | UpgradePhase::Voting) {
                    log::debug!("apply-intent for {proposal_id} ignored in {:?}", self.phase);
                    return Vec::new();
                }
                vec![Message::UpgradeStatus(self.execute_tracked())]
            }
            Message::UpgradeStatus(status) => {
                let tracked = self
                    .proposal
                    .as_ref()
                    .is_some_and(|p| p.proposal_id == status.proposal_id);
                if tracked {
                    log::info!("peer {from} reports upgrade {:?}", status.phase);
                    self.peer_statuses.insert(from.to_string(), status.clone());
                    if status.phase == UpgradePhase::Aborted
                        && self.trusted_sender(from)
                        && matches!(self.phase, UpgradePhase::Proposed | UpgradePhase::Voting)
                    {
                        self.phase = UpgradePhase::Aborted;
                        self.status = Some(status.clone());
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Execute the tracked plan against the local document. The document
    /// is replaced only if every step and the verification pass.
    fn execute_tracked(&mut self) -> UpgradeStatus {
        let Some(proposal) = self.proposal.clone() else {
            return UpgradeStatus {
                proposal_id: String::new(),
                phase: UpgradePhase::Failed,
                verify: None,
                error: Some(UpgradeError::NoProposal.to_string()),
            };
        };
        self.phase = UpgradePhase::Applying;
        if self.document.schema_version != proposal.from_schema {
            let error = format!(
                "local schema {} does not match plan source {}",
                self.document.schema_version, proposal.from_schema
            );
            return self.fail(Some(proposal.proposal_id), error, None);
        }
        if self.document.state_hash() != proposal.precheck.state_hash {
            log::warn!("state hash differs from precheck of {}", proposal.proposal_id);
        }

        let migrated = match self.registry.execute(&proposal.plan, &self.document.state) {
            Ok(state) => state,
            Err(e) => return self.fail(Some(proposal.proposal_id), e.to_string(), None),
        };
        let report = verify(&migrated, &proposal.to_schema);
        if !report.ok {
            let error = UpgradeError::VerifyFailed(format!(
                "schemaVersion in state does not equal {}",
                proposal.to_schema
            ))
            .to_string();
            return self.fail(Some(proposal.proposal_id), error, Some(report));
        }

        self.document = SchemaDocument::new(proposal.to_schema.clone(), migrated);
        self.phase = UpgradePhase::Completed;
        let status = UpgradeStatus {
            proposal_id: proposal.proposal_id,
            phase: UpgradePhase::Completed,
            verify: Some(report),
            error: None,
        };
        log::info!(
            "upgrade {} completed, schema now {}",
            status.proposal_id,
            self.document.schema_version
        );
        self.status = Some(status.clone());
        status
    }

    fn fail(&mut self, proposal_id: Option<String>, error: String, verify: Option<VerifyReport>) -> UpgradeStatus {
        let proposal_id = proposal_id
            .or_else(|| self.proposal.as_ref().map(|p| p.proposal_id.clone()))
            .unwrap_or_default();
        log::error!("upgrade {proposal_id} failed: {error}");
        self.phase = UpgradePhase::Failed;
        self.raise(Severity::Critical, &proposal_id, error.clone());
        let status = UpgradeStatus {
            proposal_id,
            phase: UpgradePhase::Failed,
            verify,
            error: Some(error),
        };
        self.status = Some(status.clone());
        status
    }

    fn raise(&self, severity: Severity, proposal_id: &str, detail: String) {
        let Some(sink) = &self.conflicts else { return };
        let (from, to) = self
            .proposal
            .as_ref()
            .map(|p| (p.from_schema.clone(), p.to_schema.clone()))
            .unwrap_or_default();
        sink.raise(
            ConflictCandidate::new(ConflictKind::SchemaMismatch, severity, "schema upgrade failed")
                .source_peer(self.local_id.clone())
                .related("proposalId", proposal_id)
                .payload(json!({"fromSchema": from, "toSchema": to, "error": detail.clone()}))
                .detail(detail)
                .action(RecommendedAction::RequestSnapshot),
        );
    }

    pub fn snapshot(&self) -> UpgradeSnapshot {
        UpgradeSnapshot {
            phase: self.phase,
            peers: self.peers.iter().cloned().collect(),
            proposal: self.proposal.clone(),
            votes: self
                .proposal
                .as_ref()
                .map(|_| self.votes.values().cloned().collect()),
            status: self.status.clone(),
        }
    }
}

/// Post-apply check: when the state records a `schemaVersion` it must be
/// the target.
fn verify(state: &Value, to_schema: &str) -> VerifyReport {
    let recorded = state.get("schemaVersion");
    let ok = recorded.map_or(true, |v| v.as_str() == Some(to_schema));
    VerifyReport {
        ok,
        state_hash: canonical_hash(state),
        schema_version: to_schema.to_string(),
        schema_present: recorded.is_some(),
    }
}

/// Send `messages` from the transport's local id, in order.
pub async fn publish(transport: &dyn Transport, messages: Vec<Message>) -> Result<(), TransportError> {
    for message in messages {
        transport
            .send(Envelope::new(transport.local_id(), message))
            .await?;
    }
    Ok(())
}

/// Feed inbound upgrade traffic into `coordinator` and broadcast replies.
pub fn spawn_upgrade_pump(
    transport: Arc<dyn Transport>,
    coordinator: Arc<Mutex<UpgradeCoordinator>>,
) -> JoinHandle<()> {
    let mut inbox = transport.on_message();
    tokio::spawn(async move {
        while let Some(env) = inbox.recv().await {
            if !env.kind().starts_with("upgrade_") {
                continue;
            }
            let replies = {
                let mut coordinator = coordinator.lock().unwrap_or_else(PoisonError::into_inner);
                let mut replies = coordinator.handle(&env.from, &env.body);
                replies.extend(coordinator.take_outbound());
                replies
            };
            if let Err(e) = publish(transport.as_ref(), replies).await {
                log::warn!("upgrade reply not sent: {e}");
            }
        }
        log::debug!("upgrade pump stopped");
    })
}
