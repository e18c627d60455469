//! Authoritative per-document replicas and optimistic-concurrency
//! arbitration.
//!
//! ```text
//!  session tasks                     one worker per docId
//!  ───────────────                   ─────────────────────────────────
//!  hello ──┐                         ┌──────────────────────────────┐
//!  op    ──┼── DocCommand (mpsc) ──► │ Replica {version, state}     │
//!  presence┘                         │ Room    {session → queue}    │
//!                                    └──────┬───────────────────────┘
//!                                           │ ack → sender, then
//!                                           │ op  → every other session
//!                                           ▼
//!                              AuditLog (state.set / state.set_many)
//!                              ConflictSink (rejections, failures)
//! ```
//!
//! All mutation of a document happens inside its worker, one command at a
//! time, so acknowledgement and broadcast are FIFO per document while
//! different documents proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use concord_core::{canonical_hash, ConcurrencyPolicy, KeyPath, Patch, PatchError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::audit::{AuditLog, OP_REJECTED, STATE_SET, STATE_SET_MANY};
use crate::broadcast::{Room, SessionHandle};
use crate::conflict::{ConflictCandidate, ConflictKind, ConflictSink, RecommendedAction, Severity};
use crate::protocol::{Envelope, ErrorCode, Message, LWW_PATHSET_APPLIED};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Policy for `path_set` ops that name none. Default: `lww_pathset`.
    pub default_pathset_policy: ConcurrencyPolicy,
    /// Schema version new replicas start at. Default: `"1"`.
    pub schema_version: String,
    /// Commands buffered per document worker. Default: 1024.
    pub doc_queue_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            default_pathset_policy: ConcurrencyPolicy::LwwPathset,
            schema_version: "1".to_string(),
            doc_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("base version {base} does not match replica version {current}")]
    VersionMismatch { base: u64, current: u64 },
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Result of a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub new_version: u64,
    /// The op's base version was behind the replica.
    pub stale: bool,
}

/// One document's authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub doc_id: String,
    pub version: u64,
    pub state: Value,
    pub schema_version: String,
}

impl Replica {
    pub fn new(doc_id: impl Into<String>, schema_version: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            version: 0,
            state: json!({}),
            schema_version: schema_version.into(),
        }
    }

    /// Arbitrate and apply. The version moves by exactly one on success;
    /// on any error neither state nor version changes.
    pub fn apply(
        &mut self,
        base_version: u64,
        patch: &Patch,
        policy: ConcurrencyPolicy,
    ) -> Result<Applied, ApplyError> {
        let stale = base_version != self.version;
        if stale && policy == ConcurrencyPolicy::Strict {
            return Err(ApplyError::VersionMismatch {
                base: base_version,
                current: self.version,
            });
        }
        self.state = patch.apply(&self.state)?;
        self.version += 1;
        Ok(Applied {
            new_version: self.version,
            stale,
        })
    }

    pub fn state_hash(&self) -> String {
        canonical_hash(&self.state)
    }

    pub fn snapshot(&self) -> Message {
        Message::Snapshot {
            doc_id: self.doc_id.clone(),
            version: self.version,
            state: self.state.clone(),
            schema_version: self.schema_version.clone(),
        }
    }
}

/// Policy an op is actually arbitrated under, and whether the request
/// asked for something its kind does not allow.
pub fn effective_policy(
    patch: &Patch,
    requested: Option<ConcurrencyPolicy>,
    default_pathset: ConcurrencyPolicy,
) -> (ConcurrencyPolicy, bool) {
    if patch.requires_strict() {
        let violation = requested == Some(ConcurrencyPolicy::LwwPathset);
        (ConcurrencyPolicy::Strict, violation)
    } else {
        (requested.unwrap_or(default_pathset), false)
    }
}

/// Service counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub documents: usize,
    pub ops_applied: u64,
    pub ops_rejected: u64,
    pub ops_failed: u64,
    pub lww_stale_applied: u64,
}

#[derive(Default)]
struct AtomicServiceStats {
    ops_applied: AtomicU64,
    ops_rejected: AtomicU64,
    ops_failed: AtomicU64,
    lww_stale_applied: AtomicU64,
}

/// Point-in-time view of one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub replica: Replica,
    pub state_hash: String,
    pub peers: Vec<String>,
}

enum DocCommand {
    Join(SessionHandle),
    Leave(u64),
    Op { session_id: u64, envelope: Envelope },
    Relay { session_id: u64, envelope: Envelope },
    Inspect(oneshot::Sender<DocumentInfo>),
}

struct Shared {
    local_id: String,
    config: ReplicaConfig,
    audit: Option<Arc<Mutex<AuditLog>>>,
    conflicts: Option<Arc<dyn ConflictSink>>,
    stats: AtomicServiceStats,
}

impl Shared {
    fn raise(&self, candidate: ConflictCandidate) {
        if let Some(sink) = &self.conflicts {
            sink.raise(candidate.source_peer(self.local_id.clone()));
        }
    }

    fn audit(&self, event_type: &str, ok: bool, payload: Value) {
        let Some(audit) = &self.audit else { return };
        let mut journal = audit.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = journal.append(event_type, ok, payload) {
            log::error!("audit append failed: {e}");
        }
    }
}

/// Routes documents to their workers.
pub struct ReplicaService {
    shared: Arc<Shared>,
    docs: Mutex<HashMap<String, mpsc::Sender<DocCommand>>>,
    next_session: AtomicU64,
}

impl ReplicaService {
    pub fn new(local_id: impl Into<String>, config: ReplicaConfig) -> Self {
        Self::build(local_id.into(), config, None, None)
    }

    /// Service with an audit trail and a conflict sink.
    pub fn with_sinks(
        local_id: impl Into<String>,
        config: ReplicaConfig,
        audit: Option<Arc<Mutex<AuditLog>>>,
        conflicts: Option<Arc<dyn ConflictSink>>,
    ) -> Self {
        Self::build(local_id.into(), config, audit, conflicts)
    }

    fn build(
        local_id: String,
        config: ReplicaConfig,
        audit: Option<Arc<Mutex<AuditLog>>>,
        conflicts: Option<Arc<dyn ConflictSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local_id,
                config,
                audit,
                conflicts,
                stats: AtomicServiceStats::default(),
            }),
            docs: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.shared.config
    }

    /// Allocate an id for a new session.
    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn worker(&self, doc_id: &str) -> mpsc::Sender<DocCommand> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = docs.get(doc_id).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(self.shared.config.doc_queue_capacity.max(1));
        let worker = DocWorker::new(doc_id, self.shared.clone());
        tokio::spawn(worker.run(rx));
        docs.insert(doc_id.to_string(), tx.clone());
        tx
    }

    fn existing(&self, doc_id: &str) -> Option<mpsc::Sender<DocCommand>> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
            .cloned()
    }

    async fn dispatch(tx: mpsc::Sender<DocCommand>, cmd: DocCommand) {
        if tx.send(cmd).await.is_err() {
            log::warn!("document worker has stopped");
        }
    }

    /// Subscribe a session; it is answered with a full snapshot. Creates
    /// the replica on first use.
    pub async fn join(&self, doc_id: &str, session: SessionHandle) {
        Self::dispatch(self.worker(doc_id), DocCommand::Join(session)).await;
    }

    pub async fn leave(&self, doc_id: &str, session_id: u64) {
        if let Some(tx) = self.existing(doc_id) {
            Self::dispatch(tx, DocCommand::Leave(session_id)).await;
        }
    }

    /// Hand an `op` envelope to its document's worker.
    pub async fn submit(&self, doc_id: &str, session_id: u64, envelope: Envelope) {
        match self.existing(doc_id) {
            Some(tx) => Self::dispatch(tx, DocCommand::Op { session_id, envelope }).await,
            None => log::warn!("op for unknown document {doc_id}"),
        }
    }

    /// Forward presence and other relayed kinds to the document's other
    /// sessions.
    pub async fn relay(&self, doc_id: &str, session_id: u64, envelope: Envelope) {
        if let Some(tx) = self.existing(doc_id) {
            Self::dispatch(tx, DocCommand::Relay { session_id, envelope }).await;
        }
    }

    pub async fn inspect(&self, doc_id: &str) -> Option<DocumentInfo> {
        let tx = self.existing(doc_id)?;
        let (reply, rx) = oneshot::channel();
        tx.send(DocCommand::Inspect(reply)).await.ok()?;
        rx.await.ok()
    }

    pub fn documents(&self) -> Vec<String> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> ServiceStats {
        let s = &self.shared.stats;
        ServiceStats {
            documents: self.docs.lock().unwrap_or_else(PoisonError::into_inner).len(),
            ops_applied: s.ops_applied.load(Ordering::Relaxed),
            ops_rejected: s.ops_rejected.load(Ordering::Relaxed),
            ops_failed: s.ops_failed.load(Ordering::Relaxed),
            lww_stale_applied: s.lww_stale_applied.load(Ordering::Relaxed),
        }
    }
}

struct DocWorker {
    replica: Replica,
    room: Room,
    root: Option<KeyPath>,
    shared: Arc<Shared>,
}

impl DocWorker {
    fn new(doc_id: &str, shared: Arc<Shared>) -> Self {
        let root = match KeyPath::from_segments(["docs", doc_id]) {
            Ok(root) => Some(root),
            Err(e) => {
                log::warn!("document {doc_id} not audited: {e}");
                None
            }
        };
        let worker = Self {
            replica: Replica::new(doc_id, shared.config.schema_version.clone()),
            room: Room::new(doc_id),
            root,
            shared,
        };
        if let Some(root) = &worker.root {
            worker.shared.audit(
                STATE_SET,
                true,
                json!({"docId": doc_id, "version": 0, "path": root.to_string(), "value": {}}),
            );
        }
        log::info!("replica created for {doc_id}");
        worker
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        log::debug!("worker for {} stopped", self.replica.doc_id);
    }

    fn handle(&mut self, cmd: DocCommand) {
        match cmd {
            DocCommand::Join(session) => {
                let session_id = session.session_id;
                self.room.join(session);
                self.reply(session_id, self.replica.snapshot());
            }
            DocCommand::Leave(session_id) => {
                if let Some(s) = self.room.leave(session_id) {
                    log::debug!("session {session_id} ({}) left {}", s.client_id, self.replica.doc_id);
                }
            }
            DocCommand::Op { session_id, envelope } => self.on_op(session_id, envelope),
            DocCommand::Relay { session_id, envelope } => {
                self.room.broadcast_except(Some(session_id), &envelope);
            }
            DocCommand::Inspect(reply) => {
                let info = DocumentInfo {
                    state_hash: self.replica.state_hash(),
                    replica: self.replica.clone(),
                    peers: self.room.client_ids(),
                };
                let _ = reply.send(info);
            }
        }
    }

    fn reply(&self, session_id: u64, body: Message) {
        self.room
            .send_to(session_id, Envelope::new(self.shared.local_id.clone(), body));
    }

    fn on_op(&mut self, session_id: u64, envelope: Envelope) {
        let Message::Op {
            doc_id,
            op_id,
            base_version,
            patch,
            policy,
        } = &envelope.body
        else {
            return;
        };
        let client = envelope.from.as_str();
        let (policy, violation) =
            effective_policy(patch, *policy, self.shared.config.default_pathset_policy);
        if violation {
            self.shared.raise(
                ConflictCandidate::new(
                    ConflictKind::PolicyViolation,
                    Severity::Info,
                    "lww_pathset requested for a strict patch kind",
                )
                .related("docId", doc_id.as_str())
                .related("clientId", client)
                .payload(json!({"patchKind": patch.kind(), "requested": "lww_pathset"})),
            );
        }

        let pre_state = self.replica.state.clone();
        let current = self.replica.version;
        match self.replica.apply(*base_version, patch, policy) {
            Err(ApplyError::VersionMismatch { base, current }) => {
                self.shared.stats.ops_rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("op {op_id} from {client} rejected: base {base}, at {current}");
                self.shared.audit(
                    OP_REJECTED,
                    false,
                    json!({
                        "docId": doc_id,
                        "opId": op_id,
                        "baseVersion": base,
                        "serverVersion": current,
                        "reason": ErrorCode::VersionMismatch.as_str(),
                    }),
                );
                self.shared.raise(
                    ConflictCandidate::new(ConflictKind::PolicyViolation, Severity::Warn, "stale op rejected")
                        .related("docId", doc_id.as_str())
                        .related("clientId", client)
                        .payload(json!({"reason": ErrorCode::VersionMismatch.as_str()}))
                        .detail(format!("op {op_id}: base {base}, server {current}"))
                        .action(RecommendedAction::Resync),
                );
                self.reply(
                    session_id,
                    Message::Error {
                        code: ErrorCode::VersionMismatch,
                        message: format!("base version {base} is behind {current}"),
                        op_id: Some(op_id.clone()),
                    },
                );
                self.reply(session_id, self.replica.snapshot());
            }
            Err(ApplyError::Patch(e)) => {
                self.shared.stats.ops_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("op {op_id} from {client} failed to apply: {e}");
                self.shared.audit(
                    OP_REJECTED,
                    false,
                    json!({
                        "docId": doc_id,
                        "opId": op_id,
                        "baseVersion": base_version,
                        "serverVersion": current,
                        "reason": ErrorCode::BadPatch.as_str(),
                        "error": e.to_string(),
                    }),
                );
                self.shared.raise(
                    ConflictCandidate::new(ConflictKind::OpApplyFailed, Severity::Critical, "op failed to apply")
                        .related("docId", doc_id.as_str())
                        .related("clientId", client)
                        .payload(json!({"patchKind": patch.kind(), "error": e.to_string()}))
                        .detail(format!("op {op_id}"))
                        .action(RecommendedAction::RequestSnapshot),
                );
                self.reply(
                    session_id,
                    Message::Error {
                        code: ErrorCode::BadPatch,
                        message: e.to_string(),
                        op_id: Some(op_id.clone()),
                    },
                );
            }
            Ok(applied) => {
                self.shared.stats.ops_applied.fetch_add(1, Ordering::Relaxed);
                self.audit_applied(op_id, patch, &pre_state, applied.new_version);
                self.reply(
                    session_id,
                    Message::Ack {
                        doc_id: doc_id.clone(),
                        op_id: op_id.clone(),
                        new_version: applied.new_version,
                    },
                );
                if applied.stale {
                    self.shared.stats.lww_stale_applied.fetch_add(1, Ordering::Relaxed);
                    self.reply(
                        session_id,
                        Message::Conflict {
                            doc_id: doc_id.clone(),
                            op_id: op_id.clone(),
                            applied: true,
                            reason: LWW_PATHSET_APPLIED.to_string(),
                            server_version: applied.new_version,
                        },
                    );
                }
                let mut relayed = envelope.clone();
                if let Message::Op { base_version, .. } = &mut relayed.body {
                    *base_version = applied.new_version - 1;
                }
                self.room.broadcast_except(Some(session_id), &relayed);
                log::trace!("{} now at version {}", doc_id, applied.new_version);
            }
        }
    }

    /// Record an applied op as replayable writes under `docs.<docId>`.
    fn audit_applied(&self, op_id: &str, patch: &Patch, pre_state: &Value, version: u64) {
        let Some(root) = &self.root else { return };
        let writes = match patch {
            Patch::Set { .. } => patch.to_writes(root),
            _ if pre_state.is_object() => patch.to_writes(root),
            // Non-object pre-state: rooted writes would not reproduce it.
            _ => Ok(vec![(root.clone(), self.replica.state.clone())]),
        };
        let writes = match writes {
            Ok(w) if !w.is_empty() => w,
            Ok(_) => return,
            Err(e) => {
                log::warn!("op {op_id} not audited: {e}");
                return;
            }
        };
        let doc_id = &self.replica.doc_id;
        if let [(path, value)] = writes.as_slice() {
            self.shared.audit(
                STATE_SET,
                true,
                json!({
                    "docId": doc_id,
                    "opId": op_id,
                    "version": version,
                    "path": path.to_string(),
                    "value": value,
                }),
            );
        } else {
            let writes: Vec<Value> = writes
                .into_iter()
                .map(|(path, value)| json!({"path": path.to_string(), "value": value}))
                .collect();
            self.shared.audit(
                STATE_SET_MANY,
                true,
                json!({"docId": doc_id, "opId": op_id, "version": version, "writes": writes}),
            );
        }
    }
}
