//! Sync client for a replicated document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with capped backoff)
//! - One op in flight at a time, acknowledged before the next is sent
//! - A bounded outbound queue that refuses new ops with `QUEUE_FULL`
//! - Automatic `hello` resync on `VERSION_MISMATCH`, on gaps in the
//!   broadcast stream and when an ack misses its deadline; the client never
//!   patches around a rejection
//! - Presence (cursor/selection) updates
//!
//! The protocol logic lives in [`ClientCore`], a synchronous state machine
//! that turns inbound envelopes into outbound envelopes and events.
//! [`SyncClient`] drives it over any [`Transport`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use concord_core::ids::{make_session_id, new_message_id};
use concord_core::time::now_ms;
use concord_core::{ConcurrencyPolicy, Patch, PatchError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::presence::{PeerPresence, PresenceTable};
use crate::protocol::{Envelope, ErrorCode, Message};
use crate::transport::{Transport, TransportError, TransportState};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id: String,
    /// Peer id of the authoritative server.
    pub server_id: String,
    pub doc_id: String,
    /// Ops buffered while one is in flight. Default: 256.
    pub queue_capacity: usize,
    /// First reconnect delay. Default: 250 ms.
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling. Default: 10 s.
    pub backoff_max_ms: u64,
    /// An in-flight op with no ack or error after this long is requeued and
    /// the document refetched. 0 waits forever. Default: 5 s.
    pub ack_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: make_session_id("client"),
            server_id: "server".to_string(),
            doc_id: "default".to_string(),
            queue_capacity: 256,
            backoff_base_ms: 250,
            backoff_max_ms: 10_000,
            ack_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            doc_id: doc_id.into(),
            ..Self::default()
        }
    }

    /// Short backoff for tests.
    pub fn for_testing(client_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ack_timeout_ms: 2_000,
            ..Self::new(client_id, doc_id)
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before the next attempt: `base * 2^attempt`, capped.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("outbound queue full ({0} ops)")]
    QueueFull(usize),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Wire code, for errors that have one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::QueueFull(_) => Some(ErrorCode::QueueFull),
            ClientError::Patch(_) => Some(ErrorCode::BadPatch),
            ClientError::Transport(_) => None,
        }
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A snapshot replaced local state.
    Synced { version: u64 },
    Acked { op_id: String, new_version: u64 },
    /// The server refused one of our ops; it will not be retried.
    Rejected {
        op_id: String,
        code: ErrorCode,
        message: String,
    },
    Conflict {
        op_id: String,
        applied: bool,
        reason: String,
        server_version: u64,
    },
    /// Another peer's op was applied locally.
    RemoteOp { from: String, op_id: String, version: u64 },
    Presence { peer: String },
    /// A `hello` was sent to refetch the document.
    Resync { reason: String },
    ServerError { code: ErrorCode, message: String },
    Disconnected,
    Reconnected { attempts: u32 },
}

#[derive(Debug, Clone)]
struct PendingOp {
    op_id: String,
    patch: Patch,
    policy: Option<ConcurrencyPolicy>,
    sent_at: Option<u64>,
}

/// Output of one state-machine step.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Envelope>,
    pub events: Vec<ClientEvent>,
}

/// Client protocol state machine.
pub struct ClientCore {
    config: ClientConfig,
    version: u64,
    state: Value,
    synced: bool,
    queue: VecDeque<PendingOp>,
    in_flight: Option<PendingOp>,
    presence: PresenceTable,
}

impl ClientCore {
    pub fn new(config: ClientConfig) -> Self {
        let presence = PresenceTable::new(config.client_id.clone(), config.doc_id.clone());
        Self {
            config,
            version: 0,
            state: json!({}),
            synced: false,
            queue: VecDeque::new(),
            in_flight: None,
            presence,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Last version confirmed by the server.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Server-confirmed state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Confirmed state with the in-flight and queued patches applied.
    pub fn optimistic_state(&self) -> Value {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .fold(self.state.clone(), |state, op| op.patch.apply(&state).unwrap_or(state))
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Ops not yet acknowledged (queued plus in flight).
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|op| op.op_id.as_str())
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    fn envelope(&self, body: Message) -> Envelope {
        Envelope::new(self.config.client_id.clone(), body).to(self.config.server_id.clone())
    }

    /// Subscribe (or resubscribe); nothing is sent until the snapshot
    /// arrives.
    pub fn hello(&mut self) -> Envelope {
        self.synced = false;
        self.envelope(Message::Hello {
            doc_id: self.config.doc_id.clone(),
        })
    }

    fn resync(&mut self, reason: impl Into<String>, step: &mut Step) {
        let reason = reason.into();
        log::info!("{}: resync on {} ({reason})", self.config.client_id, self.config.doc_id);
        step.events.push(ClientEvent::Resync { reason });
        let hello = self.hello();
        step.outbound.push(hello);
    }

    /// Queue an op. Returns its id, and the envelope to send now if the
    /// client is idle.
    pub fn submit(
        &mut self,
        patch: Patch,
        policy: Option<ConcurrencyPolicy>,
    ) -> Result<(String, Option<Envelope>), ClientError> {
        patch.validate()?;
        let capacity = self.config.queue_capacity.max(1);
        if self.pending() >= capacity {
            return Err(ClientError::QueueFull(capacity));
        }
        let op_id = new_message_id();
        self.queue.push_back(PendingOp {
            op_id: op_id.clone(),
            patch,
            policy,
            sent_at: None,
        });
        Ok((op_id, self.next_op()))
    }

    fn next_op(&mut self) -> Option<Envelope> {
        if !self.synced || self.in_flight.is_some() {
            return None;
        }
        let mut op = self.queue.pop_front()?;
        op.sent_at = Some(now_ms());
        let env = self.envelope(Message::Op {
            doc_id: self.config.doc_id.clone(),
            op_id: op.op_id.clone(),
            base_version: self.version,
            patch: op.patch.clone(),
            policy: op.policy,
        });
        self.in_flight = Some(op);
        Some(env)
    }

    /// The link dropped. The in-flight op goes back to the head of the
    /// queue and is resent after the next snapshot.
    pub fn disconnected(&mut self) {
        self.synced = false;
        if let Some(op) = self.in_flight.take() {
            self.queue.push_front(op);
        }
    }

    /// Enforce the ack deadline at `now`. An expired in-flight op goes back
    /// to the head of the queue and a `hello` is sent; the op is resent on
    /// top of the fresh snapshot.
    pub fn tick(&mut self, now: u64) -> Step {
        let mut step = Step::default();
        let timeout = self.config.ack_timeout_ms;
        let expired = timeout > 0
            && self
                .in_flight
                .as_ref()
                .and_then(|op| op.sent_at)
                .is_some_and(|sent| now.saturating_sub(sent) >= timeout);
        if !expired {
            return step;
        }
        if let Some(op) = self.in_flight.take() {
            log::warn!(
                "{}: no ack for op {} after {timeout} ms",
                self.config.client_id,
                op.op_id
            );
            let reason = format!("ack timeout for op {}", op.op_id);
            self.queue.push_front(op);
            self.resync(reason, &mut step);
        }
        step
    }

    /// Presence update for the local cursor, unless rate-limited.
    pub fn presence_update(&mut self, cursor: Option<Value>, selection: Option<Value>) -> Option<Envelope> {
        let body = self.presence.update_local(cursor, selection)?;
        Some(self.envelope(body))
    }

    pub fn handle(&mut self, envelope: &Envelope) -> Step {
        let mut step = Step::default();
        if envelope.from == self.config.client_id || !envelope.is_for(&self.config.client_id) {
            return step;
        }
        if let Some(doc_id) = envelope.body.doc_id() {
            if doc_id != self.config.doc_id {
                return step;
            }
        }

        match &envelope.body {
            Message::Snapshot { version, state, .. } => {
                self.version = *version;
                self.state = state.clone();
                self.synced = true;
                log::debug!("{}: snapshot v{version}", self.config.client_id);
                step.events.push(ClientEvent::Synced { version: *version });
            }
            Message::Ack { op_id, new_version, .. } => self.on_ack(op_id, *new_version, &mut step),
            Message::Op {
                op_id,
                base_version,
                patch,
                ..
            } => {
                if !self.synced || *base_version < self.version {
                    // Covered by a snapshot already received or requested.
                } else if *base_version > self.version {
                    self.resync(format!("gap: op on v{base_version}, local v{}", self.version), &mut step);
                } else {
                    match patch.apply(&self.state) {
                        Ok(next) => {
                            self.state = next;
                            self.version += 1;
                            step.events.push(ClientEvent::RemoteOp {
                                from: envelope.from.clone(),
                                op_id: op_id.clone(),
                                version: self.version,
                            });
                        }
                        Err(e) => self.resync(format!("remote op {op_id} failed locally: {e}"), &mut step),
                    }
                }
            }
            Message::Conflict {
                op_id,
                applied,
                reason,
                server_version,
                ..
            } => {
                step.events.push(ClientEvent::Conflict {
                    op_id: op_id.clone(),
                    applied: *applied,
                    reason: reason.clone(),
                    server_version: *server_version,
                });
                if !applied && self.in_flight() == Some(op_id.as_str()) {
                    self.in_flight = None;
                    self.resync(format!("op {op_id} not applied"), &mut step);
                }
            }
            Message::Error { code, message, op_id } => self.on_error(*code, message, op_id.as_deref(), &mut step),
            Message::Presence { .. } => {
                if self.presence.observe(envelope) {
                    step.events.push(ClientEvent::Presence {
                        peer: envelope.from.clone(),
                    });
                }
            }
            _ => {}
        }

        if let Some(env) = self.next_op() {
            step.outbound.push(env);
        }
        step
    }

    fn on_ack(&mut self, op_id: &str, new_version: u64, step: &mut Step) {
        let ours = self.in_flight.as_ref().is_some_and(|op| op.op_id == op_id);
        let taken = if ours { self.in_flight.take() } else { None };
        let Some(op) = taken else {
            log::warn!("{}: ack for unknown op {op_id}", self.config.client_id);
            if new_version > self.version {
                self.resync("ack for unknown op", step);
            }
            return;
        };
        if new_version <= self.version {
            // Already contained in a later snapshot.
        } else if new_version == self.version + 1 {
            match op.patch.apply(&self.state) {
                Ok(next) => {
                    self.state = next;
                    self.version = new_version;
                }
                Err(e) => self.resync(format!("acked op {op_id} failed locally: {e}"), step),
            }
        } else {
            self.resync(format!("ack v{new_version} skips local v{}", self.version), step);
        }
        step.events.push(ClientEvent::Acked {
            op_id: op_id.to_string(),
            new_version,
        });
    }

    fn on_error(&mut self, code: ErrorCode, message: &str, op_id: Option<&str>, step: &mut Step) {
        let ours = op_id.is_some() && op_id == self.in_flight();
        if ours {
            if let Some(op) = self.in_flight.take() {
                log::warn!("{}: op {} rejected: {code} {message}", self.config.client_id, op.op_id);
                step.events.push(ClientEvent::Rejected {
                    op_id: op.op_id,
                    code,
                    message: message.to_string(),
                });
            }
        } else {
            log::warn!("{}: server error {code}: {message}", self.config.client_id);
            step.events.push(ClientEvent::ServerError {
                code,
                message: message.to_string(),
            });
        }
        if matches!(code, ErrorCode::VersionMismatch | ErrorCode::NoSession) {
            self.resync(code.as_str(), step);
        }
    }
}

/// Async client over a [`Transport`].
pub struct SyncClient {
    transport: Arc<dyn Transport>,
    core: Arc<Mutex<ClientCore>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    version_tx: Arc<watch::Sender<u64>>,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

const EVENT_CAPACITY: usize = 256;

impl SyncClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (version_tx, _) = watch::channel(0);
        Self {
            transport,
            core: Arc::new(Mutex::new(ClientCore::new(config))),
            event_tx,
            event_rx: Some(event_rx),
            version_tx: Arc::new(version_tx),
            closing: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    fn core(&self) -> std::sync::MutexGuard<'_, ClientCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> String {
        self.core().config().client_id.clone()
    }

    /// Open the transport, start the receive loop and send `hello`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.closing.store(false, Ordering::SeqCst);
        self.transport.open().await?;
        {
            let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.as_ref().map_or(true, |t| t.is_finished()) {
                *task = Some(self.spawn_pump());
            }
        }
        let hello = self.core().hello();
        self.transport.send(hello).await?;
        Ok(())
    }

    fn spawn_pump(&self) -> JoinHandle<()> {
        let pump = Pump {
            transport: self.transport.clone(),
            core: self.core.clone(),
            event_tx: self.event_tx.clone(),
            version_tx: self.version_tx.clone(),
            closing: self.closing.clone(),
        };
        tokio::spawn(pump.run())
    }

    /// Queue an op; returns its id. `QUEUE_FULL` once the outbound queue
    /// holds `queue_capacity` ops.
    pub async fn submit(&self, patch: Patch, policy: Option<ConcurrencyPolicy>) -> Result<String, ClientError> {
        let (op_id, env) = self.core().submit(patch, policy)?;
        if let Some(env) = env {
            if let Err(e) = self.transport.send(env).await {
                log::warn!("op {op_id} not sent yet: {e}");
            }
        }
        Ok(op_id)
    }

    /// Publish the local cursor. Returns false if rate-limited.
    pub async fn set_presence(&self, cursor: Option<Value>, selection: Option<Value>) -> Result<bool, ClientError> {
        let env = self.core().presence_update(cursor, selection);
        match env {
            Some(env) => {
                self.transport.send(env).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn state(&self) -> Value {
        self.core().state().clone()
    }

    pub fn optimistic_state(&self) -> Value {
        self.core().optimistic_state()
    }

    pub fn version(&self) -> u64 {
        self.core().version()
    }

    pub fn pending(&self) -> usize {
        self.core().pending()
    }

    pub fn is_synced(&self) -> bool {
        self.core().is_synced()
    }

    pub fn peers(&self) -> Vec<PeerPresence> {
        self.core().presence().active()
    }

    pub fn connection_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Watch the confirmed version.
    pub fn version_watch(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Wait until the confirmed version reaches `version`.
    pub async fn wait_for_version(&self, version: u64) -> bool {
        let mut rx = self.version_watch();
        let reached = rx.wait_for(|v| *v >= version).await.is_ok();
        reached
    }

    /// Stop reconnecting and close the transport.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
        self.transport.close().await;
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

struct Pump {
    transport: Arc<dyn Transport>,
    core: Arc<Mutex<ClientCore>>,
    event_tx: mpsc::Sender<ClientEvent>,
    version_tx: Arc<watch::Sender<u64>>,
    closing: Arc<AtomicBool>,
}

impl Pump {
    fn emit(&self, event: ClientEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::trace!("client event dropped");
        }
    }

    async fn deliver(&self, step: Step) {
        let version = self.core.lock().unwrap_or_else(PoisonError::into_inner).version();
        self.version_tx.send_replace(version);
        for event in step.events {
            self.emit(event);
        }
        for env in step.outbound {
            if let Err(e) = self.transport.send(env).await {
                log::warn!("send failed: {e}");
            }
        }
    }

    async fn run(self) {
        let mut inbox = self.transport.on_message();
        let mut state_rx = self.transport.on_state();
        let (mut backoff, ack_timeout_ms) = {
            let core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            (Backoff::from_config(core.config()), core.config().ack_timeout_ms)
        };
        let mut deadline = tokio::time::interval(Duration::from_millis((ack_timeout_ms / 4).clamp(10, 1_000)));
        deadline.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = deadline.tick(), if ack_timeout_ms > 0 => {
                    let step = self.core.lock().unwrap_or_else(PoisonError::into_inner).tick(now_ms());
                    if !step.events.is_empty() || !step.outbound.is_empty() {
                        self.deliver(step).await;
                    }
                }
                inbound = inbox.recv() => {
                    let Some(env) = inbound else { break };
                    let step = self.core.lock().unwrap_or_else(PoisonError::into_inner).handle(&env);
                    self.deliver(step).await;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if self.closing.load(Ordering::SeqCst) {
                        if state == TransportState::Closed {
                            break;
                        }
                        continue;
                    }
                    if matches!(state, TransportState::Error | TransportState::Closed) {
                        if !self.reconnect(&mut backoff).await {
                            break;
                        }
                        let _ = state_rx.borrow_and_update();
                    }
                }
            }
        }
        log::debug!("client receive loop stopped");
    }

    /// Reopen with backoff, then resync. Returns false if the client was
    /// closed meanwhile.
    async fn reconnect(&self, backoff: &mut Backoff) -> bool {
        self.core.lock().unwrap_or_else(PoisonError::into_inner).disconnected();
        self.emit(ClientEvent::Disconnected);
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return false;
            }
            let delay = backoff.next_delay();
            log::info!("reconnecting in {delay:?} (attempt {})", backoff.attempt());
            tokio::time::sleep(delay).await;
            if self.closing.load(Ordering::SeqCst) {
                return false;
            }
            match self.transport.open().await {
                Ok(()) => {
                    let attempts = backoff.attempt();
                    backoff.reset();
                    self.emit(ClientEvent::Reconnected { attempts });
                    let hello = self.core.lock().unwrap_or_else(PoisonError::into_inner).hello();
                    if let Err(e) = self.transport.send(hello).await {
                        log::warn!("hello after reconnect failed: {e}");
                        continue;
                    }
                    return true;
                }
                Err(e) => log::warn!("reconnect failed: {e}"),
            }
        }
    }
}
