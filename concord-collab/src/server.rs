//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocWorker("doc-1") ── Room
//!            ├── ClientSession ──► ReplicaService
//! Client B ──┘    (hello gate)         └── DocWorker("doc-2") ── Room
//!                                              │
//!                                     AuditLog / ConflictStore
//! ```
//!
//! Each connection gets one [`ClientSession`]. Nothing but `hello` is
//! accepted until the session has subscribed to a document; after that,
//! ops go to the document's worker and presence/meta traffic is relayed
//! to the document's other sessions. The same session logic also serves
//! peers on any [`Transport`] (see [`SyncServer::serve_transport`]).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::audit::AuditLog;
use crate::broadcast::SessionHandle;
use crate::conflict::ConflictSink;
use crate::protocol::{decode, Envelope, ErrorCode, Message, MessageLimits};
use crate::replica::{ReplicaConfig, ReplicaService};
use crate::transport::Transport;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Id the server signs its messages with
    pub server_id: String,
    /// Outbound messages buffered per session
    pub session_queue_capacity: usize,
    pub limits: MessageLimits,
    pub replica: ReplicaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            server_id: "server".to_string(),
            session_queue_capacity: 256,
            limits: MessageLimits::default(),
            replica: ReplicaConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    rejected_messages: AtomicU64,
}

/// Per-connection protocol state.
pub struct ClientSession {
    service: Arc<ReplicaService>,
    server_id: String,
    session_id: u64,
    outbound: mpsc::Sender<Envelope>,
    client_id: Option<String>,
    doc_id: Option<String>,
}

impl ClientSession {
    pub fn new(service: Arc<ReplicaService>, server_id: impl Into<String>, outbound: mpsc::Sender<Envelope>) -> Self {
        let session_id = service.next_session_id();
        Self {
            service,
            server_id: server_id.into(),
            session_id,
            outbound,
            client_id: None,
            doc_id: None,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.doc_id.as_deref()
    }

    fn error(&self, to: &str, code: ErrorCode, message: impl Into<String>, op_id: Option<String>) -> Envelope {
        Envelope::error(self.server_id.clone(), code, message, op_id).to(to)
    }

    /// Handle one decoded envelope. Returns replies for the sender that
    /// bypass the document queue (errors only).
    pub async fn handle(&mut self, envelope: Envelope) -> Vec<Envelope> {
        if !envelope.is_for(&self.server_id) {
            return Vec::new();
        }
        let from = envelope.from.clone();

        if let Message::Hello { doc_id } = &envelope.body {
            let doc_id = doc_id.clone();
            if let Some(old) = self.doc_id.take() {
                if old != doc_id {
                    self.service.leave(&old, self.session_id).await;
                }
            }
            log::info!("session {} ({from}) subscribed to {doc_id}", self.session_id);
            let handle = SessionHandle::new(self.session_id, from.clone(), self.outbound.clone());
            self.service.join(&doc_id, handle).await;
            self.client_id = Some(from);
            self.doc_id = Some(doc_id);
            return Vec::new();
        }

        let Some(doc_id) = self.doc_id.clone() else {
            return vec![self.error(&from, ErrorCode::NoSession, "send hello first", None)];
        };
        if self.client_id.as_deref() != Some(from.as_str()) {
            log::warn!("session {} sent as {from}, subscribed as {:?}", self.session_id, self.client_id);
        }
        if let Some(target) = envelope.body.doc_id() {
            if target != doc_id {
                let op_id = match &envelope.body {
                    Message::Op { op_id, .. } => Some(op_id.clone()),
                    _ => None,
                };
                return vec![self.error(&from, ErrorCode::NoDoc, format!("session is on {doc_id}"), op_id)];
            }
        }

        match &envelope.body {
            Message::Op { .. } => {
                self.service.submit(&doc_id, self.session_id, envelope).await;
                Vec::new()
            }
            Message::Presence { .. }
            | Message::HashAnnounce(_)
            | Message::UpgradePropose(_)
            | Message::UpgradeVote(_)
            | Message::UpgradeApply { .. }
            | Message::UpgradeStatus(_) => {
                self.service.relay(&doc_id, self.session_id, envelope).await;
                Vec::new()
            }
            other => {
                let kind = other.kind();
                vec![self.error(&from, ErrorCode::Unsupported, format!("clients may not send '{kind}'"), None)]
            }
        }
    }

    /// Leave the subscribed document.
    pub async fn close(&mut self) {
        if let Some(doc_id) = self.doc_id.take() {
            self.service.leave(&doc_id, self.session_id).await;
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    service: Arc<ReplicaService>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_sinks(config, None, None)
    }

    /// Create with default configuration (no audit, no conflict store).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn with_sinks(
        config: ServerConfig,
        audit: Option<Arc<Mutex<AuditLog>>>,
        conflicts: Option<Arc<dyn ConflictSink>>,
    ) -> Self {
        let service = Arc::new(ReplicaService::with_sinks(
            config.server_id.clone(),
            config.replica.clone(),
            audit,
            conflicts,
        ));
        Self {
            config,
            service,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<ReplicaService> {
        &self.service
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept connections forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let ctx = Connection {
                        service: self.service.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = ctx.handle(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serve every peer reachable over `transport` (one session per
    /// sender id). Stops when the transport's inbox closes.
    pub fn serve_transport(&self, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let service = self.service.clone();
        let stats = self.stats.clone();
        let server_id = self.config.server_id.clone();
        let capacity = self.config.session_queue_capacity.max(1);
        let mut inbox = transport.on_message();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
            let mut sessions: HashMap<String, ClientSession> = HashMap::new();
            loop {
                tokio::select! {
                    inbound = inbox.recv() => {
                        let Some(env) = inbound else { break };
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let from = env.from.clone();
                        let session = sessions
                            .entry(from)
                            .or_insert_with(|| ClientSession::new(service.clone(), server_id.clone(), tx.clone()));
                        for reply in session.handle(env).await {
                            stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = transport.send(reply).await {
                                log::warn!("reply not sent: {e}");
                            }
                        }
                    }
                    Some(out) = rx.recv() => {
                        if let Err(e) = transport.send(out).await {
                            log::warn!("outbound message not sent: {e}");
                        }
                    }
                }
            }
            for session in sessions.values_mut() {
                session.close().await;
            }
            log::debug!("transport server loop stopped");
        })
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            rejected_messages: self.stats.rejected_messages.load(Ordering::Relaxed),
        }
    }
}

struct Connection {
    service: Arc<ReplicaService>,
    stats: Arc<AtomicServerStats>,
    config: ServerConfig,
}

impl Connection {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel::<Envelope>(self.config.session_queue_capacity.max(1));
        let mut session = ClientSession::new(self.service.clone(), self.config.server_id.clone(), tx);
        let limits = &self.config.limits;

        let result = loop {
            let mut replies = Vec::new();
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        match decode(text.as_str(), limits) {
                            Ok(env) => replies = session.handle(env).await,
                            Err(e) => {
                                log::warn!("Rejected message from {addr}: {e}");
                                let mut reply = Envelope::error(self.config.server_id.clone(), e.code(), e.to_string(), None);
                                reply.to = session.client_id().map(str::to_string);
                                replies.push(reply);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        replies.push(Envelope::error(
                            self.config.server_id.clone(),
                            ErrorCode::BadMsg,
                            "binary frames are not supported",
                            None,
                        ));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                },
                out = rx.recv() => match out {
                    Some(env) => replies.push(env),
                    None => break Ok(()),
                },
            }

            if !replies.is_empty() {
                if replies.iter().any(|r| r.kind() == "error") {
                    self.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                }
                if let Err(e) = send_all(&mut ws_sender, replies, limits).await {
                    break Err(e);
                }
            }
        };

        session.close().await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }
}

async fn send_all<S>(sink: &mut S, envelopes: Vec<Envelope>, limits: &MessageLimits) -> Result<(), S::Error>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    for env in envelopes {
        match env.encode(limits) {
            Ok(text) => sink.send(WsMessage::Text(text.into())).await?,
            Err(e) => log::warn!("dropping outbound {}: {e}", env.kind()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{Patch, PathOp};
    use serde_json::json;
    use std::time::Duration;

    fn session() -> (ClientSession, mpsc::Receiver<Envelope>) {
        let service = Arc::new(ReplicaService::new("server", ReplicaConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        (ClientSession::new(service, "server", tx), rx)
    }

    fn error_code(replies: &[Envelope]) -> Option<ErrorCode> {
        match replies.first().map(|e| &e.body) {
            Some(Message::Error { code, .. }) => Some(*code),
            _ => None,
        }
    }

    fn op(doc: &str) -> Envelope {
        Envelope::new(
            "alice",
            Message::Op {
                doc_id: doc.into(),
                op_id: "op-1".into(),
                base_version: 0,
                patch: Patch::path_set(vec![PathOp::new("a", json!(1))]),
                policy: None,
            },
        )
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.server_id, "server");
        assert_eq!(config.session_queue_capacity, 256);
    }

    #[test]
    fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_requires_hello() {
        let (mut s, _rx) = session();
        let replies = s.handle(op("doc")).await;
        assert_eq!(error_code(&replies), Some(ErrorCode::NoSession));
        assert_eq!(replies[0].to.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_hello_then_op() {
        let (mut s, mut rx) = session();
        assert!(s.handle(Envelope::new("alice", Message::Hello { doc_id: "doc".into() })).await.is_empty());
        let snap = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(snap.kind(), "snapshot");
        assert!(s.handle(op("doc")).await.is_empty());
        let ack = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ack.body, Message::Ack { new_version: 1, .. }));
    }

    #[tokio::test]
    async fn test_wrong_doc_and_server_kinds() {
        let (mut s, _rx) = session();
        s.handle(Envelope::new("alice", Message::Hello { doc_id: "doc".into() })).await;
        let replies = s.handle(op("elsewhere")).await;
        assert_eq!(error_code(&replies), Some(ErrorCode::NoDoc));

        let ack = Envelope::new(
            "alice",
            Message::Ack {
                doc_id: "doc".into(),
                op_id: "x".into(),
                new_version: 9,
            },
        );
        assert_eq!(error_code(&s.handle(ack).await), Some(ErrorCode::Unsupported));
    }

    #[tokio::test]
    async fn test_ignores_messages_for_other_peers() {
        let (mut s, _rx) = session();
        let env = op("doc").to("someone-else");
        assert!(s.handle(env).await.is_empty());
    }

    #[tokio::test]
    async fn test_serve_shuts_down() {
        let server = SyncServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        });
        let listener = server.bind().await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        stop_tx.send(()).unwrap();
        let served = server.serve(listener, async {
            let _ = stop_rx.await;
        });
        tokio::time::timeout(Duration::from_secs(2), served).await.unwrap().unwrap();
    }
}
