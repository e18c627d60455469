//! Integration tests for end-to-end WebSocket replication.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use concord_collab::client::{ClientConfig, SyncClient};
use concord_collab::protocol::{decode, Envelope, ErrorCode, Message, MessageLimits};
use concord_collab::server::{ServerConfig, SyncServer};
use concord_collab::transport::WsTransport;
use concord_core::{Patch, PathOp};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return it and its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..ServerConfig::default()
    }));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let s = server.clone();
    tokio::spawn(async move {
        s.serve(listener, std::future::pending()).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn new_doc_id() -> String {
    format!("doc-{}", Uuid::new_v4().simple())
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connect_client(url: &str, id: &str, doc_id: &str) -> SyncClient {
    let transport = Arc::new(WsTransport::new(url, id));
    let client = SyncClient::new(transport, ClientConfig::for_testing(id, doc_id));
    client.connect().await.unwrap();
    wait_until(|| client.is_synced()).await;
    client
}

async fn send_raw(ws: &mut RawSocket, env: Envelope) {
    let text = env.encode(&MessageLimits::default()).unwrap();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

async fn recv_raw(ws: &mut RawSocket) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame in time")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return decode(text.as_str(), &MessageLimits::default()).unwrap();
        }
    }
}

fn error_code(env: &Envelope) -> Option<ErrorCode> {
    match env.body {
        Message::Error { code, .. } => Some(code),
        _ => None,
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (_server, url) = start_test_server().await;
    let doc = new_doc_id();
    let alice = connect_client(&url, "alice", &doc).await;
    let bob = connect_client(&url, "bob", &doc).await;

    alice
        .submit(Patch::path_set(vec![PathOp::new("opt.bounds.lo", json!([0, 0, 0]))]), None)
        .await
        .unwrap();
    bob.submit(Patch::path_set(vec![PathOp::new("opt.bounds.hi", json!([1, 1, 1]))]), None)
        .await
        .unwrap();

    wait_until(|| alice.version() == 2 && bob.version() == 2).await;
    let expected = json!({"opt": {"bounds": {"lo": [0, 0, 0], "hi": [1, 1, 1]}}});
    assert_eq!(alice.state(), expected);
    assert_eq!(bob.state(), expected);
    assert_eq!(alice.pending(), 0);
    assert_eq!(bob.pending(), 0);
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot() {
    let (server, url) = start_test_server().await;
    let doc = new_doc_id();
    let alice = connect_client(&url, "alice", &doc).await;
    alice.submit(Patch::set(json!({"title": "draft"})), None).await.unwrap();
    alice.submit(Patch::merge(json!({"pages": 3})), None).await.unwrap();
    wait_until(|| alice.version() == 2).await;

    let carol = connect_client(&url, "carol", &doc).await;
    assert_eq!(carol.version(), 2);
    assert_eq!(carol.state(), json!({"title": "draft", "pages": 3}));

    let info = server.service().inspect(&doc).await.unwrap();
    assert_eq!(info.replica.version, 2);
    assert_eq!(info.state_hash, concord_core::canonical_hash(&carol.state()));
}

#[tokio::test]
async fn test_protocol_errors_reach_sender() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    assert_eq!(error_code(&recv_raw(&mut ws).await), Some(ErrorCode::BadMsg));

    let doc = new_doc_id();
    let op = |base: u64| {
        Envelope::new(
            "raw",
            Message::Op {
                doc_id: doc.clone(),
                op_id: format!("op-{base}"),
                base_version: base,
                patch: Patch::set(json!({"x": 1})),
                policy: None,
            },
        )
    };
    send_raw(&mut ws, op(0)).await;
    assert_eq!(error_code(&recv_raw(&mut ws).await), Some(ErrorCode::NoSession));

    send_raw(&mut ws, Envelope::new("raw", Message::Hello { doc_id: doc.clone() })).await;
    let snapshot = recv_raw(&mut ws).await;
    assert!(matches!(snapshot.body, Message::Snapshot { version: 0, .. }));

    // Stale Set under strict policy: error then a fresh snapshot.
    send_raw(&mut ws, op(5)).await;
    let rejected = recv_raw(&mut ws).await;
    assert_eq!(error_code(&rejected), Some(ErrorCode::VersionMismatch));
    assert!(matches!(recv_raw(&mut ws).await.body, Message::Snapshot { version: 0, .. }));

    send_raw(&mut ws, op(0)).await;
    assert!(matches!(recv_raw(&mut ws).await.body, Message::Ack { new_version: 1, .. }));

    let stats = server.stats();
    assert!(stats.rejected_messages >= 2);
    assert_eq!(server.service().stats().ops_rejected, 1);
}

#[tokio::test]
async fn test_presence_relayed() {
    let (_server, url) = start_test_server().await;
    let doc = new_doc_id();
    let alice = connect_client(&url, "alice", &doc).await;
    let bob = connect_client(&url, "bob", &doc).await;

    assert!(alice.set_presence(Some(json!({"line": 3})), None).await.unwrap());
    wait_until(|| bob.peers().iter().any(|p| p.peer == "alice")).await;
    let seen = bob.peers();
    assert_eq!(seen[0].cursor, Some(json!({"line": 3})));
    assert!(alice.peers().is_empty());
}

#[tokio::test]
async fn test_connection_stats() {
    let (server, url) = start_test_server().await;
    let doc = new_doc_id();
    let alice = connect_client(&url, "alice", &doc).await;
    wait_until(|| server.stats().active_connections == 1).await;
    assert_eq!(server.stats().total_connections, 1);

    alice.close().await;
    wait_until(|| server.stats().active_connections == 0).await;
}
