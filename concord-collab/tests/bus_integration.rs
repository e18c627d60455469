//! Replication over the in-process bus: convergence, last-write-wins
//! notices, reconnect, and the server's audit trail.

use std::sync::{Arc, Mutex};

use concord_collab::audit::{replay, verify_chain, AuditConfig, AuditLog, ReplayConfig};
use concord_collab::client::{ClientConfig, ClientEvent, SyncClient};
use concord_collab::conflict::{ConflictQuery, ConflictSink, ConflictStore, ConflictStoreConfig};
use concord_collab::protocol::{Envelope, Message, LWW_PATHSET_APPLIED};
use concord_collab::server::{ServerConfig, SyncServer};
use concord_collab::transport::{BusRegistry, BusTransport, Transport};
use concord_core::{canonical_hash, Patch, PathOp};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const ROOM: &str = "room";
const DOC: &str = "doc-1";

struct Setup {
    bus: BusRegistry,
    server: SyncServer,
    audit: Arc<Mutex<AuditLog>>,
    conflicts: Arc<Mutex<ConflictStore>>,
}

async fn setup() -> Setup {
    let bus = BusRegistry::new();
    let audit = Arc::new(Mutex::new(AuditLog::in_memory(AuditConfig::for_testing(), "srv-session", "server")));
    let conflicts = Arc::new(Mutex::new(ConflictStore::new(ConflictStoreConfig::for_testing())));
    let server = SyncServer::with_sinks(
        ServerConfig::default(),
        Some(audit.clone()),
        Some(conflicts.clone() as Arc<dyn ConflictSink>),
    );
    let transport = Arc::new(bus.transport(ROOM, "server"));
    transport.open().await.unwrap();
    server.serve_transport(transport);
    Setup {
        bus,
        server,
        audit,
        conflicts,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn client(bus: &BusRegistry, id: &str) -> (SyncClient, Arc<BusTransport>, mpsc::Receiver<ClientEvent>) {
    let transport = Arc::new(bus.transport(ROOM, id));
    let mut client = SyncClient::new(transport.clone(), ClientConfig::for_testing(id, DOC));
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_until(|| client.is_synced()).await;
    (client, transport, events)
}

fn set(path: &str, value: Value) -> Patch {
    Patch::path_set(vec![PathOp::new(path, value)])
}

fn drain(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn test_bus_convergence() {
    let s = setup().await;
    let (a, _, _) = client(&s.bus, "alice").await;
    let (b, _, _) = client(&s.bus, "bob").await;

    a.submit(set("opt.bounds.lo", json!([0, 0, 0])), None).await.unwrap();
    b.submit(set("opt.bounds.hi", json!([1, 1, 1])), None).await.unwrap();
    wait_until(|| a.version() == 2 && b.version() == 2).await;

    let expected = json!({"opt": {"bounds": {"lo": [0, 0, 0], "hi": [1, 1, 1]}}});
    assert_eq!(a.state(), expected);
    assert_eq!(b.state(), expected);
    let info = s.server.service().inspect(DOC).await.unwrap();
    assert_eq!(info.state_hash, canonical_hash(&expected));
    assert_eq!(info.peers.len(), 2);
}

#[tokio::test]
async fn test_concurrent_pathset_gets_lww_notice() {
    let s = setup().await;
    let (a, _, mut a_events) = client(&s.bus, "alice").await;
    let (b, _, mut b_events) = client(&s.bus, "bob").await;

    // Both sent against version 0; whichever lands second is stale.
    a.submit(set("color", json!("red")), None).await.unwrap();
    b.submit(set("size", json!(4)), None).await.unwrap();
    wait_until(|| a.version() == 2 && b.version() == 2).await;
    assert_eq!(a.state(), b.state());

    let events: Vec<ClientEvent> = drain(&mut a_events).into_iter().chain(drain(&mut b_events)).collect();
    let notices: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Conflict { applied: true, reason, .. } if reason == LWW_PATHSET_APPLIED))
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(s.server.service().stats().lww_stale_applied, 1);
}

#[tokio::test]
async fn test_stale_set_rejected_then_resynced() {
    let s = setup().await;
    let (a, _, _) = client(&s.bus, "alice").await;
    let (b, _, mut b_events) = client(&s.bus, "bob").await;

    a.submit(Patch::set(json!({"owner": "alice"})), None).await.unwrap();
    b.submit(Patch::set(json!({"owner": "bob"})), None).await.unwrap();
    wait_until(|| a.pending() == 0 && b.pending() == 0).await;
    wait_until(|| b.is_synced() && a.version() == b.version()).await;

    // Bob's strict op arrived second and lost; nothing was merged.
    assert_eq!(a.version(), 1);
    assert_eq!(a.state(), json!({"owner": "alice"}));
    assert_eq!(a.state(), b.state());
    let events = drain(&mut b_events);
    let rejected = events.iter().any(|e| matches!(e, ClientEvent::Rejected { .. }));
    let resynced = events.iter().any(|e| matches!(e, ClientEvent::Resync { .. }));
    assert!(rejected && resynced);
    assert_eq!(s.server.service().stats().ops_rejected, 1);

    let store = s.conflicts.lock().unwrap();
    assert_eq!(store.list(&ConflictQuery::default()).len(), 1);
}

#[tokio::test]
async fn test_reconnect_after_link_loss() {
    let s = setup().await;
    let (a, a_link, mut a_events) = client(&s.bus, "alice").await;
    let (b, _, _) = client(&s.bus, "bob").await;

    a_link.sever();
    b.submit(set("x", json!(1)), None).await.unwrap();
    wait_until(|| b.version() == 1).await;
    a.submit(set("y", json!(2)), None).await.unwrap();

    wait_until(|| a.version() == 2 && b.version() == 2 && a.pending() == 0).await;
    assert_eq!(a.state(), json!({"x": 1, "y": 2}));
    assert_eq!(a.state(), b.state());

    let events = drain(&mut a_events);
    assert!(events.contains(&ClientEvent::Disconnected));
    assert!(events.iter().any(|e| matches!(e, ClientEvent::Reconnected { .. })));
}

#[tokio::test]
async fn test_queue_full_backpressure() {
    let bus = BusRegistry::new();
    // No server on this bus: nothing is ever acknowledged.
    let transport = Arc::new(bus.transport(ROOM, "alice"));
    let config = ClientConfig {
        queue_capacity: 3,
        ..ClientConfig::for_testing("alice", DOC)
    };
    let client = SyncClient::new(transport, config);
    client.connect().await.unwrap();
    for i in 0..3 {
        client.submit(set(&format!("k{i}"), json!(i)), None).await.unwrap();
    }
    let err = client.submit(set("k3", json!(3)), None).await.unwrap_err();
    assert_eq!(err.code(), Some(concord_collab::protocol::ErrorCode::QueueFull));
    assert_eq!(client.pending(), 3);
    assert_eq!(client.optimistic_state(), json!({"k0": 0, "k1": 1, "k2": 2}));
}

#[tokio::test]
async fn test_server_audit_trail_replays_documents() {
    let s = setup().await;
    let (a, _, _) = client(&s.bus, "alice").await;
    a.submit(Patch::set(json!({"title": "plan", "tags": ["a"]})), None).await.unwrap();
    a.submit(Patch::merge(json!({"tags": ["a", "b"], "done": false})), None).await.unwrap();
    a.submit(set("meta.rev", json!(3)), None).await.unwrap();
    wait_until(|| a.version() == 3).await;

    let events = s.audit.lock().unwrap().events();
    assert!(verify_chain(&events).ok);
    let result = replay(&events, &ReplayConfig::default());
    assert_eq!(result.rejected, 0);
    assert_eq!(result.state["docs"][DOC], a.state());
}

/// Answers `hello` with a snapshot and acks ops, except that the first op
/// is swallowed as if its ack had been dropped on a full session queue.
async fn lossy_server(link: Arc<BusTransport>, mut inbox: mpsc::Receiver<Envelope>) {
    let mut version = 0u64;
    let mut state = json!({});
    let mut swallowed = false;
    while let Some(env) = inbox.recv().await {
        if !env.is_for("server") {
            continue;
        }
        let reply = match env.body {
            Message::Hello { doc_id } => Message::Snapshot {
                doc_id,
                version,
                state: state.clone(),
                schema_version: "1".into(),
            },
            Message::Op {
                doc_id,
                op_id,
                base_version,
                patch,
                ..
            } => {
                if !swallowed {
                    swallowed = true;
                    continue;
                }
                assert_eq!(base_version, version);
                state = patch.apply(&state).unwrap();
                version += 1;
                Message::Ack {
                    doc_id,
                    op_id,
                    new_version: version,
                }
            }
            _ => continue,
        };
        if link.send(Envelope::new("server", reply).to(env.from)).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_lost_ack_recovers_by_resync() {
    let bus = BusRegistry::new();
    let server_link = Arc::new(bus.transport(ROOM, "server"));
    server_link.open().await.unwrap();
    let inbox = server_link.on_message();
    let server = tokio::spawn(lossy_server(server_link, inbox));

    let config = ClientConfig {
        ack_timeout_ms: 100,
        ..ClientConfig::for_testing("alice", DOC)
    };
    let mut client = SyncClient::new(Arc::new(bus.transport(ROOM, "alice")), config);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_until(|| client.is_synced()).await;

    let op_id = client.submit(set("a", json!(1)), None).await.unwrap();
    client.submit(set("b", json!(2)), None).await.unwrap();
    let reached = timeout(Duration::from_secs(5), client.wait_for_version(2)).await;
    assert_eq!(reached.ok(), Some(true));
    assert_eq!(client.state(), json!({"a": 1, "b": 2}));
    assert_eq!(client.pending(), 0);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Resync { reason } if reason.contains(&op_id))));
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Acked { op_id: acked, new_version: 1 } if *acked == op_id)));

    client.close().await;
    server.abort();
}
