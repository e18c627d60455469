use criterion::{black_box, criterion_group, criterion_main, Criterion};
use concord_collab::audit::{replay, verify_chain, AuditConfig, AuditEvent, AuditLog, ReplayConfig, STATE_SET};
use concord_collab::conflict::{ConflictCandidate, ConflictKind, ConflictStore, ConflictStoreConfig, Severity};
use concord_collab::divergence::{deep_diff, locate_first_divergence, DiffLimits};
use concord_collab::protocol::{decode, Envelope, Message, MessageLimits};
use concord_core::{canonical_hash, Patch, PathOp};
use serde_json::{json, Value};

/// A document of `n` nested records.
fn document(n: usize) -> Value {
    let items: serde_json::Map<String, Value> = (0..n)
        .map(|i| {
            (
                format!("item{i}"),
                json!({"id": i, "name": format!("part-{i}"), "dims": [i, i * 2, i * 3], "tags": {"a": true}}),
            )
        })
        .collect();
    json!({"schemaVersion": "1", "items": items})
}

fn trail(n: usize) -> Vec<AuditEvent> {
    let mut log = AuditLog::in_memory(AuditConfig::default(), "bench", "bench");
    for i in 0..n {
        log.append(STATE_SET, true, json!({"path": format!("docs.d.k{}", i % 64), "value": i}))
            .unwrap();
    }
    log.events()
}

fn bench_canonical_hash_1000(c: &mut Criterion) {
    let doc = document(1000);
    c.bench_function("canonical_hash_1000_items", |b| {
        b.iter(|| {
            black_box(canonical_hash(black_box(&doc)));
        })
    });
}

fn bench_deep_diff_identical(c: &mut Criterion) {
    let doc = document(500);
    let other = doc.clone();
    let limits = DiffLimits::default();
    c.bench_function("deep_diff_500_identical", |b| {
        b.iter(|| {
            black_box(deep_diff(black_box(&doc), black_box(&other), &limits));
        })
    });
}

fn bench_deep_diff_scattered(c: &mut Criterion) {
    let doc = document(500);
    let mut other = doc.clone();
    for i in (0..500).step_by(25) {
        other["items"][format!("item{i}")]["name"] = json!("changed");
    }
    let limits = DiffLimits::default();
    c.bench_function("deep_diff_500_20_changes", |b| {
        b.iter(|| {
            black_box(deep_diff(black_box(&doc), black_box(&other), &limits));
        })
    });
}

fn bench_patch_apply(c: &mut Criterion) {
    let doc = document(200);
    let patch = Patch::path_set(vec![
        PathOp::new("items.item7.name", json!("renamed")),
        PathOp::new("opt.bounds.lo", json!([0, 0, 0])),
    ]);
    c.bench_function("patch_apply_path_set_200", |b| {
        b.iter(|| {
            black_box(patch.apply(black_box(&doc)).unwrap());
        })
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let limits = MessageLimits::default();
    let env = Envelope::new(
        "alice",
        Message::Op {
            doc_id: "doc-1".into(),
            op_id: "op-1".into(),
            base_version: 42,
            patch: Patch::merge(json!({"title": "plan", "pages": 3})),
            policy: None,
        },
    );
    c.bench_function("envelope_encode_decode", |b| {
        b.iter(|| {
            let text = env.encode(&limits).unwrap();
            black_box(decode(&text, &limits).unwrap());
        })
    });
}

fn bench_verify_chain_1000(c: &mut Criterion) {
    let events = trail(1000);
    c.bench_function("verify_chain_1000", |b| {
        b.iter(|| {
            black_box(verify_chain(black_box(&events)));
        })
    });
}

fn bench_replay_1000(c: &mut Criterion) {
    let events = trail(1000);
    let config = ReplayConfig::default();
    c.bench_function("replay_1000", |b| {
        b.iter(|| {
            black_box(replay(black_box(&events), &config));
        })
    });
}

fn bench_locate_divergence_1000(c: &mut Criterion) {
    let left = trail(1000);
    let mut right = left.clone();
    right[700].payload["value"] = json!(-1);
    let config = ReplayConfig::default();
    c.bench_function("locate_divergence_1000", |b| {
        b.iter(|| {
            black_box(locate_first_divergence(&left, &right, &config));
        })
    });
}

fn bench_conflict_add_dedup(c: &mut Criterion) {
    let mut store = ConflictStore::new(ConflictStoreConfig::default());
    let mut now = 0u64;
    c.bench_function("conflict_add_dedup", |b| {
        b.iter(|| {
            now += 1;
            let candidate = ConflictCandidate::new(ConflictKind::HashMismatch, Severity::Warn, "hash differs")
                .source_peer("peer-b")
                .payload(json!({"local": "aa", "ref": "bb"}));
            black_box(store.add(candidate, now));
        })
    });
}

criterion_group!(
    benches,
    bench_canonical_hash_1000,
    bench_deep_diff_identical,
    bench_deep_diff_scattered,
    bench_patch_apply,
    bench_envelope_roundtrip,
    bench_verify_chain_1000,
    bench_replay_1000,
    bench_locate_divergence_1000,
    bench_conflict_add_dedup,
);
criterion_main!(benches);
