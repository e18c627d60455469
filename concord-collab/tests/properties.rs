//! Cross-module properties: determinism, strict-policy safety, conflict
//! idempotence, diff exactness, tamper evidence, veto, locator bounds.

use std::sync::Arc;

use concord_collab::audit::{verify_chain, AuditConfig, AuditEvent, AuditLog, ReplayConfig, STATE_SET};
use concord_collab::conflict::{ConflictCandidate, ConflictKind, ConflictQuery, ConflictStore, ConflictStoreConfig, Severity};
use concord_collab::divergence::{deep_diff, locate_first_divergence, DiffKind, DiffLimits, LocateOutcome};
use concord_collab::replica::{effective_policy, Replica};
use concord_collab::upgrade::{
    FnStep, Role, SchemaDocument, StepRegistry, UpgradeConfig, UpgradeCoordinator, UpgradePhase, UpgradeVote, Vote,
};
use concord_collab::Message;
use concord_core::time::now_ms;
use concord_core::{ConcurrencyPolicy, Patch, PathOp};
use serde_json::{json, Value};

/// A fixed mix of every patch kind.
fn op_sequence(n: usize) -> Vec<Patch> {
    (0..n)
        .map(|i| match i % 4 {
            0 => Patch::path_set(vec![PathOp::new(format!("items.k{i}"), json!(i))]),
            1 => Patch::merge(json!({"counter": i, "meta": {"last": format!("op{i}")}})),
            2 => Patch::path_set(vec![
                PathOp::new("opt.bounds.lo", json!([i, 0, 0])),
                PathOp::new("opt.bounds.hi", json!([i + 1, 1, 1])),
            ]),
            _ => Patch::set(json!({"reset": i, "items": {"seed": i}})),
        })
        .collect()
}

fn run(ops: &[Patch]) -> Replica {
    let mut replica = Replica::new("doc", "1");
    for (base, patch) in ops.iter().enumerate() {
        replica
            .apply(base as u64, patch, ConcurrencyPolicy::Strict)
            .unwrap();
    }
    replica
}

#[test]
fn test_replay_of_same_sequence_is_deterministic() {
    for n in [0, 1, 5, 17, 40] {
        let ops = op_sequence(n);
        let a = run(&ops);
        let b = run(&ops);
        assert_eq!(a.version, n as u64);
        assert_eq!(a.state_hash(), b.state_hash(), "sequence of {n} ops");
    }
}

#[test]
fn test_stale_strict_ops_never_mutate() {
    let mut replica = run(&op_sequence(6));
    let before = replica.clone();
    let stale_bases = [0, 3, 5, 7, 100];

    for base in stale_bases {
        for patch in [Patch::set(json!({"x": base})), Patch::merge(json!({"x": base}))] {
            // Even asking for LWW does not loosen Set/Merge.
            let (policy, violation) =
                effective_policy(&patch, Some(ConcurrencyPolicy::LwwPathset), ConcurrencyPolicy::LwwPathset);
            assert_eq!(policy, ConcurrencyPolicy::Strict);
            assert!(violation);
            assert!(replica.apply(base, &patch, policy).is_err());
            assert_eq!(replica, before);
        }
    }

    for base in stale_bases {
        let patch = Patch::path_set(vec![PathOp::new("late", json!(base))]);
        let (policy, _) = effective_policy(&patch, None, ConcurrencyPolicy::LwwPathset);
        let applied = replica.apply(base, &patch, policy).unwrap();
        assert!(applied.stale);
        assert_eq!(replica.state["late"], json!(base));
    }
    assert_eq!(replica.version, before.version + stale_bases.len() as u64);
}

#[test]
fn test_conflict_add_is_idempotent() {
    let mut store = ConflictStore::new(ConflictStoreConfig::for_testing());
    let candidate = |severity| {
        ConflictCandidate::new(ConflictKind::HashMismatch, severity, "state hash differs")
            .source_peer("peer-b")
            .related("docId", "doc-1")
            .payload(json!({"local": "aa", "ref": "bb"}))
    };
    let now = now_ms();
    let first = store.add(candidate(Severity::Warn), now);
    let second = store.add(candidate(Severity::Warn), now + 250);
    assert_eq!(first.id, second.id);
    assert_eq!(store.len(), 1);

    let records = store.list(&ConflictQuery::default());
    assert_eq!(records[0].occurrences, 2);
    assert_eq!(records[0].severity, Severity::Warn);
    assert_eq!(records[0].created_at, now);
    assert_eq!(records[0].updated_at, now + 250);
}

#[test]
fn test_diff_report_exact() {
    let limits = DiffLimits::default();
    let report = deep_diff(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}}), &limits);
    assert!(!report.ok);
    assert_eq!(report.first_mismatch_path.as_deref(), Some("a.b"));
    assert_eq!(report.diffs.len(), 1);
    let entry = &report.diffs[0];
    assert_eq!(entry.path, "a.b");
    assert_eq!(entry.kind, DiffKind::Value);
    assert_eq!(entry.local, Some(json!(1)));
    assert_eq!(entry.reference, Some(json!(2)));

    let same = json!({"a": {"b": [1, 2, {"c": null}]}});
    let report = deep_diff(&same, &same.clone(), &limits);
    assert!(report.ok);
    assert!(report.diffs.is_empty());
    assert_eq!(report.local_hash, report.ref_hash);
}

fn recorded_trail(n: usize) -> Vec<AuditEvent> {
    let mut log = AuditLog::in_memory(AuditConfig::default(), "s", "c");
    for i in 0..n {
        log.append(STATE_SET, true, json!({"path": format!("docs.d.k{i}"), "value": i}))
            .unwrap();
    }
    log.events()
}

#[test]
fn test_any_payload_edit_breaks_chain_at_that_index() {
    let trail = recorded_trail(12);
    assert!(verify_chain(&trail).ok);

    for index in 0..trail.len() {
        for edit in [json!(-1), json!("x"), Value::Null] {
            let mut tampered = trail.clone();
            tampered[index].payload["value"] = edit;
            let report = verify_chain(&tampered);
            assert!(!report.ok);
            assert_eq!(report.first_bad_index, Some(index));
            assert_eq!(report.verified, index);
        }
    }
}

#[test]
fn test_any_reject_vetoes() {
    let mut registry = StepRegistry::new();
    registry.register(FnStep::new("noop", "1", "2", |s| Ok(s.clone())));
    let registry = Arc::new(registry);

    for approvals in 0..6usize {
        let mut c = UpgradeCoordinator::new(
            "a",
            Role::Coordinator,
            UpgradeConfig::default(),
            registry.clone(),
            SchemaDocument::new("1", json!({})),
        );
        let peers: Vec<String> = (0..=approvals).map(|i| format!("p{i}")).collect();
        for p in &peers {
            c.peer_joined(p.clone());
        }
        let Message::UpgradePropose(proposal) = c.propose("2").unwrap() else {
            panic!("expected a proposal");
        };
        c.vote(Vote::Approve, None).unwrap();
        for (i, voter) in peers.iter().enumerate() {
            let vote = if i == 0 { Vote::Reject } else { Vote::Approve };
            let replies = c.handle(
                voter,
                &Message::UpgradeVote(UpgradeVote {
                    proposal_id: proposal.proposal_id.clone(),
                    voter: voter.clone(),
                    vote,
                    reason: None,
                }),
            );
            if i == 0 {
                assert!(
                    matches!(replies.as_slice(), [Message::UpgradeStatus(s)] if s.phase == UpgradePhase::Failed),
                    "a reject answers with the failed status"
                );
            }
        }
        assert!(!c.is_approved(), "{approvals} approvals plus one reject");
    }
}

#[test]
fn test_locator_finds_index_in_log_calls() {
    let config = ReplayConfig::default();
    for n in [1usize, 2, 7, 64, 200] {
        let left = recorded_trail(n);
        let bound = 2 * ((n as f64).log2().ceil() as usize + 1);
        for k in [0, n / 2, n - 1] {
            let mut right = left.clone();
            right[k].payload["value"] = json!(-1);
            let report = locate_first_divergence(&left, &right, &config);
            assert_eq!(report.outcome, LocateOutcome::Diverged { first_index: k }, "n={n} k={k}");
            assert!(report.replay_calls <= bound, "n={n}: {} calls", report.replay_calls);
        }

        let report = locate_first_divergence(&left, &left, &config);
        assert_eq!(report.outcome, LocateOutcome::Identical);
    }
}
