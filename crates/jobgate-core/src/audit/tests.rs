//! Tests for the audit log.

use rusqlite::Connection;

use super::*;
use crate::crypto::ChainHasher;
use crate::identity::Identity;

fn identity() -> Identity {
    Identity::new("alice", vec!["operator".to_string()])
}

fn event(event_type: &str, correlation_id: &str) -> AuditEvent {
    AuditEvent::new(
        event_type,
        correlation_id,
        &identity(),
        "00ff",
        serde_json::json!({"from": "queued", "to": "running"}),
    )
}

#[test]
fn test_append_assigns_sequential_seq() {
    let log = AuditLog::in_memory().unwrap();
    let (s1, _) = log.append(event(JOB_SUBMITTED, "c-1")).unwrap();
    let (s2, _) = log.append(event(JOB_TRANSITIONED, "c-1")).unwrap();
    let (s3, _) = log.append(event(JOB_TRANSITIONED, "c-2")).unwrap();
    assert_eq!((s1, s2, s3), (1, 2, 3));
}

#[test]
fn test_empty_log_tail_is_genesis() {
    let log = AuditLog::in_memory().unwrap();
    assert_eq!(log.tail_hash(), ChainHasher::GENESIS_PREV_HASH);
    assert!(log.verify_all().is_ok());
}

#[test]
fn test_chain_links_consecutive_events() {
    let log = AuditLog::in_memory().unwrap();
    let (_, h1) = log.append(event(JOB_SUBMITTED, "c-1")).unwrap();
    let (_, h2) = log.append(event(JOB_TRANSITIONED, "c-1")).unwrap();
    assert_ne!(h1, h2);
    assert_eq!(log.tail_hash(), h2);

    let stored = log.read_one(2).unwrap();
    assert_eq!(stored.prev_hash, Some(h1));
    assert_eq!(stored.hash, Some(h2));
}

#[test]
fn test_verify_reproduces_tail_hash() {
    let log = AuditLog::in_memory().unwrap();
    for i in 0..20 {
        log.append(event(JOB_TRANSITIONED, &format!("c-{i}"))).unwrap();
    }
    log.verify_all().unwrap();
    // Verification from the middle uses the stored previous hash.
    log.verify(10).unwrap();
}

#[test]
fn test_tail_hash_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");

    let tail = {
        let log = AuditLog::open(&path).unwrap();
        log.append(event(JOB_SUBMITTED, "c-1")).unwrap();
        log.append(event(JOB_TRANSITIONED, "c-1")).unwrap();
        log.tail_hash()
    };

    let reopened = AuditLog::open(&path).unwrap();
    assert_eq!(reopened.tail_hash(), tail);
    reopened.verify_all().unwrap();
}

#[test]
fn test_mutated_event_fails_verification_at_that_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");

    {
        let log = AuditLog::open(&path).unwrap();
        for i in 0..5 {
            log.append(event(JOB_TRANSITIONED, &format!("c-{i}"))).unwrap();
        }
        log.verify_all().unwrap();
    }

    // Tamper with event 3 out-of-band.
    let conn = Connection::open(&path).unwrap();
    conn.execute(
        "UPDATE audit_events SET subject = 'mallory' WHERE seq = 3",
        [],
    )
    .unwrap();
    drop(conn);

    let log = AuditLog::open(&path).unwrap();
    match log.verify_all() {
        Err(AuditError::ChainBroken { seq, .. }) => assert_eq!(seq, 3),
        other => panic!("expected ChainBroken at seq 3, got {other:?}"),
    }
    // A range that starts after the mutation still verifies: the chain
    // linkage from event 4 onward is intact relative to event 3's stored
    // hash.
    log.verify(4).unwrap();
}

#[test]
fn test_read_by_correlation_orders_by_seq() {
    let log = AuditLog::in_memory().unwrap();
    log.append(event(JOB_SUBMITTED, "c-1")).unwrap();
    log.append(event(JOB_TRANSITIONED, "c-2")).unwrap();
    log.append(event(JOB_TRANSITIONED, "c-1")).unwrap();

    let events = log.read_by_correlation("c-1").unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].seq, Some(1));
    assert_eq!(events[1].seq, Some(3));
    assert_eq!(events[0].event_type, JOB_SUBMITTED);
}

#[test]
fn test_result_digest_participates_in_hash() {
    let log = AuditLog::in_memory().unwrap();
    let base = event(JOB_TRANSITIONED, "c-1");
    let mut with_digest = base.clone();
    with_digest.result_digest = Some("aabb".to_string());

    let (_, h1) = log.append(base).unwrap();
    let log2 = AuditLog::in_memory().unwrap();
    let (_, h2) = log2.append(with_digest).unwrap();
    assert_ne!(h1, h2);
}

#[test]
fn test_stats() {
    let log = AuditLog::in_memory().unwrap();
    log.append(event(JOB_SUBMITTED, "c-1")).unwrap();
    log.append(event(JOB_PURGED, "c-1")).unwrap();

    let stats = log.stats().unwrap();
    assert_eq!(stats.event_count, 2);
    assert_eq!(stats.max_seq, 2);
}

#[test]
fn test_read_one_not_found() {
    let log = AuditLog::in_memory().unwrap();
    assert!(matches!(
        log.read_one(42),
        Err(AuditError::EventNotFound { seq: 42 })
    ));
}
