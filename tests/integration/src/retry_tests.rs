//! TTL expiry and retry-bound behavior under a virtual clock.

use crate::test_utils::*;
use emberlink_core::{Classification, DeliveryState, ManualClock};
use emberlink_transport::LinkHub;
use std::sync::Arc;

#[tokio::test]
async fn test_ttl_expires_instead_of_late_attempt() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();
    let alice = spawn_short_node("alice", &[hub], clock.clone(), |_| {});

    let id = alice
        .submit(Classification::Text, "bob", b"hello".to_vec(), 60_000)
        .unwrap();

    // First attempt inside the ttl window
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 1);

    // Past the deadline nothing is attempted again, ever
    clock.advance(61_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.attempted, 0);
    assert_eq!(message_state(&alice, &id), Some(DeliveryState::Expired));
    assert_eq!(attempt_count(&alice, &id), 1);

    clock.advance(3_600_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 0);

    alice.shutdown();
}

#[tokio::test]
async fn test_failed_after_exactly_max_retries() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();
    let alice = spawn_short_node("alice", &[hub.clone()], clock.clone(), |c| {
        c.scheduler.max_retries = 3;
    });

    // Radio off: every attempt fails with TransportUnavailable
    hub.set_link("alice", false);

    let id = alice
        .submit(Classification::Text, "bob", b"hello".to_vec(), 86_400_000)
        .unwrap();

    // Attempt 1: immediately due
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.requeued, 1);

    // Not due again until the backoff elapses
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 0);

    // Attempt 2 after 5s, attempt 3 after 10s more exhausts the budget
    clock.advance(5_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.requeued, 1);

    clock.advance(10_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.failed, 1);

    assert_eq!(attempt_count(&alice, &id), 3);
    assert_eq!(message_state(&alice, &id), Some(DeliveryState::Failed));

    // Terminal: no further attempts no matter how long we wait
    clock.advance(3_600_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(attempt_count(&alice, &id), 3);

    alice.shutdown();
}

#[tokio::test]
async fn test_unacked_handoff_counts_toward_budget() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();
    // Link is up but nobody answers: hand-offs succeed, acks never come
    let alice = spawn_short_node("alice", &[hub], clock.clone(), |c| {
        c.scheduler.max_retries = 2;
    });

    let id = alice
        .submit(Classification::Text, "bob", b"anyone there".to_vec(), 86_400_000)
        .unwrap();

    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.awaiting_ack, 1);

    clock.advance(5_000);
    let summary = alice.tick_now().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(message_state(&alice, &id), Some(DeliveryState::Failed));

    alice.shutdown();
}
