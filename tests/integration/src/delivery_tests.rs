//! Basic delivery and dedup scenarios.

use crate::test_utils::*;
use emberlink_core::{Classification, DeliveryState, ManualClock, Message, BROADCAST};
use emberlink_transport::LinkHub;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_basic_delivery_between_two_peers() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();

    let alice = spawn_short_node("alice", &[hub.clone()], clock.clone(), |_| {});
    let bob = spawn_short_node("bob", &[hub.clone()], clock.clone(), |_| {});
    let (bob_hits, _sub) = count_deliveries(&bob, Some(Classification::Text));

    wait_until("discovery", || {
        alice.status().unwrap().peer_count == 1 && bob.status().unwrap().peer_count == 1
    })
    .await;

    let id = alice
        .submit(Classification::Text, "bob", b"hello".to_vec(), 60_000)
        .unwrap();

    // One scheduler tick hands the frame to bob
    alice.tick_now().await.unwrap();
    wait_until("local delivery on bob", || {
        bob_hits.load(Ordering::SeqCst) == 1
    })
    .await;

    // Bob's confirmation flows back and settles the record
    wait_until("ack queued on bob", || {
        bob.status().unwrap().pending_count == 1
    })
    .await;
    bob.tick_now().await.unwrap();
    wait_until("delivery confirmed on alice", || {
        message_state(&alice, &id) == Some(DeliveryState::Delivered)
    })
    .await;

    // Exactly one callback, even after everything settles
    assert_eq!(bob_hits.load(Ordering::SeqCst), 1);

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn test_duplicate_frames_deliver_exactly_once() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();

    // Three peers in the same air space: every broadcast arrives directly
    // and again via each neighbour's re-relay
    let alice = spawn_short_node("alice", &[hub.clone()], clock.clone(), |_| {});
    let bob = spawn_short_node("bob", &[hub.clone()], clock.clone(), |_| {});
    let carol = spawn_short_node("carol", &[hub.clone()], clock.clone(), |_| {});

    let (bob_hits, _bob_sub) = count_deliveries(&bob, Some(Classification::Announcement));
    let (carol_hits, _carol_sub) = count_deliveries(&carol, Some(Classification::Announcement));

    wait_until("full discovery", || {
        alice.status().unwrap().peer_count == 2
            && bob.status().unwrap().peer_count == 2
            && carol.status().unwrap().peer_count == 2
    })
    .await;

    let id = alice
        .submit(
            Classification::Announcement,
            BROADCAST,
            b"water truck at 9".to_vec(),
            60_000,
        )
        .unwrap();

    alice.tick_now().await.unwrap();
    wait_until("broadcast reaches both peers", || {
        bob_hits.load(Ordering::SeqCst) >= 1 && carol_hits.load(Ordering::SeqCst) >= 1
    })
    .await;

    // Let the re-relays and their duplicates settle
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert_eq!(bob_hits.load(Ordering::SeqCst), 1);
    assert_eq!(carol_hits.load(Ordering::SeqCst), 1);
    // Hand-off is the delivery signal for broadcasts
    assert_eq!(message_state(&alice, &id), Some(DeliveryState::Delivered));

    alice.shutdown();
    bob.shutdown();
    carol.shutdown();
}

#[tokio::test]
async fn test_duplicate_submit_is_one_record() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let alice = spawn_short_node("alice", &[], clock, |_| {});

    let message = Message::new(
        Classification::Text,
        "alice",
        "bob",
        b"client retry".to_vec(),
        60_000,
        5,
        1_000,
    );

    let first = alice.submit_message(message.clone()).unwrap();
    let second = alice.submit_message(message).unwrap();

    assert_eq!(first, second);
    assert_eq!(alice.status().unwrap().pending_count, 1);

    alice.shutdown();
}
