//! Gateway store-and-forward scenarios.

use crate::test_utils::*;
use emberlink_core::{Classification, CoreError, ManualClock};
use emberlink_gateway::{GatewayBridge, MemoryRemoteStore, RemoteStore};
use emberlink_mesh::BackoffSchedule;
use emberlink_transport::{LinkHub, LongRangeRadioTransport, Transport};
use emberlink_store::MessageStore;
use emberlink_mesh::MeshNode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_gateway_relays_for_offline_sender() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let cloud = Arc::new(MemoryRemoteStore::new());

    // A and B share an air space; C is somewhere else entirely and only
    // ever touches the cloud
    let hub = LinkHub::new();
    let a = spawn_short_node("alice", &[hub.clone()], clock.clone(), |_| {});
    let b = spawn_short_node("bravo", &[hub.clone()], clock.clone(), |_| {});
    let c = spawn_short_node("carol", &[], clock.clone(), |_| {});
    let (c_hits, _sub) = count_deliveries(&c, Some(Classification::Text));

    wait_until("a and b discover each other", || {
        a.status().unwrap().peer_count == 1 && b.status().unwrap().peer_count == 1
    })
    .await;

    // A has no internet; it can only hand the message into the mesh
    let id = a
        .submit(
            Classification::Text,
            "carol",
            b"see you out there".to_vec(),
            3_600_000,
        )
        .unwrap();
    a.tick_now().await.unwrap();

    wait_until("b carries the message", || {
        b.store().lock().unwrap().get(&id).unwrap().is_some()
    })
    .await;

    // B comes online, becomes a gateway, and uploads on A's behalf
    let b_bridge = GatewayBridge::new(
        "bravo",
        b.store(),
        b.relay(),
        cloud.clone(),
        clock.clone(),
        BackoffSchedule::default(),
    );
    b_bridge.set_online(true);
    let summary = b_bridge.run_cycle().await.unwrap();
    assert!(summary.uploaded >= 1);
    assert!(cloud
        .fetch_message(&id.to_hex())
        .await
        .unwrap()
        .is_some());

    // C comes online later, becomes a gateway, and pulls exactly once
    let c_bridge = GatewayBridge::new(
        "carol",
        c.store(),
        c.relay(),
        cloud.clone(),
        clock.clone(),
        BackoffSchedule::default(),
    );
    c_bridge.set_online(true);
    let summary = c_bridge.run_cycle().await.unwrap();
    assert_eq!(summary.pulled, 1);

    wait_until("c receives the message", || {
        c_hits.load(Ordering::SeqCst) == 1
    })
    .await;

    // Retired remotely: a second cycle finds nothing new
    assert!(cloud.fetch_message(&id.to_hex()).await.unwrap().is_none());
    let summary = c_bridge.run_cycle().await.unwrap();
    assert_eq!(summary.pulled, 0);
    assert_eq!(c_hits.load(Ordering::SeqCst), 1);

    b_bridge.shutdown();
    c_bridge.shutdown();
    for node in [&a, &b, &c] {
        node.shutdown();
    }
}

#[tokio::test]
async fn test_oversized_payload_rejected_on_long_range() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let hub = LinkHub::new();

    let radio: Arc<dyn Transport> = LongRangeRadioTransport::spawn(
        "alice",
        "alice-bridge",
        hub,
        200,
        TEST_HEARTBEAT_MS,
        600_000,
        clock.clone(),
    );
    let node = MeshNode::spawn(
        &manual_config("alice"),
        MessageStore::open(":memory:").unwrap(),
        vec![radio],
        clock,
    );

    let result = node.submit(Classification::Text, "bob", vec![0u8; 500], 60_000);

    assert!(matches!(result, Err(CoreError::PayloadTooLarge { .. })));
    // Rejected before the store was touched: nothing to retry later
    assert_eq!(node.status().unwrap().pending_count, 0);

    node.shutdown();
}
