//! Shared helpers for simulated-topology tests.

use emberlink_core::{Classification, Clock, Config, DeliveryState, ManualClock, MessageId};
use emberlink_mesh::{MeshNode, Subscription};
use emberlink_store::MessageStore;
use emberlink_transport::{LinkHub, ShortRangePeerTransport, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fast heartbeat so discovery settles quickly in tests.
pub const TEST_HEARTBEAT_MS: u64 = 20;

/// Build a node config with background loops effectively disabled; the
/// tests drive the scheduler through `tick_now`.
pub fn manual_config(node_id: &str) -> Config {
    let mut config = Config::default_config();
    config.node.node_id = node_id.to_string();
    config.scheduler.tick_interval_ms = 3_600_000;
    config
}

/// Spawn a node with one short-range transport per hub in `hubs`.
pub fn spawn_short_node(
    node_id: &str,
    hubs: &[LinkHub],
    clock: Arc<ManualClock>,
    tweak: impl FnOnce(&mut Config),
) -> Arc<MeshNode> {
    let mut config = manual_config(node_id);
    tweak(&mut config);

    let transports: Vec<Arc<dyn Transport>> = hubs
        .iter()
        .map(|hub| {
            ShortRangePeerTransport::spawn(
                node_id,
                node_id,
                hub.clone(),
                config.transport.short_range_max_payload,
                TEST_HEARTBEAT_MS,
                config.transport.peer_quiet_period_ms,
                clock.clone() as Arc<dyn Clock>,
            ) as Arc<dyn Transport>
        })
        .collect();

    MeshNode::spawn(
        &config,
        MessageStore::open(":memory:").expect("in-memory store"),
        transports,
        clock,
    )
}

/// Register a counting subscriber on a node.
pub fn count_deliveries(
    node: &MeshNode,
    classification: Option<Classification>,
) -> (Arc<AtomicUsize>, Subscription) {
    let counter = Arc::new(AtomicUsize::new(0));
    let hits = counter.clone();
    let subscription = node.on_message(classification, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    (counter, subscription)
}

/// Poll `condition` until it holds or a five second deadline passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Current stored state of a message on a node.
pub fn message_state(node: &MeshNode, id: &MessageId) -> Option<DeliveryState> {
    node.store()
        .lock()
        .expect("store lock")
        .get(id)
        .expect("store read")
        .map(|m| m.state)
}

/// Stored attempt count of a message on a node.
pub fn attempt_count(node: &MeshNode, id: &MessageId) -> u32 {
    node.store()
        .lock()
        .expect("store lock")
        .get(id)
        .expect("store read")
        .map(|m| m.attempt_count)
        .unwrap_or(0)
}

/// Initialize tracing once for a test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
