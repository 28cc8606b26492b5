//! Mesh node - High-level coordinator.
//!
//! One long-lived object owns the store, dedup cache, transports, relay,
//! and scheduler; producers and the UI layer hold a handle to it instead
//! of reaching for globals. `submit` accepts synchronously (persist to
//! queued), delivery happens in the background loops.

use crate::orchestrator::NetworkOrchestrator;
use crate::relay::RelayEngine;
use crate::scheduler::{BackoffSchedule, DeliveryScheduler, TickSummary};
use crate::subscriptions::{Subscription, SubscriptionRegistry};
use emberlink_core::{
    Classification, Clock, Config, CoreResult, Message, MessageId, NetworkHealth,
};
use emberlink_store::{DedupCache, MessageStore};
use emberlink_transport::{Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Snapshot of node condition for external display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Local identity
    pub node_id: String,
    /// Current link condition summary
    pub health: NetworkHealth,
    /// Messages awaiting delivery
    pub pending_count: usize,
    /// Peers in range across all transports
    pub peer_count: usize,
}

/// Long-lived delivery core instance.
pub struct MeshNode {
    node_id: String,
    store: Arc<Mutex<MessageStore>>,
    subscriptions: SubscriptionRegistry,
    orchestrator: Arc<NetworkOrchestrator>,
    relay: Arc<RelayEngine>,
    scheduler: Arc<DeliveryScheduler>,
    clock: Arc<dyn Clock>,
    default_hop_limit: u8,
    stop_tx: watch::Sender<bool>,
}

impl MeshNode {
    /// Wire the core together and start its background loops.
    ///
    /// Spawns one event pump per transport, the ack pump, and the
    /// scheduler tick loop. Everything stops on [`MeshNode::shutdown`].
    pub fn spawn(
        config: &Config,
        store: MessageStore,
        transports: Vec<Arc<dyn Transport>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let store = Arc::new(Mutex::new(store.with_history_cap(config.relay.history_cap)));
        let dedup = Arc::new(Mutex::new(DedupCache::new(config.relay.dedup_capacity)));
        let subscriptions = SubscriptionRegistry::new();
        let orchestrator = Arc::new(NetworkOrchestrator::new(transports.clone()));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let relay = Arc::new(RelayEngine::new(
            config.node.node_id.clone(),
            store.clone(),
            dedup,
            subscriptions.clone(),
            transports.clone(),
            clock.clone(),
            ack_tx,
            config.relay.default_hop_limit,
        ));

        let scheduler = Arc::new(DeliveryScheduler::new(
            store.clone(),
            orchestrator.clone(),
            clock.clone(),
            BackoffSchedule::default(),
            config.scheduler.max_retries,
            config.scheduler.attempt_timeout_ms,
            config.scheduler.max_concurrent_attempts,
        ));

        let (stop_tx, _) = watch::channel(false);

        let node = Arc::new(Self {
            node_id: config.node.node_id.clone(),
            store: store.clone(),
            subscriptions,
            orchestrator: orchestrator.clone(),
            relay: relay.clone(),
            scheduler: scheduler.clone(),
            clock: clock.clone(),
            default_hop_limit: config.relay.default_hop_limit,
            stop_tx: stop_tx.clone(),
        });

        for transport in transports {
            if let Some(events) = transport.take_events() {
                tokio::spawn(pump_transport(
                    relay.clone(),
                    transport,
                    events,
                    stop_tx.subscribe(),
                ));
            } else {
                warn!(
                    transport = transport.name(),
                    "Transport event stream already taken; relay will not see its frames"
                );
            }
        }

        tokio::spawn(pump_acks(
            node.clone(),
            ack_rx,
            stop_tx.subscribe(),
        ));

        tokio::spawn(run_scheduler_loop(
            scheduler,
            config.scheduler.tick_interval_ms,
            stop_tx.subscribe(),
        ));

        info!(node_id = %node.node_id, "Mesh node started");
        node
    }

    /// Accept a message for delivery. Synchronous: the message is durably
    /// queued before this returns; delivery is asynchronous.
    pub fn submit(
        &self,
        classification: Classification,
        recipient: impl Into<String>,
        payload: Vec<u8>,
        ttl_ms: u64,
    ) -> CoreResult<MessageId> {
        let message = Message::new(
            classification,
            self.node_id.clone(),
            recipient,
            payload,
            ttl_ms,
            self.default_hop_limit,
            self.clock.now_ms(),
        );
        self.submit_message(message)
    }

    /// Accept a fully formed message, keeping its caller-supplied id.
    ///
    /// Idempotent: re-submitting a known id returns that id without a
    /// second insert. Oversized payloads are rejected before the store is
    /// touched.
    pub fn submit_message(&self, message: Message) -> CoreResult<MessageId> {
        self.orchestrator.check_payload(&message)?;

        let stored = self
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(&message)?;

        debug!(
            message_id = %stored.id,
            classification = ?stored.classification,
            "Message accepted"
        );
        Ok(stored.id)
    }

    /// Register a local subscriber for delivered messages.
    ///
    /// `classification: None` receives everything. The callback runs on the
    /// relay task and must not block.
    pub fn on_message<F>(
        &self,
        classification: Option<Classification>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(classification, callback)
    }

    /// Run one scheduler pass immediately (tests drive time manually).
    pub async fn tick_now(&self) -> CoreResult<TickSummary> {
        self.scheduler.tick().await
    }

    /// Current node condition snapshot.
    pub fn status(&self) -> CoreResult<NodeStatus> {
        let pending_count = self
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending_count()?;
        let peer_count = self
            .orchestrator
            .transports()
            .iter()
            .map(|t| t.peers().len())
            .sum();

        Ok(NodeStatus {
            node_id: self.node_id.clone(),
            health: self.orchestrator.network_health(),
            pending_count,
            peer_count,
        })
    }

    /// Current link condition summary.
    pub fn health(&self) -> NetworkHealth {
        self.orchestrator.network_health()
    }

    /// Relay engine handle, used by the gateway bridge for injection.
    pub fn relay(&self) -> Arc<RelayEngine> {
        self.relay.clone()
    }

    /// Shared message store handle.
    pub fn store(&self) -> Arc<Mutex<MessageStore>> {
        self.store.clone()
    }

    /// Local identity.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stop background loops and the transports.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        for transport in self.orchestrator.transports() {
            transport.shutdown();
        }
        info!(node_id = %self.node_id, "Mesh node stopped");
    }
}

async fn pump_transport(
    relay: Arc<RelayEngine>,
    transport: Arc<dyn Transport>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::Frame { bytes, origin } => {
                        let outcome = relay.handle_frame(&bytes, &origin, &transport).await;
                        debug!(
                            transport = transport.name(),
                            origin = %origin.id,
                            outcome = ?outcome,
                            "Frame processed"
                        );
                    }
                    TransportEvent::PeerAppeared(peer) => {
                        info!(transport = transport.name(), peer_id = %peer.id, "Peer appeared");
                    }
                    TransportEvent::PeerUpdated(_) => {}
                    TransportEvent::PeerVanished { peer_id } => {
                        info!(transport = transport.name(), peer_id = %peer_id, "Peer vanished");
                    }
                    TransportEvent::LinkLost => {
                        warn!(transport = transport.name(), "Link lost");
                    }
                    TransportEvent::LinkRestored => {
                        info!(transport = transport.name(), "Link restored");
                    }
                }
            }
        }
    }
}

async fn pump_acks(
    node: Arc<MeshNode>,
    mut ack_rx: mpsc::UnboundedReceiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            ack = ack_rx.recv() => {
                let Some(ack) = ack else { break };
                if let Err(err) = node.submit_message(ack) {
                    warn!(error = %err, "Confirmation enqueue failed");
                }
            }
        }
    }
}

async fn run_scheduler_loop(
    scheduler: Arc<DeliveryScheduler>,
    tick_interval_ms: u64,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms.max(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if let Err(err) = scheduler.tick().await {
                    warn!(error = %err, "Scheduler tick failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberlink_core::{CoreError, ManualClock};

    fn test_config() -> Config {
        let mut config = Config::default_config();
        config.node.node_id = "alice".to_string();
        // Long intervals so background loops stay out of manual ticks
        config.scheduler.tick_interval_ms = 3_600_000;
        config
    }

    #[tokio::test]
    async fn test_submit_persists_queued() {
        let node = MeshNode::spawn(
            &test_config(),
            MessageStore::open(":memory:").unwrap(),
            Vec::new(),
            Arc::new(ManualClock::new(1_000)),
        );

        let id = node
            .submit(Classification::Text, "bob", b"hello".to_vec(), 60_000)
            .unwrap();

        let status = node.status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.health, NetworkHealth::Offline);

        let stored = node.store().lock().unwrap().get(&id).unwrap().unwrap();
        assert_eq!(stored.sender, "alice");
        node.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_submit_yields_same_record() {
        let node = MeshNode::spawn(
            &test_config(),
            MessageStore::open(":memory:").unwrap(),
            Vec::new(),
            Arc::new(ManualClock::new(1_000)),
        );

        let message = Message::new(
            Classification::Text,
            "alice",
            "bob",
            b"retry".to_vec(),
            60_000,
            5,
            1_000,
        );

        let first = node.submit_message(message.clone()).unwrap();
        let second = node.submit_message(message).unwrap();

        assert_eq!(first, second);
        assert_eq!(node.status().unwrap().pending_count, 1);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_expired_submission_never_attempted_late() {
        let clock = Arc::new(ManualClock::new(1_000));
        let node = MeshNode::spawn(
            &test_config(),
            MessageStore::open(":memory:").unwrap(),
            Vec::new(),
            clock.clone(),
        );

        let id = node
            .submit(Classification::Text, "bob", b"hello".to_vec(), 60_000)
            .unwrap();

        clock.advance(61_000);
        let summary = node.tick_now().await.unwrap();

        assert_eq!(summary.expired, 1);
        assert_eq!(summary.attempted, 0);
        let stored = node.store().lock().unwrap().get(&id).unwrap().unwrap();
        assert_eq!(stored.state, emberlink_core::DeliveryState::Expired);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_oversize_presence_rejected_without_store_mutation() {
        let hub = emberlink_transport::LinkHub::new();
        let transport: Arc<dyn Transport> = emberlink_transport::ShortRangePeerTransport::spawn(
            "alice",
            "alice",
            hub,
            64,
            3_600_000,
            3_600_000,
            Arc::new(ManualClock::new(0)),
        );
        let node = MeshNode::spawn(
            &test_config(),
            MessageStore::open(":memory:").unwrap(),
            vec![transport],
            Arc::new(ManualClock::new(1_000)),
        );

        let result = node.submit(
            Classification::Presence,
            emberlink_core::BROADCAST,
            vec![0u8; 500],
            60_000,
        );

        assert!(matches!(result, Err(CoreError::PayloadTooLarge { .. })));
        assert_eq!(node.status().unwrap().pending_count, 0);
        node.shutdown();
    }
}
