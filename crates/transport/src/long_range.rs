//! Long-range radio transport.
//!
//! Connects to a single bridging radio device and moves compact frames
//! across the long-range broadcast domain. The frame budget is low hundreds
//! of bytes, so identifiers are truncated before transmission (see the
//! compact codec in [`crate::frame`]). Discovery is passive: there are no
//! presence heartbeats on this layer (power budget), peers are learned from
//! the frames they transmit.

use crate::link::LinkHub;
use crate::peers::{PeerChange, PeerRegistry};
use crate::transport::{Destination, Transport, TransportEvent};
use async_trait::async_trait;
use emberlink_core::{Clock, CoreError, CoreResult, Peer, TransportClass};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const TRANSPORT_NAME: &str = "long-range-radio";

/// Long-range radio transport bound to one bridge device.
pub struct LongRangeRadioTransport {
    node_id: String,
    hub: LinkHub,
    max_payload: usize,
    registry: Arc<Mutex<PeerRegistry>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    stop_tx: watch::Sender<bool>,
}

impl LongRangeRadioTransport {
    /// Bind the bridge radio and start the receive loop.
    pub fn spawn(
        node_id: impl Into<String>,
        bridge_name: impl Into<String>,
        hub: LinkHub,
        max_payload: usize,
        housekeeping_interval_ms: u64,
        quiet_period_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let bridge_name = bridge_name.into();
        let air_rx = hub.attach(&node_id);
        let registry = Arc::new(Mutex::new(PeerRegistry::new(quiet_period_ms)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(
            transport = TRANSPORT_NAME,
            bridge = %bridge_name,
            "Bridge radio bound"
        );

        let transport = Arc::new(Self {
            node_id: node_id.clone(),
            hub: hub.clone(),
            max_payload,
            registry: registry.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            stop_tx,
        });

        tokio::spawn(run_loop(
            node_id,
            hub,
            air_rx,
            registry,
            events_tx,
            stop_rx,
            housekeeping_interval_ms,
            clock,
        ));

        transport
    }
}

#[async_trait]
impl Transport for LongRangeRadioTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn class(&self) -> TransportClass {
        TransportClass::LongRange
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn is_link_up(&self) -> bool {
        self.hub.is_up(&self.node_id)
    }

    fn peers(&self) -> Vec<Peer> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .all()
    }

    async fn send(&self, destination: Destination, bytes: Vec<u8>) -> CoreResult<()> {
        if bytes.len() > self.max_payload {
            return Err(CoreError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_payload,
            });
        }
        if !self.is_link_up() {
            return Err(CoreError::TransportUnavailable {
                transport: TRANSPORT_NAME.to_string(),
            });
        }

        // Radio air is a broadcast medium; a peer target narrows delivery
        // to that device's bridge, anything else floods the channel
        let target = match &destination {
            Destination::Peer(handle) => Some(handle.as_str()),
            Destination::Broadcast => None,
        };

        let delivered = self.hub.transmit(&self.node_id, target, &bytes)?;
        debug!(
            transport = TRANSPORT_NAME,
            bytes = bytes.len(),
            endpoints = delivered,
            "Frame transmitted"
        );
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.hub.detach(&self.node_id);
        info!(transport = TRANSPORT_NAME, "Transport stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    node_id: String,
    hub: LinkHub,
    mut air_rx: mpsc::UnboundedReceiver<crate::link::AirFrame>,
    registry: Arc<Mutex<PeerRegistry>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut stop_rx: watch::Receiver<bool>,
    housekeeping_interval_ms: u64,
    clock: Arc<dyn Clock>,
) {
    let mut housekeeping =
        tokio::time::interval(Duration::from_millis(housekeeping_interval_ms.max(10)));
    let mut link_up = hub.is_up(&node_id);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = housekeeping.tick() => {
                let now_up = hub.is_up(&node_id);
                if now_up != link_up {
                    link_up = now_up;
                    let event = if link_up {
                        TransportEvent::LinkRestored
                    } else {
                        warn!(transport = TRANSPORT_NAME, "Bridge link lost");
                        TransportEvent::LinkLost
                    };
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                if !link_up {
                    continue;
                }

                let now_ms = clock.now_ms();
                let evicted = registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .evict_quiet(now_ms);
                for peer in evicted {
                    let _ = events_tx.send(TransportEvent::PeerVanished { peer_id: peer.id });
                }
            }
            frame = air_rx.recv() => {
                let Some(air) = frame else { break };
                if !link_up {
                    continue;
                }

                let now_ms = clock.now_ms();
                let peer = Peer {
                    id: air.from.clone(),
                    display_name: None,
                    handle: air.from.clone(),
                    transport: TransportClass::LongRange,
                    last_seen_ms: now_ms,
                    link_quality: 0.6,
                };
                let change = registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .upsert(peer.clone());
                let event = match change {
                    PeerChange::Appeared => TransportEvent::PeerAppeared(peer.clone()),
                    PeerChange::Updated => TransportEvent::PeerUpdated(peer.clone()),
                };
                let _ = events_tx.send(event);
                let _ = events_tx.send(TransportEvent::Frame { bytes: air.bytes, origin: peer });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberlink_core::SystemClock;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_radio(hub: &LinkHub, id: &str) -> Arc<LongRangeRadioTransport> {
        LongRangeRadioTransport::spawn(
            id,
            format!("{id}-bridge"),
            hub.clone(),
            200,
            20,
            60_000,
            Arc::new(SystemClock),
        )
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Option<TransportEvent> {
        timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_frame_crosses_radio_air() {
        let hub = LinkHub::new();
        let alice = spawn_radio(&hub, "alice");
        let bob = spawn_radio(&hub, "bob");

        let mut bob_events = bob.take_events().unwrap();
        alice
            .send(Destination::Broadcast, b"EL1|compact".to_vec())
            .await
            .unwrap();

        loop {
            match next_event(&mut bob_events).await {
                Some(TransportEvent::Frame { bytes, origin }) => {
                    assert_eq!(bytes, b"EL1|compact");
                    assert_eq!(origin.id, "alice");
                    break;
                }
                Some(_) => continue,
                None => panic!("frame never crossed the radio"),
            }
        }

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_sender_becomes_known_peer() {
        let hub = LinkHub::new();
        let alice = spawn_radio(&hub, "alice");
        let bob = spawn_radio(&hub, "bob");

        let mut bob_events = bob.take_events().unwrap();
        alice.send(Destination::Broadcast, b"x".to_vec()).await.unwrap();

        loop {
            match next_event(&mut bob_events).await {
                Some(TransportEvent::PeerAppeared(peer)) => {
                    assert_eq!(peer.id, "alice");
                    assert_eq!(peer.transport, TransportClass::LongRange);
                    break;
                }
                Some(_) => continue,
                None => panic!("sender never registered as peer"),
            }
        }
        assert_eq!(bob.peers().len(), 1);

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_budget_enforced_at_send() {
        let hub = LinkHub::new();
        let alice = spawn_radio(&hub, "alice");

        let result = alice.send(Destination::Broadcast, vec![0u8; 500]).await;
        assert!(matches!(
            result,
            Err(CoreError::PayloadTooLarge { size: 500, max: 200 })
        ));

        alice.shutdown();
    }

    #[tokio::test]
    async fn test_down_bridge_rejects_sends() {
        let hub = LinkHub::new();
        let alice = spawn_radio(&hub, "alice");

        hub.set_link("alice", false);
        let result = alice.send(Destination::Broadcast, b"x".to_vec()).await;
        assert!(matches!(result, Err(CoreError::TransportUnavailable { .. })));

        alice.shutdown();
    }
}
