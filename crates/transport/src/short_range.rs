//! Short-range peer mesh transport.
//!
//! Symmetric dual role: every device advertises its presence on a heartbeat
//! and scans by listening for other devices' announcements, simultaneously.
//! A recognized peer is auto-connected (sighting it is enough to make it a
//! send target) and all directly connected peers form a full relay mesh.
//! Frames are roomy (kilobytes) compared to the long-range layer.

use crate::link::LinkHub;
use crate::peers::{PeerChange, PeerRegistry};
use crate::transport::{Destination, Transport, TransportEvent};
use async_trait::async_trait;
use base64::Engine;
use emberlink_core::{Clock, CoreError, CoreResult, Peer, TransportClass};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const TRANSPORT_NAME: &str = "short-range-peer";

/// Envelope carried on the short-range air space.
#[derive(Debug, Serialize, Deserialize)]
enum ShortRangeEnvelope {
    /// Presence advertisement, emitted on every heartbeat
    Announce {
        node_id: String,
        display_name: String,
    },
    /// Application frame, base64 so the envelope stays printable
    Data { frame: String },
}

/// Short-range peer mesh transport over an injected link driver.
pub struct ShortRangePeerTransport {
    node_id: String,
    hub: LinkHub,
    max_payload: usize,
    registry: Arc<Mutex<PeerRegistry>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    stop_tx: watch::Sender<bool>,
}

impl ShortRangePeerTransport {
    /// Attach to the air space and start the advertise+scan loop.
    pub fn spawn(
        node_id: impl Into<String>,
        display_name: impl Into<String>,
        hub: LinkHub,
        max_payload: usize,
        heartbeat_interval_ms: u64,
        quiet_period_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let display_name = display_name.into();
        let air_rx = hub.attach(&node_id);
        let registry = Arc::new(Mutex::new(PeerRegistry::new(quiet_period_ms)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

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
            display_name,
            hub,
            air_rx,
            registry,
            events_tx,
            stop_rx,
            heartbeat_interval_ms,
            clock,
        ));

        transport
    }
}

#[async_trait]
impl Transport for ShortRangePeerTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn class(&self) -> TransportClass {
        TransportClass::ShortRange
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

        let envelope = ShortRangeEnvelope::Data {
            frame: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let encoded = serde_json::to_vec(&envelope)?;
        let target = match &destination {
            Destination::Peer(handle) => Some(handle.as_str()),
            Destination::Broadcast => None,
        };

        let delivered = self.hub.transmit(&self.node_id, target, &encoded)?;
        debug!(
            transport = TRANSPORT_NAME,
            endpoints = delivered,
            "Frame handed to link"
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
    display_name: String,
    hub: LinkHub,
    mut air_rx: mpsc::UnboundedReceiver<crate::link::AirFrame>,
    registry: Arc<Mutex<PeerRegistry>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut stop_rx: watch::Receiver<bool>,
    heartbeat_interval_ms: u64,
    clock: Arc<dyn Clock>,
) {
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms.max(10)));
    let mut link_up = hub.is_up(&node_id);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let now_up = hub.is_up(&node_id);
                if now_up != link_up {
                    link_up = now_up;
                    let event = if link_up {
                        TransportEvent::LinkRestored
                    } else {
                        warn!(transport = TRANSPORT_NAME, "Link lost");
                        TransportEvent::LinkLost
                    };
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                if !link_up {
                    continue;
                }

                let announce = ShortRangeEnvelope::Announce {
                    node_id: node_id.clone(),
                    display_name: display_name.clone(),
                };
                if let Ok(bytes) = serde_json::to_vec(&announce) {
                    if let Err(err) = hub.transmit(&node_id, None, &bytes) {
                        debug!(transport = TRANSPORT_NAME, error = %err, "Announce failed");
                    }
                }

                let now_ms = clock.now_ms();
                let evicted = registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .evict_quiet(now_ms);
                for peer in evicted {
                    debug!(transport = TRANSPORT_NAME, peer_id = %peer.id, "Peer fell quiet");
                    let _ = events_tx.send(TransportEvent::PeerVanished { peer_id: peer.id });
                }
            }
            frame = air_rx.recv() => {
                let Some(air) = frame else { break };
                // A downed radio produces no discovery or receive events
                if !link_up {
                    continue;
                }
                handle_air_frame(air, &registry, &events_tx, clock.as_ref());
            }
        }
    }
}

fn handle_air_frame(
    air: crate::link::AirFrame,
    registry: &Arc<Mutex<PeerRegistry>>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    clock: &dyn Clock,
) {
    let envelope: ShortRangeEnvelope = match serde_json::from_slice(&air.bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(transport = TRANSPORT_NAME, error = %err, "Undecodable envelope dropped");
            return;
        }
    };
    let now_ms = clock.now_ms();

    match envelope {
        ShortRangeEnvelope::Announce {
            node_id,
            display_name,
        } => {
            let peer = Peer {
                id: node_id,
                display_name: Some(display_name),
                handle: air.from,
                transport: TransportClass::ShortRange,
                last_seen_ms: now_ms,
                link_quality: 1.0,
            };
            let change = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .upsert(peer.clone());
            let event = match change {
                PeerChange::Appeared => TransportEvent::PeerAppeared(peer),
                PeerChange::Updated => TransportEvent::PeerUpdated(peer),
            };
            let _ = events_tx.send(event);
        }
        ShortRangeEnvelope::Data { frame } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(frame.as_bytes()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(transport = TRANSPORT_NAME, error = %err, "Bad data envelope dropped");
                    return;
                }
            };

            let origin = {
                let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                registry.touch(&air.from, now_ms);
                registry.get(&air.from).cloned()
            }
            .unwrap_or_else(|| Peer {
                id: air.from.clone(),
                display_name: None,
                handle: air.from.clone(),
                transport: TransportClass::ShortRange,
                last_seen_ms: now_ms,
                link_quality: 1.0,
            });

            let _ = events_tx.send(TransportEvent::Frame { bytes, origin });
        }
    }
}
