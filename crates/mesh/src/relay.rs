//! Relay engine: the inbound half of the mesh.
//!
//! Every frame any transport produces lands here. The engine decodes,
//! dedups against the bounded cache and the durable store, delivers to
//! local subscribers, and re-floods hop-limited broadcast traffic on the
//! transport class it arrived on, never back toward the peer it came from.

use crate::subscriptions::SubscriptionRegistry;
use emberlink_core::{
    Classification, Clock, CoreResult, DeliveryState, Message, Peer, TransportClass,
    WIRE_PREFIX_LEN,
};
use emberlink_store::{DedupCache, MessageStore};
use emberlink_transport::{frame, Destination, Transport};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Peer id the gateway bridge uses when injecting pulled messages.
pub const CLOUD_PEER_ID: &str = "cloud";

/// TTL stamped on locally generated delivery confirmations.
const ACK_TTL_MS: u64 = 300_000;

/// Result of processing one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to local subscribers; `relayed` marks an onward flood too
    DeliveredLocal {
        /// Whether the frame was also re-broadcast
        relayed: bool,
    },
    /// Not for us; forwarded into the mesh
    Relayed,
    /// Already processed; dropped without delivery or relay
    Duplicate,
    /// Dropped before processing (decode failure, hop/ttl exhaustion)
    Dropped(String),
}

/// Inbound frame processor shared by every transport pump.
pub struct RelayEngine {
    local_id: String,
    store: Arc<Mutex<MessageStore>>,
    dedup: Arc<Mutex<DedupCache>>,
    subscriptions: SubscriptionRegistry,
    transports: Vec<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    ack_tx: mpsc::UnboundedSender<Message>,
    default_hop_limit: u8,
}

enum FrameSource<'a> {
    Mesh {
        transport: &'a Arc<dyn Transport>,
        origin: &'a Peer,
    },
    Cloud,
}

impl RelayEngine {
    /// Wire up the engine.
    ///
    /// `ack_tx` receives the delivery confirmations this node generates;
    /// the node pumps them back through the normal submit path.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: impl Into<String>,
        store: Arc<Mutex<MessageStore>>,
        dedup: Arc<Mutex<DedupCache>>,
        subscriptions: SubscriptionRegistry,
        transports: Vec<Arc<dyn Transport>>,
        clock: Arc<dyn Clock>,
        ack_tx: mpsc::UnboundedSender<Message>,
        default_hop_limit: u8,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            store,
            dedup,
            subscriptions,
            transports,
            clock,
            ack_tx,
            default_hop_limit,
        }
    }

    /// Process a raw frame received from a transport.
    pub async fn handle_frame(
        &self,
        bytes: &[u8],
        origin: &Peer,
        transport: &Arc<dyn Transport>,
    ) -> RelayOutcome {
        let message = match frame::decode(bytes, transport.class()) {
            Ok(message) => message,
            Err(err) => {
                debug!(
                    transport = transport.name(),
                    origin = %origin.id,
                    error = %err,
                    "Undecodable frame dropped"
                );
                return RelayOutcome::Dropped(format!("decode: {err}"));
            }
        };

        self.process(message, FrameSource::Mesh { transport, origin })
            .await
    }

    /// Inject a message the gateway pulled from the remote store, as if it
    /// had been received from a synthetic cloud peer.
    pub async fn inject_remote(&self, message: Message) -> RelayOutcome {
        self.process(message, FrameSource::Cloud).await
    }

    async fn process(&self, message: Message, source: FrameSource<'_>) -> RelayOutcome {
        let now_ms = self.clock.now_ms();

        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            if dedup.seen(&message.id) {
                // Known id: refresh sighting metadata, nothing else
                if let Err(err) = self.touch_store(&message, now_ms) {
                    warn!(message_id = %message.id, error = %err, "Receipt touch failed");
                }
                return RelayOutcome::Duplicate;
            }
            dedup.mark_seen(message.id);
        }

        let from_cloud = matches!(source, FrameSource::Cloud);
        let first_sighting = {
            let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            match store.record_received(&message, now_ms, from_cloud) {
                Ok(first) => first,
                Err(err) => {
                    warn!(message_id = %message.id, error = %err, "Receipt persist failed");
                    return RelayOutcome::Dropped(format!("store: {err}"));
                }
            }
        };
        if !first_sighting {
            // The durable index already knew this id (cold dedup cache)
            return RelayOutcome::Duplicate;
        }

        let addressed_local = self.is_local(&message.recipient);
        let broadcast = message.is_broadcast();

        if message.classification == Classification::DeliveryConfirmation && addressed_local {
            self.apply_confirmation(&message);
            self.subscriptions.dispatch(&message);
            return RelayOutcome::DeliveredLocal { relayed: false };
        }

        let delivered = if addressed_local || broadcast {
            self.subscriptions.dispatch(&message);
            if addressed_local && !broadcast {
                self.emit_ack(&message, now_ms);
            }
            true
        } else {
            // Foreign unicast we now carry: owed to the remote store too,
            // so a later gateway promotion forwards it for the recipient
            if !from_cloud {
                let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(err) = store.enqueue_upload(&message.id) {
                    warn!(message_id = %message.id, error = %err, "Upload obligation failed");
                }
            }
            false
        };

        // Expired-on-arrival traffic may still be useful locally, but it is
        // never relayed further; unicast addressed to us never re-floods
        let relayable = !message.is_expired(now_ms)
            && message.hop_limit > 0
            && !(addressed_local && !broadcast);

        let relayed = if relayable {
            self.forward(&message, &source).await
        } else {
            false
        };

        match (delivered, relayed) {
            (true, relayed) => RelayOutcome::DeliveredLocal { relayed },
            (false, true) => RelayOutcome::Relayed,
            (false, false) => RelayOutcome::Dropped("hop or ttl exhausted".to_string()),
        }
    }

    async fn forward(&self, message: &Message, source: &FrameSource<'_>) -> bool {
        let mut onward = message.clone();
        onward.hop_limit -= 1;

        match source {
            FrameSource::Mesh { transport, origin } => {
                // Re-broadcast stays on the arriving transport class, but
                // covers every segment of that class this node straddles
                let class = transport.class();
                let mut any = false;
                for candidate in &self.transports {
                    if candidate.class() == class
                        && candidate.is_link_up()
                        && self.flood_on(&onward, candidate, Some(origin.handle.as_str())).await
                    {
                        any = true;
                    }
                }
                any
            }
            FrameSource::Cloud => {
                // Pulled from the remote store: fan into every live layer
                let mut any = false;
                for transport in &self.transports {
                    if transport.is_link_up() && self.flood_on(&onward, transport, None).await {
                        any = true;
                    }
                }
                any
            }
        }
    }

    /// Re-broadcast on one transport to every peer except `skip_handle`.
    async fn flood_on(
        &self,
        message: &Message,
        transport: &Arc<dyn Transport>,
        skip_handle: Option<&str>,
    ) -> bool {
        let bytes = match frame::encode(message, transport.class(), transport.max_payload_size()) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(
                    message_id = %message.id,
                    transport = transport.name(),
                    error = %err,
                    "Relay frame did not fit, skipped"
                );
                return false;
            }
        };

        let mut relayed = false;
        for peer in transport.peers() {
            if Some(peer.handle.as_str()) == skip_handle {
                continue;
            }
            match transport
                .send(Destination::Peer(peer.handle.clone()), bytes.clone())
                .await
            {
                Ok(()) => relayed = true,
                Err(err) => {
                    debug!(
                        message_id = %message.id,
                        peer_id = %peer.id,
                        error = %err,
                        "Relay hop failed"
                    );
                }
            }
        }

        if relayed {
            debug!(
                message_id = %message.id,
                transport = transport.name(),
                hops_left = message.hop_limit,
                "Frame re-broadcast"
            );
        }
        relayed
    }

    /// Resolve and apply an explicit delivery confirmation.
    fn apply_confirmation(&self, ack: &Message) {
        let Ok(prefix) = std::str::from_utf8(&ack.payload) else {
            debug!(message_id = %ack.id, "Confirmation payload not utf-8, ignored");
            return;
        };
        let prefix = prefix.trim();

        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let confirmed = match store.find_by_prefix(prefix) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(confirmed = prefix, "Confirmation for unknown message, ignored");
                return;
            }
            Err(err) => {
                warn!(error = %err, "Confirmation lookup failed");
                return;
            }
        };

        if confirmed.state.is_terminal() {
            return;
        }
        match store.update_state(&confirmed.id, DeliveryState::Delivered) {
            Ok(()) => {
                info!(message_id = %confirmed.id, "Delivery confirmed by recipient");
            }
            Err(err) => {
                warn!(message_id = %confirmed.id, error = %err, "Confirmation apply failed");
            }
        }
    }

    /// Queue an ack back toward the sender of a unicast delivery.
    fn emit_ack(&self, message: &Message, now_ms: u64) {
        if message.sender == self.local_id {
            return;
        }
        let ack = Message::new(
            Classification::DeliveryConfirmation,
            self.local_id.clone(),
            message.sender.clone(),
            message.id.prefix().into_bytes(),
            ACK_TTL_MS,
            self.default_hop_limit,
            now_ms,
        );
        if self.ack_tx.send(ack).is_err() {
            debug!(message_id = %message.id, "Ack channel closed, confirmation dropped");
        }
    }

    fn touch_store(&self, message: &Message, now_ms: u64) -> CoreResult<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.record_received(message, now_ms, false)?;
        Ok(())
    }

    fn is_local(&self, recipient: &str) -> bool {
        recipient == self.local_id
            || (recipient.len() == WIRE_PREFIX_LEN && self.local_id.starts_with(recipient))
    }

    /// Local identity this engine delivers for.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Which transport classes the engine can relay onto.
    pub fn relay_classes(&self) -> Vec<TransportClass> {
        self.transports.iter().map(|t| t.class()).collect()
    }
}
