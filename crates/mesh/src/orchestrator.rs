//! Routing policy across heterogeneous transports.
//!
//! The orchestrator owns no I/O: given a message class it ranks the
//! configured transports, enforces frame budgets, and is the single
//! arbiter of which logical traffic uses which physical radio. No other
//! component issues transport operations for outbound traffic.

use emberlink_core::{Classification, CoreError, CoreResult, Message, NetworkHealth, TransportClass};
use emberlink_transport::{frame, Destination, Transport};
use std::sync::Arc;
use tracing::{debug, warn};

/// Class-based transport selection and health reporting.
pub struct NetworkOrchestrator {
    transports: Vec<Arc<dyn Transport>>,
}

impl NetworkOrchestrator {
    /// Build the routing table over the configured transports.
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        for pair in transports.windows(2) {
            if pair[0].class() == pair[1].class() {
                warn!(
                    class = %pair[0].class(),
                    "Two transports drive the same radio class; only the first is used"
                );
            }
        }
        Self { transports }
    }

    /// Transport classes eligible for a message class, most preferred first.
    ///
    /// Reliability and range win over bandwidth for everything except
    /// presence, which stays on the low-power short-range layer and is
    /// never relayed over radio.
    pub fn preference(classification: Classification) -> &'static [TransportClass] {
        match classification {
            Classification::Presence => &[TransportClass::ShortRange],
            _ => &[TransportClass::LongRange, TransportClass::ShortRange],
        }
    }

    /// Configured transports eligible for `classification`, in preference
    /// order, regardless of current link state.
    pub fn eligible_transports(&self, classification: Classification) -> Vec<Arc<dyn Transport>> {
        let mut out = Vec::new();
        for class in Self::preference(classification) {
            if let Some(transport) = self.transports.iter().find(|t| t.class() == *class) {
                out.push(transport.clone());
            }
        }
        out
    }

    /// First eligible transport with a live link, if any.
    pub fn select_transport(&self, classification: Classification) -> Option<Arc<dyn Transport>> {
        self.eligible_transports(classification)
            .into_iter()
            .find(|t| t.is_link_up())
    }

    /// Whether `message` fits at least one eligible transport's budget.
    ///
    /// Called at submit time so an oversized payload is rejected before it
    /// ever reaches the store. With no eligible transport configured the
    /// message is accepted anyway; delivery is delay-tolerant and a
    /// transport may appear later.
    pub fn check_payload(&self, message: &Message) -> CoreResult<()> {
        let eligible = self.eligible_transports(message.classification);
        if eligible.is_empty() {
            return Ok(());
        }

        let mut last = CoreError::TransportUnavailable {
            transport: "any".to_string(),
        };
        for transport in &eligible {
            match frame::encode(message, transport.class(), transport.max_payload_size()) {
                Ok(_) => return Ok(()),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Route one delivery attempt.
    ///
    /// Walks the eligible transports in preference order, skipping down
    /// links and transports whose budget the frame exceeds. Success means
    /// the frame was handed to exactly one link.
    pub async fn send_message(&self, message: &Message) -> CoreResult<()> {
        let mut last = CoreError::TransportUnavailable {
            transport: "any".to_string(),
        };

        for transport in self.eligible_transports(message.classification) {
            if !transport.is_link_up() {
                last = CoreError::TransportUnavailable {
                    transport: transport.name().to_string(),
                };
                continue;
            }

            let bytes = match frame::encode(message, transport.class(), transport.max_payload_size())
            {
                Ok(bytes) => bytes,
                Err(err @ CoreError::PayloadTooLarge { .. }) => {
                    // A roomier fallback class may still carry it
                    last = err;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let destination = resolve_destination(transport.as_ref(), message);
            match transport.send(destination, bytes).await {
                Ok(()) => {
                    debug!(
                        message_id = %message.id,
                        transport = transport.name(),
                        "Attempt handed to transport"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        message_id = %message.id,
                        transport = transport.name(),
                        error = %err,
                        "Transport send failed"
                    );
                    last = err;
                }
            }
        }

        Err(last)
    }

    /// Current link condition summary for external consumers.
    pub fn network_health(&self) -> NetworkHealth {
        let up = |class: TransportClass| {
            self.transports
                .iter()
                .any(|t| t.class() == class && t.is_link_up())
        };
        match (up(TransportClass::ShortRange), up(TransportClass::LongRange)) {
            (true, true) => NetworkHealth::Excellent,
            (false, true) => NetworkHealth::Good,
            (true, false) => NetworkHealth::Limited,
            (false, false) => NetworkHealth::Offline,
        }
    }

    /// All configured transports.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}

fn resolve_destination(transport: &dyn Transport, message: &Message) -> Destination {
    if message.is_broadcast() {
        return Destination::Broadcast;
    }
    // Unicast goes straight to the recipient when it is in range; otherwise
    // the frame floods and the mesh relays it toward the recipient
    transport
        .peers()
        .into_iter()
        .find(|p| p.id == message.recipient)
        .map(|p| Destination::Peer(p.handle))
        .unwrap_or(Destination::Broadcast)
}
