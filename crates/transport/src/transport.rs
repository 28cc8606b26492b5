//! Transport capability interface.
//!
//! A transport abstracts one physical link: it discovers peers, moves raw
//! frames to a peer or to everyone in range, and reports link health.
//! Consumers hold `Arc<dyn Transport>` values and never see concrete types;
//! routing policy lives entirely in the orchestrator.

use async_trait::async_trait;
use emberlink_core::{CoreResult, Peer, TransportClass};
use tokio::sync::mpsc;

/// Where an outbound frame should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A single peer, addressed by its transport handle
    Peer(String),
    /// Every peer currently in range
    Broadcast,
}

/// Events a transport surfaces to the relay pump.
///
/// A transport that loses its underlying link emits `LinkLost` and stays
/// silent until `LinkRestored`; it never panics the consumer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A previously unknown peer came into range
    PeerAppeared(Peer),
    /// A known peer was sighted again
    PeerUpdated(Peer),
    /// A peer fell quiet past the eviction window
    PeerVanished {
        /// Identifier of the evicted peer
        peer_id: String,
    },
    /// An inbound frame arrived
    Frame {
        /// Raw frame bytes, still encoded for this transport's wire format
        bytes: Vec<u8>,
        /// Peer the frame came from
        origin: Peer,
    },
    /// The underlying link went down
    LinkLost,
    /// The underlying link came back
    LinkRestored,
}

/// One physical link layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short human-readable transport name for logs.
    fn name(&self) -> &str;

    /// Which physical layer class this transport drives.
    fn class(&self) -> TransportClass;

    /// Largest frame this transport will accept.
    fn max_payload_size(&self) -> usize;

    /// Whether the underlying link is currently usable.
    fn is_link_up(&self) -> bool;

    /// Snapshot of peers currently in range.
    fn peers(&self) -> Vec<Peer>;

    /// Hand `bytes` to the underlying link.
    ///
    /// Success means the frame left this device, not that anyone received
    /// it; end-to-end acknowledgement arrives as a separate inbound
    /// delivery-confirmation message.
    async fn send(&self, destination: Destination, bytes: Vec<u8>) -> CoreResult<()>;

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Stop discovery and receive loops and release the link.
    fn shutdown(&self);
}
