//! Core message and peer types for the Emberlink delivery core.
//!
//! Messages are the unit of store-and-forward delivery: every payload a
//! producer submits becomes exactly one `Message` record, identified by a
//! 128-bit id that doubles as the deduplication key across transports and
//! relay hops.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recipient id denoting flood-to-all delivery.
pub const BROADCAST: &str = "broadcast";

/// Number of hex characters kept when an identifier is truncated for the
/// long-range wire format.
pub const WIRE_PREFIX_LEN: usize = 8;

/// Globally unique 128-bit message identifier.
///
/// Assigned once at creation and immutable thereafter. The sole dedup key
/// across every transport and across relay hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Full 32-character lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Truncated prefix used on the long-range wire.
    pub fn prefix(&self) -> String {
        self.to_hex()[..WIRE_PREFIX_LEN].to_string()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for MessageId {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| crate::error::CoreError::DecodeFailure(format!("bad message id: {s}")))?;
        let arr: [u8; 16] = bytes.try_into().map_err(|_| {
            crate::error::CoreError::DecodeFailure(format!("message id must be 16 bytes: {s}"))
        })?;
        Ok(Self(arr))
    }
}

/// Message classification; drives routing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Free-form text between users
    Text,
    /// Position report
    Location,
    /// Emergency traffic, highest delivery priority
    Emergency,
    /// One-to-all announcement
    Announcement,
    /// Presence heartbeat, short-range only, never relayed over radio
    Presence,
    /// Acknowledgement for a previously sent message
    DeliveryConfirmation,
}

impl Classification {
    /// Single-character code used on the compact wire format.
    pub fn wire_code(&self) -> char {
        match self {
            Classification::Text => 'T',
            Classification::Location => 'L',
            Classification::Emergency => 'E',
            Classification::Announcement => 'A',
            Classification::Presence => 'P',
            Classification::DeliveryConfirmation => 'C',
        }
    }

    /// Parse a wire code back into a classification.
    pub fn from_wire_code(code: char) -> Option<Self> {
        match code {
            'T' => Some(Classification::Text),
            'L' => Some(Classification::Location),
            'E' => Some(Classification::Emergency),
            'A' => Some(Classification::Announcement),
            'P' => Some(Classification::Presence),
            'C' => Some(Classification::DeliveryConfirmation),
            _ => None,
        }
    }
}

/// Delivery lifecycle state of a message record.
///
/// Transitions are strictly monotonic: once a record reaches a terminal
/// state it never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Awaiting the next scheduler attempt
    Queued,
    /// A send attempt is in flight on at least one transport
    Sending,
    /// Acknowledged (explicit ack, or hand-off heuristic for broadcast)
    Delivered,
    /// TTL elapsed before delivery; terminal
    Expired,
    /// Retry budget exhausted; terminal
    Failed,
    /// Foreign message accepted from a transport; terminal receipt
    Received,
}

impl DeliveryState {
    /// Whether the state is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Expired
                | DeliveryState::Failed
                | DeliveryState::Received
        )
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            DeliveryState::Queued => matches!(
                next,
                DeliveryState::Sending
                    | DeliveryState::Delivered
                    | DeliveryState::Expired
                    | DeliveryState::Failed
            ),
            DeliveryState::Sending => matches!(
                next,
                DeliveryState::Queued
                    | DeliveryState::Delivered
                    | DeliveryState::Expired
                    | DeliveryState::Failed
            ),
            _ => false,
        }
    }

    /// Stable text form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Queued => "queued",
            DeliveryState::Sending => "sending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Expired => "expired",
            DeliveryState::Failed => "failed",
            DeliveryState::Received => "received",
        }
    }

    /// Parse the database text form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DeliveryState::Queued),
            "sending" => Some(DeliveryState::Sending),
            "delivered" => Some(DeliveryState::Delivered),
            "expired" => Some(DeliveryState::Expired),
            "failed" => Some(DeliveryState::Failed),
            "received" => Some(DeliveryState::Received),
            _ => None,
        }
    }
}

/// Optional position attached to location-bearing messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
}

/// A single store-and-forward message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, the dedup key
    pub id: MessageId,
    /// Classification driving routing and retry policy
    pub classification: Classification,
    /// Opaque sender identifier
    pub sender: String,
    /// Opaque recipient identifier; [`BROADCAST`] floods to all
    pub recipient: String,
    /// Opaque payload, already encrypted/serialized by the producer
    pub payload: Vec<u8>,
    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at_ms: u64,
    /// Time to live in milliseconds from `created_at_ms`
    pub ttl_ms: u64,
    /// Remaining relay hops; dropped from the flood at zero
    pub hop_limit: u8,
    /// Current lifecycle state
    pub state: DeliveryState,
    /// Number of delivery attempts made so far
    pub attempt_count: u32,
    /// Timestamp of the most recent attempt, if any
    pub last_attempt_at_ms: Option<u64>,
    /// Optional position for location-bearing traffic
    pub position: Option<GeoPosition>,
}

impl Message {
    /// Create a new outbound message in the `Queued` state.
    pub fn new(
        classification: Classification,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Vec<u8>,
        ttl_ms: u64,
        hop_limit: u8,
        now_ms: u64,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            classification,
            sender: sender.into(),
            recipient: recipient.into(),
            payload,
            created_at_ms: now_ms,
            ttl_ms,
            hop_limit,
            state: DeliveryState::Queued,
            attempt_count: 0,
            last_attempt_at_ms: None,
            position: None,
        }
    }

    /// Absolute expiry deadline.
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms.saturating_add(self.ttl_ms)
    }

    /// Whether the TTL has lapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }

    /// Whether this message floods to all peers.
    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }
}

/// Physical layer class a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportClass {
    /// Short-range peer mesh (kilobyte frames, symmetric advertise+scan)
    ShortRange,
    /// Long-range radio (compact frames through a single bridge device)
    LongRange,
}

impl fmt::Display for TransportClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportClass::ShortRange => f.write_str("short-range"),
            TransportClass::LongRange => f.write_str("long-range"),
        }
    }
}

/// A directly reachable peer on some transport.
///
/// Created on discovery, refreshed on every received frame or heartbeat,
/// evicted after a quiet period. Never persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Opaque peer identifier
    pub id: String,
    /// Human-readable name, if the peer advertised one
    pub display_name: Option<String>,
    /// Transport-specific address handle, opaque to the relay
    pub handle: String,
    /// Transport class this peer was sighted on
    pub transport: TransportClass,
    /// Last sighting timestamp (Unix epoch milliseconds)
    pub last_seen_ms: u64,
    /// Link quality estimate (0.0 to 1.0)
    pub link_quality: f64,
}

/// Read-only network condition summary for external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkHealth {
    /// Every transport link is up
    Excellent,
    /// Long-range link up, short-range down
    Good,
    /// Only the short-range link is up
    Limited,
    /// No transport has an active link
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_roundtrip() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.prefix().len(), WIRE_PREFIX_LEN);
        assert!(id.to_hex().starts_with(&id.prefix()));
    }

    #[test]
    fn test_message_id_rejects_garbage() {
        assert!("not-hex".parse::<MessageId>().is_err());
        assert!("abcd".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_wire_codes_roundtrip() {
        let all = [
            Classification::Text,
            Classification::Location,
            Classification::Emergency,
            Classification::Announcement,
            Classification::Presence,
            Classification::DeliveryConfirmation,
        ];
        for class in all {
            assert_eq!(Classification::from_wire_code(class.wire_code()), Some(class));
        }
        assert_eq!(Classification::from_wire_code('X'), None);
    }

    #[test]
    fn test_state_machine_monotonic() {
        assert!(DeliveryState::Queued.can_transition_to(DeliveryState::Sending));
        assert!(DeliveryState::Sending.can_transition_to(DeliveryState::Queued));
        assert!(DeliveryState::Sending.can_transition_to(DeliveryState::Delivered));
        assert!(DeliveryState::Queued.can_transition_to(DeliveryState::Expired));

        // No way back out of a terminal state
        assert!(!DeliveryState::Delivered.can_transition_to(DeliveryState::Queued));
        assert!(!DeliveryState::Failed.can_transition_to(DeliveryState::Sending));
        assert!(!DeliveryState::Expired.can_transition_to(DeliveryState::Queued));
        assert!(!DeliveryState::Received.can_transition_to(DeliveryState::Queued));
    }

    #[test]
    fn test_expiry_math() {
        let msg = Message::new(
            Classification::Text,
            "alice",
            "bob",
            b"hi".to_vec(),
            60_000,
            3,
            1_000,
        );
        assert_eq!(msg.expires_at_ms(), 61_000);
        assert!(!msg.is_expired(60_999));
        assert!(msg.is_expired(61_000));
    }

    #[test]
    fn test_broadcast_detection() {
        let msg = Message::new(
            Classification::Announcement,
            "alice",
            BROADCAST,
            vec![],
            1_000,
            3,
            0,
        );
        assert!(msg.is_broadcast());
    }
}
