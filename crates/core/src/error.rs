//! Error types for Emberlink operations.
//!
//! Transport and remote-store failures are recoverable and retried locally;
//! only terminal message outcomes surface to producers. Nothing in this
//! taxonomy is allowed to crash the host process.

use thiserror::Error;

/// Errors that can occur in the delivery core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transport link is down; recoverable, auto-retried
    #[error("Transport unavailable: {transport}")]
    TransportUnavailable {
        /// Transport name
        transport: String,
    },

    /// Payload exceeds the chosen transport's frame budget; rejected, not retried
    #[error("Payload too large: {size} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Actual payload size in bytes
        size: usize,
        /// Maximum the transport accepts
        max: usize,
    },

    /// Malformed inbound frame; dropped and logged, never fatal
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Retry budget exhausted; terminal
    #[error("Delivery exhausted for {message_id} after {attempts} attempts")]
    DeliveryExhausted {
        /// Message identifier
        message_id: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// TTL lapsed before delivery; terminal
    #[error("Message expired: {message_id}")]
    Expired {
        /// Message identifier
        message_id: String,
    },

    /// Gateway remote store I/O failed; retried with backoff
    #[error("Remote store error: {0}")]
    RemoteStore(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Illegal lifecycle transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for delivery-core operations.
pub type CoreResult<T> = Result<T, CoreError>;
