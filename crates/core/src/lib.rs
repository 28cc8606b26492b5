//! Core types and utilities for the Emberlink delivery core.
//!
//! This crate provides the fundamental message model, error taxonomy,
//! configuration, clock abstraction, and logging used across the
//! Emberlink workspace.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, GatewayConfig, NodeConfig, RelayConfig, SchedulerConfig, TransportConfig,
};
pub use error::{CoreError, CoreResult};
pub use types::{
    Classification, DeliveryState, GeoPosition, Message, MessageId, NetworkHealth, Peer,
    TransportClass, BROADCAST, WIRE_PREFIX_LEN,
};
