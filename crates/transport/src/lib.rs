//! Emberlink Transport - Physical link abstraction and implementations.
//!
//! # Core Components
//!
//! - **Transport**: capability interface every link layer implements
//! - **ShortRangePeerTransport**: symmetric advertise+scan peer mesh
//! - **LongRangeRadioTransport**: compact frames through a bridge radio
//! - **Frame codecs**: JSON envelope (short range) and compact fixed-order
//!   frame with truncated identifiers (long range)
//! - **LinkHub**: injected link driver seam standing in for the platform
//!   radio stacks

pub mod frame;
pub mod link;
pub mod long_range;
pub mod peers;
pub mod short_range;
pub mod transport;

pub use link::{AirFrame, LinkHub};
pub use long_range::LongRangeRadioTransport;
pub use peers::{PeerChange, PeerRegistry};
pub use short_range::ShortRangePeerTransport;
pub use transport::{Destination, Transport, TransportEvent};
