//! Emberlink Mesh - Store-and-forward delivery core.
//!
//! Implements delay-tolerant message delivery over heterogeneous,
//! intermittently connected transports.
//!
//! # Core Components
//!
//! - **RelayEngine**: inbound frame processing, dedup, local delivery,
//!   hop-limited mesh flood
//! - **DeliveryScheduler**: retry loop with escalating backoff and a
//!   bounded attempt concurrency
//! - **NetworkOrchestrator**: class-based transport selection and health
//! - **SubscriptionRegistry**: typed local delivery fan-out with
//!   cancellable handles
//! - **MeshNode**: composition root owning all of the above
//!
//! # Design Principles
//!
//! 1. **At-least-once, deduplicated**: duplicates are cheap, loss is not
//! 2. **Disconnection is the default state**: every message is durably
//!    queued before any delivery is attempted
//! 3. **No failure escalates**: transport and remote errors are retried or
//!    dropped, never allowed to crash the host process

pub mod node;
pub mod orchestrator;
pub mod relay;
pub mod scheduler;
pub mod subscriptions;

pub use node::{MeshNode, NodeStatus};
pub use orchestrator::NetworkOrchestrator;
pub use relay::{RelayEngine, RelayOutcome, CLOUD_PEER_ID};
pub use scheduler::{BackoffSchedule, DeliveryScheduler, TickSummary};
pub use subscriptions::{MessageCallback, Subscription, SubscriptionRegistry};
