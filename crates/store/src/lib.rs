//! Emberlink Store - Durable message persistence and dedup.
//!
//! # Core Components
//!
//! - **MessageStore**: SQLite-backed record of every message and its
//!   delivery state; the retry queue survives process restarts
//! - **DedupCache**: bounded recently-seen-id set preventing relay loops
//!   and duplicate local delivery

#![warn(missing_docs)]

pub mod dedup;
pub mod store;

pub use dedup::DedupCache;
pub use store::{MessageStore, SyncOperation, SyncQueueItem};
