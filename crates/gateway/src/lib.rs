//! Emberlink Gateway - Opportunistic internet bridging.
//!
//! When a device gains internet it is promoted to a gateway node: it
//! uploads the mesh's pending messages to a remote blob store and pulls
//! items addressed to the local mesh back down, injecting them into the
//! relay engine on behalf of peers that are offline.

pub mod bridge;
pub mod remote;

pub use bridge::{BridgeRole, CycleSummary, GatewayBridge};
pub use remote::{
    CredentialProvider, HttpRemoteStore, MemoryRemoteStore, RemoteStore, StaticCredentials,
};
