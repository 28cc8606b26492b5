//! Configuration management for Emberlink.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub relay: RelayConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local identity; messages addressed here are delivered to subscribers
    pub node_id: String,
    /// Name advertised to peers during discovery
    pub display_name: String,
    /// Path to the message database
    pub data_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Initial hop limit stamped on locally submitted broadcasts
    pub default_hop_limit: u8,
    /// Dedup cache capacity (recently-seen message ids)
    pub dedup_capacity: usize,
    /// Terminal records retained for inspection before pruning
    pub history_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Attempts before a message is marked failed
    pub max_retries: u32,
    /// Scheduler tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Deadline for a single transport send attempt
    pub attempt_timeout_ms: u64,
    /// Concurrent in-flight attempts per tick
    pub max_concurrent_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Frame budget for the short-range peer mesh
    pub short_range_max_payload: usize,
    /// Frame budget for the long-range radio layer
    pub long_range_max_payload: usize,
    /// Peer eviction quiet period in milliseconds
    pub peer_quiet_period_ms: u64,
    /// Presence heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Remote store base URL; empty disables gatewaying
    pub base_url: String,
    /// Inbox poll interval in milliseconds while in gateway role
    pub poll_interval_ms: u64,
    /// Remote request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.node.node_id.is_empty() {
            return Err(CoreError::Config("node_id must not be empty".to_string()));
        }
        if self.relay.dedup_capacity == 0 {
            return Err(CoreError::Config("dedup_capacity must be positive".to_string()));
        }
        if self.scheduler.max_concurrent_attempts == 0 {
            return Err(CoreError::Config(
                "max_concurrent_attempts must be positive".to_string(),
            ));
        }
        if self.transport.long_range_max_payload > self.transport.short_range_max_payload {
            return Err(CoreError::Config(
                "long-range payload budget cannot exceed short-range budget".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            node: NodeConfig {
                node_id: "node-001".to_string(),
                display_name: "emberlink".to_string(),
                data_path: "emberlink.db".to_string(),
            },
            relay: RelayConfig {
                default_hop_limit: 5,
                dedup_capacity: 1_000,
                history_cap: 500,
            },
            scheduler: SchedulerConfig {
                max_retries: 10,
                tick_interval_ms: 5_000,
                attempt_timeout_ms: 10_000,
                max_concurrent_attempts: 4,
            },
            transport: TransportConfig {
                short_range_max_payload: 8 * 1024,
                long_range_max_payload: 200,
                peer_quiet_period_ms: 120_000,
                heartbeat_interval_ms: 15_000,
            },
            gateway: GatewayConfig {
                base_url: String::new(),
                poll_interval_ms: 30_000,
                request_timeout_ms: 15_000,
            },
        }
    }
}
