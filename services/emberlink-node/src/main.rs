//! Emberlink node daemon.
//!
//! Runs the delivery core as a standalone process: loads the toml config,
//! brings up both transports, starts the mesh node and (when configured)
//! the gateway bridge, then waits for ctrl-c.

use anyhow::Context;
use emberlink_core::{logging, Clock, Config, SystemClock};
use emberlink_gateway::{GatewayBridge, HttpRemoteStore, StaticCredentials};
use emberlink_mesh::MeshNode;
use emberlink_store::MessageStore;
use emberlink_transport::{LinkHub, LongRangeRadioTransport, ShortRangePeerTransport, Transport};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    logging::init();

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // The platform radio stacks attach to these hubs; each hub is one
    // shared air space
    let short_hub = LinkHub::new();
    let long_hub = LinkHub::new();

    let short_range: Arc<dyn Transport> = ShortRangePeerTransport::spawn(
        config.node.node_id.clone(),
        config.node.display_name.clone(),
        short_hub,
        config.transport.short_range_max_payload,
        config.transport.heartbeat_interval_ms,
        config.transport.peer_quiet_period_ms,
        clock.clone(),
    );
    let long_range: Arc<dyn Transport> = LongRangeRadioTransport::spawn(
        config.node.node_id.clone(),
        "bridge-radio",
        long_hub,
        config.transport.long_range_max_payload,
        config.transport.heartbeat_interval_ms,
        config.transport.peer_quiet_period_ms,
        clock.clone(),
    );

    let store = MessageStore::open(&config.node.data_path)
        .with_context(|| format!("opening message store at {}", config.node.data_path))?;

    let node = MeshNode::spawn(
        &config,
        store,
        vec![short_range, long_range],
        clock.clone(),
    );

    let bridge = if config.gateway.base_url.is_empty() {
        None
    } else {
        let token = std::env::var("EMBERLINK_TOKEN").unwrap_or_default();
        let remote = Arc::new(HttpRemoteStore::new(
            config.gateway.base_url.clone(),
            config.gateway.request_timeout_ms,
            Arc::new(StaticCredentials::new(token)),
        )?);
        let bridge = GatewayBridge::spawn(
            config.node.node_id.clone(),
            node.store(),
            node.relay(),
            remote,
            clock,
            config.gateway.poll_interval_ms,
        );
        // Connectivity monitoring is the platform's job; a configured
        // remote means this process should bridge whenever it can
        bridge.set_online(true);
        Some(bridge)
    };

    tracing::info!(
        node_id = %config.node.node_id,
        gateway = bridge.is_some(),
        "Emberlink node running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    if let Some(bridge) = bridge {
        bridge.shutdown();
    }
    node.shutdown();

    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            anyhow::bail!("--config was provided without a path");
        }
    }

    anyhow::bail!("missing required --config <path> argument");
}
