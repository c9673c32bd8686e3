/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};

use dgi_broker::config::BrokerConfig;
use dgi_broker::node::BrokerNode;

// ── CLI argument definition ───────────────────────────────────────────────────

/// DGI broker daemon.
///
/// Example:
///   dgi-broker -c broker.yaml -u alpha -l 0.0.0.0:1870
#[derive(Debug, Parser)]
#[command(
    name = "dgi-broker",
    about = "DGI broker – phase scheduler, reliable peer delivery and clock synchronization",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML broker configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Overrides node.uuid from the configuration file.
    #[arg(short = 'u', long = "uuid")]
    uuid: Option<String>,

    /// Overrides node.listen from the configuration file.
    #[arg(short = 'l', long = "listen")]
    listen: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log-level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!("DGI broker starting up...");
    info!(config = %cli.config.display(), uuid = ?cli.uuid, listen = ?cli.listen, "Command line");

    // ── Load configuration ────────────────────────────────────────────────────
    let mut config = match BrokerConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load broker configuration: {:#}", e);
            process::exit(1);
        }
    };
    if let Some(uuid) = cli.uuid {
        config.uuid = uuid;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    // ── Run until interrupted ─────────────────────────────────────────────────
    let node = match BrokerNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start broker: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
    }
    node.shutdown().await;
}
