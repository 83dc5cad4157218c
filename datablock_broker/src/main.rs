//! # DataBlock Broker Binary
//!
//! Runs the channel discovery service (§6.3) until interrupted.
//!
//! # Usage
//!
//! ```bash
//! datablock_broker --config /etc/datablock/broker.toml
//! datablock_broker --socket /tmp/datablock_broker.sock -v
//! ```

#![deny(warnings)]

use clap::Parser;
use datablock_broker::config::BrokerConfig;
use datablock_broker::server::Broker;
use datablock_common::config::{init_tracing, init_tracing_json, ConfigLoader, LogLevel};
use std::path::PathBuf;
use tracing::{error, info};

/// DataBlock channel discovery broker.
#[derive(Parser, Debug)]
#[command(name = "datablock_broker")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Out-of-band discovery service for DataBlock channels")]
struct Args {
    /// Path to a broker configuration TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Unix domain socket path from the config file.
    #[arg(short, long)]
    socket: Option<String>,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match BrokerConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => BrokerConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let level = if args.verbose { LogLevel::Debug } else { config.shared.log_level };
    if args.json {
        init_tracing_json(level);
    } else {
        init_tracing(level);
    }

    info!(socket = %config.socket_path, "datablock_broker starting");

    let (broker, listener) = match Broker::bind(&config.socket_path) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to bind broker socket");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    broker.serve(listener, shutdown).await;

    info!("datablock_broker shutdown complete");
}
