//! # scanbridge
//!
//! Daemon that drives serial BLE observer modules and reports nearby
//! device manufacturers to a monitoring host.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package scanbridge-server -- --config config.toml
//!
//! # Production
//! SCANBRIDGE_CONFIG=/etc/scanbridge/config.toml ./scanbridge
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use clap::Parser;
use scanbridge_core::{Bridge, SerialConnector};
use scanbridge_server::cli::Cli;
use scanbridge_server::logging;
use scanbridge_server::transport::create_transport;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.write_default_config {
        let path = cli.write_default_config_file()?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }
    let config = cli.load_config()?;

    logging::init(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        devices = config.enabled_devices().count(),
        "Starting scanbridge"
    );

    let transport = create_transport(&config.transport);
    let bridge = match Bridge::start(&config, transport, Arc::new(SerialConnector::new())).await {
        Ok(bridge) => bridge,
        Err(e) if e.is_config_error() => {
            error!(
                error = %e,
                code = e.error_code(),
                suggestion = e.suggestion().unwrap_or_default(),
                "Configuration rejected"
            );
            return Err(e.into());
        }
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Bridge failed to start");
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    bridge.shutdown().await;

    Ok(())
}
