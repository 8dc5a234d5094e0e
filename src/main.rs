//! wemulator: a WeMo switch emulator for Amazon Echo voice control
//!
//! Emulates up to 16 Belkin WeMo switches on the local network so the
//! Echo can discover and toggle them without any real WeMo hardware.
//! Each discovered "turn on/off" command is translated into a call on a
//! configured action handler driving an output pin.
//!
//! Features:
//! - SSDP discovery responder (the Echo's `urn:Belkin:device:**` search)
//! - Per-device setup.xml and SetBinaryState emulation
//! - Single-threaded non-blocking event loop (mio, or poll(2) fallback)
//! - Configuration via CLI arguments and a TOML device list

mod actions;
mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        ip = %config.ip,
        backend = ?config.backend,
        devices = config.devices.len(),
        discovery = config.discovery_enabled,
        "Starting wemulator"
    );

    runtime::run(config)?;
    Ok(())
}
