//! Configuration module for the wemulator daemon.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The device
//! list itself only lives in the file; the runtime never parses
//! configuration.

use crate::actions::HandlerSpec;
use clap::Parser;
use serde::Deserialize;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use tracing::warn;

/// The Echo stops honoring devices past its hard-coded switch limit.
pub const MAX_DEVICES: usize = 16;

/// Command-line arguments for the emulator
#[derive(Parser, Debug)]
#[command(name = "wemulator")]
#[command(version = "0.1.0")]
#[command(about = "Emulates WeMo switches for Amazon Echo voice control", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind and advertise (autodetected when omitted)
    #[arg(short, long)]
    pub ip: Option<Ipv4Addr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    /// IPv4 address to bind and advertise
    pub ip: Option<Ipv4Addr>,
    /// Multiplexing backend selection
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Multiplexing primitive, chosen once at startup.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// epoll/kqueue via mio (the default).
    #[default]
    Mio,
    /// Portable poll(2) readiness vector.
    Poll,
}

/// Discovery responder configuration
#[derive(Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Answer SSDP searches at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pacing delay between the per-device unicast replies
    #[serde(default = "default_reply_delay_ms")]
    pub reply_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reply_delay_ms: default_reply_delay_ms(),
        }
    }
}

/// One emulated switch
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// Friendly name the Echo learns ("lounge room")
    pub name: String,
    /// Fixed control port; 0 or absent picks an ephemeral one
    #[serde(default)]
    pub port: u16,
    /// Action handler wiring; absent means the fail-closed default
    pub handler: Option<HandlerSpec>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reply_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug)]
pub struct Config {
    pub ip: Ipv4Addr,
    pub backend: Backend,
    pub discovery_enabled: bool,
    pub reply_delay_ms: u64,
    pub devices: Vec<DeviceConfig>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let devices = cap_devices(toml_config.devices);

        let ip = cli
            .ip
            .or(toml_config.ip)
            .unwrap_or_else(local_ip_address);

        Ok(Config {
            ip,
            backend: toml_config.backend,
            discovery_enabled: toml_config.discovery.enabled,
            reply_delay_ms: toml_config.discovery.reply_delay_ms,
            devices,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Drop devices past the Echo's hard switch limit.
fn cap_devices(mut devices: Vec<DeviceConfig>) -> Vec<DeviceConfig> {
    if devices.len() > MAX_DEVICES {
        warn!(
            configured = devices.len(),
            honored = MAX_DEVICES,
            "Echo only controls 16 switches; extra devices dropped"
        );
        devices.truncate(MAX_DEVICES);
    }
    devices
}

/// Best-effort local IPv4 autodetection.
///
/// Connecting a datagram socket picks the source address the kernel
/// would route out of; no traffic is sent. Falls back to loopback on
/// hosts with no default route.
pub fn local_ip_address() -> Ipv4Addr {
    let detected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        });
    detected.unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
