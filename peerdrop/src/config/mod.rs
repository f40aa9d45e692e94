//! Configuration for the `peerdrop` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/peerdrop/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::net::NetConfig;
use crate::session::Role;
use crate::signaling::DEFAULT_CONNECT_TIMEOUT;
use crate::transfer::TransferPolicy;

/// Default public STUN server.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting needed to start a session is not set anywhere.
    #[error("{0} is not configured (pass --{0} or set it in the config file)")]
    Missing(&'static str),

    /// A setting has an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    transfer: TransferFileConfig,
    storage: StorageFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    room: Option<String>,
    ice_servers: Option<Vec<String>>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[transfer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferFileConfig {
    chunk_size: Option<usize>,
    single_message_threshold: Option<u64>,
    low_water_mark: Option<usize>,
    drain_timeout_secs: Option<u64>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    download_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server WebSocket URL.
    pub relay_url: Option<String>,
    /// Room to join.
    pub room: Option<String>,
    /// STUN/TURN server URLs for the peer connection.
    pub ice_servers: Vec<String>,
    /// Timeout for connecting to the relay server.
    pub connect_timeout: Duration,
    /// Capacity of the session command/event channels.
    pub channel_capacity: usize,
    /// Outgoing file pacing.
    pub policy: TransferPolicy,
    /// Where received files are written.
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            room: None,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_capacity: 256,
            policy: TransferPolicy::default(),
            download_dir: default_download_dir(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// or if any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let transfer = &file.transfer;

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone()),
            room: cli.room.clone().or_else(|| file.network.room.clone()),
            ice_servers: file
                .network
                .ice_servers
                .clone()
                .unwrap_or(defaults.ice_servers),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            policy: TransferPolicy {
                chunk_size: transfer.chunk_size.unwrap_or(defaults.policy.chunk_size),
                single_message_threshold: transfer
                    .single_message_threshold
                    .unwrap_or(defaults.policy.single_message_threshold),
                low_water_mark: transfer
                    .low_water_mark
                    .unwrap_or(defaults.policy.low_water_mark),
                drain_timeout: transfer
                    .drain_timeout_secs
                    .map_or(defaults.policy.drain_timeout, Duration::from_secs),
            },
            download_dir: cli
                .download_dir
                .clone()
                .or_else(|| file.storage.download_dir.clone())
                .unwrap_or(defaults.download_dir),
        }
    }

    /// Check the settings a session needs and build its [`NetConfig`].
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] if the relay URL or room is unset or empty.
    /// - [`ConfigError::Invalid`] for a zero chunk size or channel capacity.
    pub fn to_net_config(&self, role: Role) -> Result<NetConfig, ConfigError> {
        let relay_url = self
            .relay_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("relay-url"))?;
        let room = self
            .room
            .clone()
            .filter(|r| !r.trim().is_empty())
            .ok_or(ConfigError::Missing("room"))?;
        if self.policy.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(NetConfig {
            relay_url,
            ice_servers: self.ice_servers.clone(),
            connect_timeout: self.connect_timeout,
            room,
            role,
            policy: self.policy.clone(),
            channel_capacity: self.channel_capacity,
        })
    }
}

/// Which side of the negotiation this client takes.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Create the offer (first to join, or re-announce to a late joiner).
    #[default]
    Offer,
    /// Wait for an offer and answer it.
    Listen,
}

impl From<Mode> for Role {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Offer => Self::Caller,
            Mode::Listen => Self::Callee,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peer-to-peer text and file transfer")]
pub struct CliArgs {
    /// Whether to offer or to listen for an offer.
    #[arg(value_enum, default_value_t = Mode::Offer)]
    pub mode: Mode,

    /// WebSocket URL of the relay server.
    #[arg(long, env = "PEERDROP_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Room to join.
    #[arg(long, env = "PEERDROP_ROOM")]
    pub room: Option<String>,

    /// Path to config file (default: `~/.config/peerdrop/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for received files.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PEERDROP_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("peerdrop").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
