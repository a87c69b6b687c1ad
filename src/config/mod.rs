use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::event::DEFAULT_STARTED_BANNER;

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 30;
const DEFAULT_STATE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STATE_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate server name detected: {0}")]
    DuplicateServer(String),

    #[error("Server '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Invalid started_banner pattern: {0}")]
    InvalidBanner(#[from] regex::Error),
}

// ─── Timing / control settings ───────────────────────────────

/// Tunables for reconnection, state confirmation and heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSettings {
    /// Fixed wait between a lost daemon connection and the next attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound for `wait_for_state`.
    pub state_timeout: Duration,
    /// Polling period for `wait_for_state`.
    pub state_poll_interval: Duration,
    /// Period of the daemon's unconditional `PS` broadcast.
    pub heartbeat_interval: Duration,
    /// Regex matching the child's "fully started" line.
    pub started_banner: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            state_timeout: Duration::from_secs(DEFAULT_STATE_TIMEOUT_SECS),
            state_poll_interval: Duration::from_millis(DEFAULT_STATE_POLL_INTERVAL_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            started_banner: DEFAULT_STARTED_BANNER.to_string(),
        }
    }
}

/// `[control]` table as written in TOML.
#[derive(Deserialize, Debug, Clone, Default)]
struct ControlSection {
    reconnect_backoff_secs: Option<u64>,
    state_timeout_secs: Option<u64>,
    state_poll_interval_ms: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    started_banner: Option<String>,
}

impl From<ControlSection> for ControlSettings {
    fn from(section: ControlSection) -> Self {
        let defaults = Self::default();
        Self {
            reconnect_backoff: section
                .reconnect_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_backoff),
            state_timeout: section
                .state_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.state_timeout),
            state_poll_interval: section
                .state_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.state_poll_interval),
            heartbeat_interval: section
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            started_banner: section.started_banner.unwrap_or(defaults.started_banner),
        }
    }
}

// ─── Servers ─────────────────────────────────────────────────

/// How a server's process is owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ContainerMode {
    /// The management process spawns and owns the child itself.
    Embedded,
    /// A `mcga-daemon` on this loopback port owns the child.
    Daemon { port: u16 },
}

impl ContainerMode {
    /// Port 0 means "no daemon".
    pub fn for_port(port: u16) -> Self {
        match port {
            0 => Self::Embedded,
            port => Self::Daemon { port },
        }
    }
}

/// Immutable descriptor of one managed server.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub working_dir: String,
    /// argv; a plain string is split on whitespace.
    #[serde(deserialize_with = "deserialize_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub daemon_port: u16,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerConfig {
    pub fn new(name: &str, working_dir: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            daemon_port: 0,
            stop_command: default_stop_command(),
            enabled: true,
        }
    }

    pub fn with_daemon_port(mut self, port: u16) -> Self {
        self.daemon_port = port;
        self
    }

    pub fn mode(&self) -> ContainerMode {
        ContainerMode::for_port(self.daemon_port)
    }
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

fn deserialize_command<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match CommandLine::deserialize(deserializer)? {
        CommandLine::Argv(argv) => argv,
        CommandLine::Line(line) => line.split_whitespace().map(String::from).collect(),
    })
}

// ─── Global config ───────────────────────────────────────────

#[derive(Deserialize, Debug, Clone, Default)]
struct RawConfig {
    #[serde(default)]
    control: ControlSection,
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub control: ControlSettings,
    pub servers: Vec<ServerConfig>,
}

impl GlobalConfig {
    /// Load from `path`. A missing file yields an empty configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg = Self::from_toml_str(&content)?;
        tracing::info!("Loaded {} server(s) from {}", cfg.servers.len(), path.display());
        Ok(cfg)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        let control = ControlSettings::from(raw.control);
        regex::Regex::new(&control.started_banner)?;

        let mut names = HashSet::new();
        let mut servers = Vec::new();
        for server in raw.servers {
            if !server.enabled {
                tracing::debug!("Skipping disabled server '{}'", server.name);
                continue;
            }
            if server.command.is_empty() {
                return Err(ConfigError::EmptyCommand(server.name));
            }
            if !names.insert(server.name.clone()) {
                return Err(ConfigError::DuplicateServer(server.name));
            }
            servers.push(server);
        }

        Ok(Self { control, servers })
    }

    pub fn get_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}
