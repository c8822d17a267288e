use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{ChatError, Result};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [connection]
//                    reconnect_delay_ms = 2000
//
//   env var:         STOREFRONT_CONNECTION__RECONNECT_DELAY_MS=2000
//
//   (double underscore = nesting, single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Backend endpoints (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

/// Connection tunables (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Frames that may wait for a live link before sends are rejected.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            outbox_capacity: default_outbox_capacity(),
            event_capacity: default_event_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws".to_string()
}
fn default_api_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_outbox_capacity() -> usize {
    64
}
fn default_event_capacity() -> usize {
    256
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → STOREFRONT_* env vars.
///
///   `STOREFRONT_SERVER__WS_URL=wss://shop.example/ws`  →  `server.ws_url`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("STOREFRONT_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the session and transport)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub connection: ConnectionConfig,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Pause between a lost link and the next attempt
    pub reconnect_delay: Duration,
    pub outbox_capacity: usize,
    /// Capacity of the raw topic taps and the observed-message feed
    pub event_capacity: usize,
    /// Upper bound on socket open plus STOMP handshake
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            outbox_capacity: fc.outbox_capacity.max(1),
            event_capacity: fc.event_capacity.max(1),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs.max(1)),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            ws_url: fc.server.ws_url.trim_end_matches('/').to_string(),
            api_url: fc.server.api_url.trim_end_matches('/').to_string(),
            connection: ConnectionConfig::from_file(&fc.connection),
        }
    }

    /// Load from `data_dir` with env overrides applied.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(data_dir).extract()?;
        Ok(Self::from_file(&fc))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientDirs {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ClientDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| ChatError::Config("could not find home directory".into()))?
                .join(".storefront-chat"),
        };

        std::fs::create_dir_all(&data_dir).map_err(|e| {
            ChatError::Config(format!(
                "failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir).map_err(|e| {
            ChatError::Config(format!(
                "failed to create logs directory {}: {e}",
                logs_dir.display()
            ))
        })?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, logs_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
