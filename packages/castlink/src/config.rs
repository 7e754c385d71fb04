use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::link::LinkConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [service]
//                    api_host = "https://api.example.com"
//
//   env var:         CASTLINK_SERVICE__API_HOST=...   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub service: ServiceFileConfig,
    #[serde(default)]
    pub link: LinkFileConfig,
    #[serde(default)]
    pub capture: CaptureFileConfig,
}

/// Backend endpoints (lives under `[service]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceFileConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_website_host")]
    pub website_host: String,
}

impl Default for ServiceFileConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            website_host: default_website_host(),
        }
    }
}

impl ServiceFileConfig {
    /// The event service WebSocket endpoint, derived from the API host.
    pub fn event_service_url(&self) -> String {
        format!("{}/websocket", self.api_host.replacen("http", "ws", 1))
    }

    /// Watch page for a session id (shown to the user after upload).
    pub fn watch_url(&self, session_id: &str) -> String {
        format!("{}/watch/{}", self.website_host, session_id)
    }
}

/// Event service link tunables (lives under `[link]` in config.toml).
/// The defaults are the service contract; override only for testing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_jitter_min_ms")]
    pub connect_jitter_min_ms: u64,
    #[serde(default = "default_connect_jitter_max_ms")]
    pub connect_jitter_max_ms: u64,
}

impl Default for LinkFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_jitter_min_ms: default_connect_jitter_min_ms(),
            connect_jitter_max_ms: default_connect_jitter_max_ms(),
        }
    }
}

/// Commit capture tunables (lives under `[capture]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureFileConfig {
    /// Workspace roots whose repositories are watched during a session.
    #[serde(default = "default_capture_roots")]
    pub roots: Vec<PathBuf>,
}

impl Default for CaptureFileConfig {
    fn default() -> Self {
        Self {
            roots: default_capture_roots(),
        }
    }
}

fn default_api_host() -> String {
    "http://localhost:3001".to_string()
}

fn default_website_host() -> String {
    "http://localhost:3000".to_string()
}

fn default_heartbeat_timeout_secs() -> u64 {
    31
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_jitter_min_ms() -> u64 {
    1000
}

fn default_connect_jitter_max_ms() -> u64 {
    2000
}

fn default_capture_roots() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

impl LinkConfig {
    pub fn from_file(fc: &LinkFileConfig, endpoint: String) -> Self {
        Self {
            endpoint,
            heartbeat_timeout: Duration::from_secs(fc.heartbeat_timeout_secs),
            retry_delay: Duration::from_millis(fc.retry_delay_ms),
            connect_jitter: (
                Duration::from_millis(fc.connect_jitter_min_ms),
                Duration::from_millis(fc.connect_jitter_max_ms),
            ),
        }
    }
}

/// Build a figment that layers: defaults → config.toml → CASTLINK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CASTLINK_SERVICE__API_HOST=https://api.example.com`
///   `CASTLINK_LINK__RETRY_DELAY_MS=250`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CASTLINK_").split("__"))
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct CastlinkConfig {
    pub data_dir: PathBuf,
    #[allow(dead_code)]
    pub logs_dir: PathBuf,
}

impl CastlinkConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = custom_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .expect("Could not find home directory")
                .join(".castlink")
        });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, logs_dir })
    }

    #[allow(dead_code)]
    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
