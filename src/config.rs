//! Bootstrap configuration loading.
//!
//! TOML is the sole bootstrap source; runtime-mutable settings (alert
//! policy, contacts, PIN) live in the settings JSON under `data_dir` and
//! are managed by [`crate::settings`].
//! Default config path: `/etc/tankhub/tankhub.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default so a bare config file boots a usable
//! server against a local sidecar.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub schema_version: u32,
    /// Directory holding all persisted state (settings, calibration, caches).
    pub data_dir: String,
    pub bus: BusConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// TCP address of the modem sidecar.
    pub sidecar_addr: String,
    /// Per-operation timeout for sidecar calls.
    pub timeout_ms: u64,
    /// Ingest cadence; the drain loop never runs more often than this.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    /// Optional directory of prebuilt dashboard assets served at `/`.
    pub dashboard_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    data_dir: Option<String>,
    bus: Option<RawBusConfig>,
    http: Option<RawHttpConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    sidecar_addr: Option<String>,
    timeout_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHttpConfig {
    bind: Option<String>,
    dashboard_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<HubConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/tankhub/tankhub.toml`.
pub fn load_config() -> Result<HubConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/tankhub/tankhub.toml"))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<HubConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let bus = match raw.bus {
        Some(b) => {
            let timeout_ms = b.timeout_ms.unwrap_or(5000);
            if timeout_ms == 0 {
                return Err(ConfigError::InvalidValue(
                    "bus.timeout_ms must be nonzero".to_owned(),
                ));
            }
            BusConfig {
                sidecar_addr: b.sidecar_addr.unwrap_or_else(|| "127.0.0.1:9903".to_owned()),
                timeout_ms,
                poll_interval_secs: b.poll_interval_secs.unwrap_or(5).max(5),
            }
        }
        None => BusConfig {
            sidecar_addr: "127.0.0.1:9903".to_owned(),
            timeout_ms: 5000,
            poll_interval_secs: 5,
        },
    };

    let http = match raw.http {
        Some(h) => HttpConfig {
            bind: h.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            dashboard_dir: h.dashboard_dir,
        },
        None => HttpConfig {
            bind: "0.0.0.0:8080".to_owned(),
            dashboard_dir: None,
        },
    };

    Ok(HubConfig {
        schema_version,
        data_dir: raw.data_dir.unwrap_or_else(|| "/var/lib/tankhub".to_owned()),
        bus,
        http,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
