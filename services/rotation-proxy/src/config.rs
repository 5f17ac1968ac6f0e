//! Configuration types and loading
//!
//! A TOML file supplies the full configuration; every core input can also
//! be overridden through `ROTATION_*` environment variables, which wins over
//! the file. A missing file is fine — the defaults point at the public API
//! with a local `./data` directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Error, Result};
use serde::Deserialize;

/// Default config file location when neither `--config` nor
/// `ROTATION_CONFIG` is given.
const DEFAULT_CONFIG_PATH: &str = "rotation-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub rotation: RotationConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 8080))
            }),
        }
    }
}

/// Upstream API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".into(),
            request_timeout_secs: 600,
            connect_timeout_secs: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Rotation core settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Directory holding the store file (and optionally a legacy
    /// accounts.json to migrate).
    pub data_dir: PathBuf,
    /// How long before token expiry the scheduler refreshes.
    pub refresh_lead_secs: u64,
    /// Maximum accounts tried per request.
    pub max_attempts: u32,
    /// Refuse to start with an empty pool (exit code 3) instead of
    /// serving 503s until accounts appear.
    pub require_accounts: bool,
    /// Explicit legacy accounts file; defaults to `<data_dir>/accounts.json`.
    pub legacy_accounts_file: Option<PathBuf>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            refresh_lead_secs: 300,
            max_attempts: 3,
            require_accounts: false,
            legacy_accounts_file: None,
        }
    }
}

impl Config {
    /// Resolve the config path: CLI flag, then `ROTATION_CONFIG`, then the
    /// default location.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ROTATION_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a TOML file (missing file means defaults),
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `ROTATION_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = get("ROTATION_UPSTREAM_URL") {
            self.upstream.base_url = value;
        }
        if let Some(value) = get("ROTATION_DATA_DIR") {
            self.rotation.data_dir = PathBuf::from(value);
        }
        if let Some(value) = get("ROTATION_LISTEN_ADDR") {
            self.server.listen_addr = value.parse().map_err(|e| Error::Env {
                name: "ROTATION_LISTEN_ADDR".into(),
                message: format!("{e}"),
            })?;
        }
        if let Some(value) = get("ROTATION_REFRESH_LEAD_SECS") {
            self.rotation.refresh_lead_secs = value.parse().map_err(|e| Error::Env {
                name: "ROTATION_REFRESH_LEAD_SECS".into(),
                message: format!("{e}"),
            })?;
        }
        if let Some(value) = get("ROTATION_MAX_ATTEMPTS") {
            self.rotation.max_attempts = value.parse().map_err(|e| Error::Env {
                name: "ROTATION_MAX_ATTEMPTS".into(),
                message: format!("{e}"),
            })?;
        }
        Ok(())
    }

    /// Location of the SQLite store file.
    pub fn db_path(&self) -> PathBuf {
        self.rotation.data_dir.join("proxy.db")
    }

    /// Location of the legacy JSON accounts file to migrate on boot.
    pub fn legacy_accounts_path(&self) -> PathBuf {
        self.rotation
            .legacy_accounts_file
            .clone()
            .unwrap_or_else(|| self.rotation.data_dir.join("accounts.json"))
    }
}
