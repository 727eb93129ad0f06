//! TOML configuration for fwbackup.
//!
//! A layered model: compiled-in defaults, overridden by a TOML file found via
//! an explicit path, the `FWBACKUP_CONFIG` environment variable, or
//! `./fwbackup.toml`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BackupError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FWBACKUP_CONFIG";

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "fwbackup.toml";

/// Default number of backups kept in the backup directory.
pub const DEFAULT_RETENTION_CAP: usize = 7;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a backup run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub backup: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl BackupConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), devices = config.devices.len(), "loaded configuration");
        Ok(config)
    }

    /// Resolve and load the configuration.
    ///
    /// An explicitly named file must load. Otherwise, in order:
    /// 1. The path in `FWBACKUP_CONFIG`.
    /// 2. `./fwbackup.toml`.
    /// 3. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, path.to_path_buf()));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok((cfg, path)),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FWBACKUP_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load(&local) {
                Ok(cfg) => return Ok((cfg, local)),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok((Self::default(), local))
    }

    /// Write the configuration to `path` via a temporary sibling file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move config into place at {}", path.display()))?;
        info!(path = %path.display(), "saved configuration");
        Ok(())
    }

    /// Reject configurations the run cannot honour.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.backup.retention_cap == 0 {
            return Err(BackupError::Config(
                "backup.retention_cap must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.address.trim().is_empty() {
                return Err(BackupError::Config("device with empty address".to_string()));
            }
            if !seen.insert(device.address.as_str()) {
                return Err(BackupError::Config(format!(
                    "device {} listed more than once",
                    device.address
                )));
            }
        }
        Ok(())
    }

    /// Insert `device`, replacing any entry with the same address in place.
    pub fn upsert_device(&mut self, device: DeviceRecord) {
        match self.devices.iter_mut().find(|d| d.address == device.address) {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    pub fn device(&self, address: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.address == address)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// A firewall to back up: where it lives and the API key it accepts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// IP address or hostname (optionally with `:port`).
    pub address: String,
    /// Long-lived API key issued by the appliance's keygen endpoint.
    #[serde(default)]
    pub api_key: String,
}

impl DeviceRecord {
    pub fn new(address: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            api_key: api_key.into(),
        }
    }
}

// Keys stay out of logs.
impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("address", &self.address)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where backups land and how many are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Flat directory holding `<hostname>_<MMDDYYYY>.tgz` files.
    pub directory: PathBuf,
    /// Where raw exports are written before renaming. Defaults to `directory`.
    /// On another filesystem, placement degrades from a rename to a copy.
    pub working_directory: Option<PathBuf>,
    /// Maximum number of files left in `directory` after pruning.
    pub retention_cap: usize,
    /// Prune after every device (`true`) or once after the whole run.
    pub retention_per_device: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("device_exports"),
            working_directory: None,
            retention_cap: DEFAULT_RETENTION_CAP,
            retention_per_device: true,
        }
    }
}

impl StorageConfig {
    pub fn work_dir(&self) -> &Path {
        self.working_directory.as_deref().unwrap_or(&self.directory)
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Appliance API client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// URL scheme used to reach appliances.
    pub scheme: String,
    /// Upper bound for one export request, body included (seconds).
    pub export_timeout_secs: u64,
    /// TCP/TLS connect timeout (seconds).
    pub connect_timeout_secs: u64,
    /// Accept self-signed appliance certificates.
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            export_timeout_secs: 300,
            connect_timeout_secs: 10,
            accept_invalid_certs: true,
        }
    }
}

impl HttpConfig {
    /// Build the shared appliance client from these settings.
    pub fn client(&self) -> Result<reqwest::Client, BackupError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.export_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| BackupError::Config(format!("cannot build HTTP client: {e}")))
    }

    /// Base URL for an appliance, e.g. `https://10.0.0.5`.
    pub fn base_url(&self, address: &str) -> String {
        format!("{}://{}", self.scheme, address)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Pub/sub notification endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub base_url: String,
    /// Topic to publish to. Unset or empty disables notifications.
    pub channel: Option<String>,
    /// Sent as the `Title` header of every message.
    pub title: String,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ntfy.sh".to_string(),
            channel: None,
            title: "Firewall Backup".to_string(),
            timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
