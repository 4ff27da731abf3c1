//! Configuration Vault – reads/writes `~/.armature/config.toml`.
//!
//! ```toml
//! update_interval_ms = 100
//! queue_len = 32
//! replace = false
//!
//! [[driver]]
//! kind = "sim_laser"
//! provides = ["laser:0"]
//! always_on = true
//!
//! [[driver]]
//! kind = "sim_sonar"
//! provides = ["sonar:0", "sonar:1"]
//! queue_len = 8
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use armature_hal::{DriverKind, DriverSpec, HostOptions};
use armature_types::{AccessMode, DeviceId, HalError};
use serde::{Deserialize, Serialize};

/// One `[[driver]]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver kind, e.g. `"sim_laser"`.
    pub kind: String,

    /// Devices served, as `interface:index[:port]`.
    pub provides: Vec<String>,

    /// Subscribe at startup and stay subscribed until exit.
    #[serde(default)]
    pub always_on: bool,

    #[serde(default)]
    pub access: AccessMode,

    /// Inbound queue capacity; falls back to the top-level `queue_len`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<usize>,

    /// Inbound replace policy; falls back to the top-level `replace`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<bool>,
}

impl DriverConfig {
    fn new(kind: DriverKind, provides: &str, always_on: bool) -> Self {
        Self {
            kind: kind.name().to_string(),
            provides: vec![provides.to_string()],
            always_on,
            access: AccessMode::All,
            queue_len: None,
            replace: None,
        }
    }
}

/// Persisted server configuration stored in `~/.armature/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Period of the server loop that runs polled drivers.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Default inbound queue capacity for every driver.
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,

    /// Default inbound replace policy for every driver.
    #[serde(default)]
    pub replace: bool,

    #[serde(default, rename = "driver")]
    pub drivers: Vec<DriverConfig>,
}

fn default_update_interval_ms() -> u64 {
    100
}
fn default_queue_len() -> usize {
    armature_middleware::queue::DEFAULT_MAX_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            queue_len: default_queue_len(),
            replace: false,
            drivers: vec![
                DriverConfig::new(DriverKind::SimLaser, "laser:0", true),
                DriverConfig::new(DriverKind::SimPosition2d, "position2d:0", true),
                DriverConfig::new(DriverKind::SimSonar, "sonar:0", false),
            ],
        }
    }
}

impl Config {
    /// Resolve every `[[driver]]` section into a loadable [`DriverSpec`].
    pub fn driver_specs(&self) -> Result<Vec<DriverSpec>, HalError> {
        self.drivers
            .iter()
            .map(|d| {
                let kind = d.kind.parse::<DriverKind>()?;
                let provides = d
                    .provides
                    .iter()
                    .map(|p| p.parse::<DeviceId>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DriverSpec {
                    kind,
                    provides,
                    options: HostOptions {
                        access: d.access,
                        replace: d.replace.unwrap_or(self.replace),
                        queue_len: d.queue_len.unwrap_or(self.queue_len),
                        always_on: d.always_on,
                    },
                })
            })
            .collect()
    }
}

/// Return the path to `~/.armature/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armature").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, HalError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, HalError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| HalError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| HalError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `ARMATURE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMATURE_UPDATE_INTERVAL_MS` | `update_interval_ms` |
/// | `ARMATURE_QUEUE_LEN` | `queue_len` |
/// | `ARMATURE_REPLACE` | `replace` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARMATURE_UPDATE_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.update_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("ARMATURE_QUEUE_LEN")
        && let Ok(len) = v.parse::<usize>()
    {
        cfg.queue_len = len;
    }
    if let Ok(v) = std::env::var("ARMATURE_REPLACE")
        && let Ok(replace) = v.parse::<bool>()
    {
        cfg.replace = replace;
    }
}

/// Save the config to disk, creating `~/.armature/` if necessary.
pub fn save(cfg: &Config) -> Result<(), HalError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), HalError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| HalError::Config(format!("failed to create config directory: {e}")))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| HalError::Config(format!("failed to set config directory permissions: {e}")))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| HalError::Config(format!("failed to serialize config: {e}")))?;
    let write_err = |e: std::io::Error| HalError::Config(format!("failed to write {}: {e}", path.display()));
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
