//! Daemon configuration (`wlmd.toml`).
//!
//! Every key is optional; a missing file means defaults. Environment
//! overrides are applied last so tests and service units can relocate the
//! endpoint and lock without a file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "WLMD_CONFIG";
pub const SOCKET_ENV: &str = "WLMD_SOCKET";
pub const LOCK_ENV: &str = "WLMD_LOCK";
pub const TARGET_ENV: &str = "WLMD_TARGET";
const DEFAULT_CONFIG_FILE: &str = "wlmd.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub channel: ChannelCfg,
    pub instance: InstanceCfg,
    pub service: ServiceCfg,
    pub process: ProcessCfg,
    pub log: LogCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelCfg {
    pub socket: PathBuf,
    pub stop_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceCfg {
    pub lock: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceCfg {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub unit_dir: PathBuf,
    pub restart_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub claim_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessCfg {
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogCfg {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for ChannelCfg {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(wlmd_client::DEFAULT_SOCK),
            stop_timeout_ms: 5_000,
            read_timeout_ms: 2_000,
        }
    }
}

impl Default for InstanceCfg {
    fn default() -> Self {
        Self {
            lock: PathBuf::from("/tmp/wlmd.lock"),
        }
    }
}

impl Default for ServiceCfg {
    fn default() -> Self {
        Self {
            name: "wlmd".to_string(),
            display_name: "Winlogon Manager Service".to_string(),
            description: "Manages winlogon process operations".to_string(),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            restart_delay_ms: 2_000,
            poll_interval_ms: 1_000,
            claim_timeout_ms: 5_000,
        }
    }
}

impl Default for ProcessCfg {
    fn default() -> Self {
        Self {
            target: "winlogon".to_string(),
        }
    }
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl ChannelCfg {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ServiceCfg {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// How long `--service` keeps retrying the instance lock before giving up.
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

impl Config {
    /// Resolve the config path: explicit flag, then `WLMD_CONFIG`, then
    /// `./wlmd.toml` if it exists.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            })
    }

    /// Load from `path` (or defaults when `None`), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let parsed = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            None => {
                debug!("No configuration file; using defaults");
                Config::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(socket) = non_empty(SOCKET_ENV) {
            self.channel.socket = PathBuf::from(socket);
        }
        if let Some(lock) = non_empty(LOCK_ENV) {
            self.instance.lock = PathBuf::from(lock);
        }
        if let Some(target) = non_empty(TARGET_ENV) {
            self.process.target = target.trim().to_string();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.socket.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "channel.socket",
                reason: "must not be empty".into(),
            });
        }
        if self.instance.lock.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "instance.lock",
                reason: "must not be empty".into(),
            });
        }
        if self.service.name.trim().is_empty()
            || self.service.name.contains(|c: char| c == '/' || c.is_whitespace())
        {
            return Err(ConfigError::Invalid {
                key: "service.name",
                reason: format!("'{}' is not a usable unit name", self.service.name),
            });
        }
        if self.process.target.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "process.target",
                reason: "must not be empty".into(),
            });
        }
        if self.channel.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "channel.read_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.service.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "service.poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}
