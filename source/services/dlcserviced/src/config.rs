// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration, read from a TOML file.
//!
//! Every section and key is optional; a missing file yields the defaults.
//!
//! ```toml
//! [paths]
//! manifest_dir = "/opt/google/dlc"
//! content_dir = "/var/cache/dlc"
//!
//! [boot]
//! cmdline = "/proc/cmdline"
//!
//! [cleanup]
//! debounce_secs = 1800
//! user_expiry_secs = 432000
//!
//! [update_engine]
//! watchdog_secs = 5
//!
//! [server]
//! socket = "/run/dlcservice/dlcservice.sock"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dlc::{ExpiryPolicy, Paths};
use serde::Deserialize;
use thiserror::Error;

use crate::service::Timers;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dlcservice/dlcserviced.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// TOML parsing failed.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed but is not usable.
    #[error("invalid config {path}: {reason}")]
    Invalid {
        path: PathBuf,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub boot: BootConfig,
    pub cleanup: CleanupConfig,
    pub update_engine: UpdateEngineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub manifest_dir: PathBuf,
    pub preloaded_content_dir: PathBuf,
    pub factory_install_dir: PathBuf,
    pub content_dir: PathBuf,
    pub prefs_dir: PathBuf,
    pub users_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_dir: "/opt/google/dlc".into(),
            preloaded_content_dir: "/var/cache/dlc-images".into(),
            factory_install_dir: "/mnt/stateful_partition/unencrypted/dlc-factory-images".into(),
            content_dir: "/var/cache/dlc".into(),
            prefs_dir: "/var/lib/dlcservice/dlc".into(),
            users_dir: "/home/user".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BootConfig {
    pub cmdline: PathBuf,
    pub sys_block: PathBuf,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self { cmdline: "/proc/cmdline".into(), sys_block: "/sys/block".into() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub debounce_secs: u64,
    pub user_expiry_secs: u64,
    pub system_expiry_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let expiry = ExpiryPolicy::default();
        Self {
            debounce_secs: crate::service::CLEANUP_DEBOUNCE.as_secs(),
            user_expiry_secs: expiry.user.as_secs(),
            system_expiry_secs: expiry.system.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateEngineConfig {
    pub watchdog_secs: u64,
}

impl Default for UpdateEngineConfig {
    fn default() -> Self {
        Self { watchdog_secs: crate::service::WATCHDOG_PERIOD.as_secs() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub socket: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { socket: "/run/dlcservice/dlcservice.sock".into() }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        let config: Self = toml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate().map_err(|reason| ConfigError::Invalid { path: path.to_path_buf(), reason })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.update_engine.watchdog_secs == 0 {
            return Err("update_engine.watchdog_secs must be non-zero".into());
        }
        if self.cleanup.debounce_secs == 0 {
            return Err("cleanup.debounce_secs must be non-zero".into());
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        let paths = &self.paths;
        Paths {
            manifest_dir: paths.manifest_dir.clone(),
            preloaded_content_dir: paths.preloaded_content_dir.clone(),
            factory_install_dir: paths.factory_install_dir.clone(),
            content_dir: paths.content_dir.clone(),
            prefs_dir: paths.prefs_dir.clone(),
            users_dir: paths.users_dir.clone(),
        }
    }

    pub fn expiry(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            user: Duration::from_secs(self.cleanup.user_expiry_secs),
            system: Duration::from_secs(self.cleanup.system_expiry_secs),
        }
    }

    pub fn timers(&self) -> Timers {
        Timers {
            watchdog: Duration::from_secs(self.update_engine.watchdog_secs),
            cleanup_debounce: Duration::from_secs(self.cleanup.debounce_secs),
        }
    }
}
