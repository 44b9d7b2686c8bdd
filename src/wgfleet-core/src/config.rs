//! `FleetConfig`: the on-disk settings for a `wgfleetd` run (ambient
//! stack addition — ports, pools and policy are configurable rather than
//! hardcoded, the way the teacher's own `ConfigFile`/`Config` split works).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cidr::{Cidr, CidrError};
use crate::model::StaleAction;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("invalid pool CIDR: {0}")]
    Pool(#[from] CidrError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfigFile {
    pub data_dir: String,
    pub pool_cidr: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub stale_action: String,
    pub driver: String,
}

impl Default for FleetConfigFile {
    fn default() -> Self {
        FleetConfigFile {
            data_dir: "~/.local/share/wgfleet".to_string(),
            pool_cidr: "10.100.0.0/16".to_string(),
            port_range_start: 49152,
            port_range_end: 65535,
            stale_action: "log-only".to_string(),
            driver: "real".to_string(),
        }
    }
}

/// A fully resolved, validated configuration ready for use by the
/// allocator and registry.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub data_dir: PathBuf,
    pub pool: Cidr,
    pub port_range: std::ops::RangeInclusive<u16>,
    pub stale_action: StaleAction,
    pub use_mock_driver: bool,
}

impl FleetConfig {
    pub fn default_path() -> PathBuf {
        expand_tilde("~/.config/wgfleet/conf.yml")
    }

    pub fn load(path: &Path) -> Result<FleetConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: FleetConfigFile = serde_yml::from_str(&text)?;
        FleetConfig::from_file(file)
    }

    pub fn load_or_default(path: &Path) -> Result<FleetConfig, ConfigError> {
        if path.exists() {
            FleetConfig::load(path)
        } else {
            FleetConfig::from_file(FleetConfigFile::default())
        }
    }

    fn from_file(file: FleetConfigFile) -> Result<FleetConfig, ConfigError> {
        let pool = Cidr::from_string(&file.pool_cidr)?;
        let stale_action = match file.stale_action.as_str() {
            "terminate" => StaleAction::Terminate,
            _ => StaleAction::LogOnly,
        };
        Ok(FleetConfig {
            data_dir: expand_tilde(&file.data_dir),
            pool,
            port_range: file.port_range_start..=file.port_range_end,
            stale_action,
            use_mock_driver: file.driver == "mock",
        })
    }
}

/// Expand a leading `~` to the user's home directory, generalized from
/// the teacher's own `expand_tilde` in `main.rs`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_file_parses_into_valid_config() {
        let config = FleetConfig::from_file(FleetConfigFile::default()).unwrap();
        assert_eq!(config.pool.to_string(), "10.100.0.0/16");
        assert_eq!(config.stale_action, StaleAction::LogOnly);
        assert!(!config.use_mock_driver);
    }

    #[test]
    fn expand_tilde_resolves_home() {
        let expanded = expand_tilde("~/foo");
        assert!(expanded.is_absolute() || expanded == PathBuf::from("~/foo"));
    }
}
