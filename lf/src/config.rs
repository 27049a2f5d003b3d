//! Loadflow configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main loadflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master control-plane settings
    pub master: MasterConfig,

    /// Slave runtime settings
    pub slave: SlaveConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .loadflow.yml
        let local_config = PathBuf::from(".loadflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/loadflow/loadflow.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("loadflow").join("loadflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Master control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MasterConfig {
    /// Transport listen address
    pub listen: String,

    /// Silence after which an online slave is marked offline
    pub heartbeat_timeout_ms: u64,

    /// Silence after which an offline slave's lease expires
    pub lease_ms: u64,

    /// Heartbeat sweeper cadence
    pub sweep_interval_ms: u64,

    /// Realtime status publishing cadence
    pub status_interval_ms: u64,

    /// Output manager flush cadence
    pub output_flush_ms: u64,

    /// Request/event channel depth
    pub channel_buffer: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7400".to_string(),
            // 3x the default heartbeat interval
            heartbeat_timeout_ms: 15_000,
            lease_ms: 120_000,
            sweep_interval_ms: 5_000,
            status_interval_ms: 500,
            output_flush_ms: 50,
            channel_buffer: 256,
        }
    }
}

/// Slave runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SlaveConfig {
    /// Master transport address
    pub master_addr: String,

    /// Slave id; generated when empty
    pub id: Option<String>,

    /// Hard VU cap advertised to the master
    pub max_vus: u32,

    pub cpu_cores: u32,

    pub memory_mb: u64,

    /// Labels matched against workflow selectors
    pub labels: HashMap<String, String>,

    pub heartbeat_interval_ms: u64,

    /// Result/metrics buffer capacity; overflow drops oldest
    pub buffer_capacity: usize,

    /// Buffer flush cadence while connected
    pub flush_interval_ms: u64,

    /// Extra tasks admitted beyond the VU cap before `busy` rejections
    pub admission_buffer: u32,

    pub connect_timeout_ms: u64,

    pub reconnect_initial_ms: u64,

    pub reconnect_max_ms: u64,

    /// `None` retries forever
    pub reconnect_max_attempts: Option<u32>,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:7400".to_string(),
            id: None,
            max_vus: 10,
            cpu_cores: 1,
            memory_mb: 512,
            labels: HashMap::new(),
            heartbeat_interval_ms: 5_000,
            buffer_capacity: 1_000,
            flush_interval_ms: 500,
            admission_buffer: 2,
            connect_timeout_ms: 5_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 60_000,
            reconnect_max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.master.status_interval_ms, 500);
        assert_eq!(config.slave.heartbeat_interval_ms, 5_000);
        assert_eq!(config.slave.buffer_capacity, 1_000);
        assert!(config.slave.reconnect_max_attempts.is_none());
    }

    #[test]
    fn test_partial_yaml_overlays_defaults() {
        let yaml = r#"
master:
  listen: "0.0.0.0:9000"
slave:
  max-vus: 50
  reconnect-max-attempts: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.master.listen, "0.0.0.0:9000");
        assert_eq!(config.master.status_interval_ms, 500);
        assert_eq!(config.slave.max_vus, 50);
        assert_eq!(config.slave.reconnect_max_attempts, Some(5));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let path = PathBuf::from("/nonexistent/loadflow.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
