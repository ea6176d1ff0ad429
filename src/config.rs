//! Configuration loading for block script execution

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{transport::TransportMode, BlockError, Result};

/// Default location of the runner configuration
pub const DEFAULT_CONFIG_PATH: &str = "config/default_config.yaml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub serial_log: SerialLogConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransportConfig {
    pub mode: Option<TransportMode>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub default_ms: Option<u64>,
    pub long_command_ms: Option<u64>,
    pub acrobatic_moves_ms: Option<u64>,
    pub joint_query_ms: Option<u64>,
    pub sensor_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutionConfig {
    pub check_interval_ms: Option<u64>,
    pub abort_on_send_failure: Option<bool>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SkillsConfig {
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SerialLogConfig {
    pub capacity_bytes: Option<usize>,
}

impl Config {
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| BlockError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.execution.check_interval_ms == Some(0) {
            return Err(BlockError::Config("execution.check_interval_ms must be positive".to_string()));
        }
        if self.serial_log.capacity_bytes == Some(0) {
            return Err(BlockError::Config("serial_log.capacity_bytes must be positive".to_string()));
        }
        Ok(())
    }

    /// Transport mode with network fallback
    pub fn mode(&self) -> TransportMode {
        self.transport.mode.unwrap_or(TransportMode::Network)
    }
}

impl TimeoutConfig {
    /// Timeout for ordinary motion commands
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms.unwrap_or(10_000))
    }

    /// Timeout for commands that keep the robot busy for a long time
    pub fn long_command(&self) -> Duration {
        Duration::from_millis(self.long_command_ms.unwrap_or(30_000))
    }

    pub fn acrobatic_moves(&self) -> Duration {
        Duration::from_millis(self.acrobatic_moves_ms.unwrap_or(30_000))
    }

    /// Timeout for the joint state query issued before relative moves
    pub fn joint_query(&self) -> Duration {
        Duration::from_millis(self.joint_query_ms.unwrap_or(5_000))
    }

    /// Timeout for sensor reads and IO writes
    pub fn sensor(&self) -> Duration {
        Duration::from_millis(self.sensor_ms.unwrap_or(5_000))
    }
}

impl ExecutionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.unwrap_or(100))
    }

    pub fn abort_on_send_failure(&self) -> bool {
        self.abort_on_send_failure.unwrap_or(false)
    }

    pub fn debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }
}

impl SerialLogConfig {
    pub fn capacity(&self) -> usize {
        self.capacity_bytes.unwrap_or(8192)
    }
}
