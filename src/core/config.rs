use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{PoolError, Result};

/// Default address the coordinator pushes work from
pub const DEFAULT_WORK_ADDRESS: &str = "0.0.0.0:1337";
/// Default address the coordinator collects results on
pub const DEFAULT_RESULT_ADDRESS: &str = "0.0.0.0:1338";

/// Network configuration shared by a coordinator and the executors that
/// connect to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address of the work channel (coordinator binds, executors connect)
    #[serde(default = "default_work_address")]
    pub work_address: String,
    /// Address of the result channel (coordinator binds, executors connect)
    #[serde(default = "default_result_address")]
    pub result_address: String,
    /// Packets buffered on each side before `send_work` waits
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Largest single frame accepted from the network
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Pause between connect attempts while an executor waits for its coordinator
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
    /// Give up connecting after this long (0 = keep trying until closed)
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

fn default_work_address() -> String {
    DEFAULT_WORK_ADDRESS.to_string()
}

fn default_result_address() -> String {
    DEFAULT_RESULT_ADDRESS.to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    256 * 1024 * 1024 // 256 MiB
}

fn default_connect_retry_interval_ms() -> u64 {
    100
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            work_address: default_work_address(),
            result_address: default_result_address(),
            channel_capacity: default_channel_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            connect_timeout_ms: 0,
        }
    }
}

impl ClusterConfig {
    /// Create a new builder for ClusterConfig
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
    }

    /// Configuration for a pair of addresses, everything else default
    pub fn with_addresses(
        work_address: impl Into<String>,
        result_address: impl Into<String>,
    ) -> Self {
        Self {
            work_address: work_address.into(),
            result_address: result_address.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML document, filling absent fields with defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connect_timeout_ms))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.work_address.is_empty() {
            return Err(PoolError::configuration_field(
                "work_address must not be empty",
                "work_address",
            ));
        }
        if self.result_address.is_empty() {
            return Err(PoolError::configuration_field(
                "result_address must not be empty",
                "result_address",
            ));
        }
        if self.work_address == self.result_address && !self.work_address.ends_with(":0") {
            return Err(PoolError::configuration(
                "work_address and result_address must differ",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(PoolError::configuration_field(
                "channel_capacity must be greater than 0",
                "channel_capacity",
            ));
        }
        if self.max_frame_bytes < 256 {
            return Err(PoolError::configuration_field(
                "max_frame_bytes is too small to hold any packet",
                "max_frame_bytes",
            ));
        }
        if self.max_frame_bytes > u32::MAX as usize {
            return Err(PoolError::configuration_field(
                "max_frame_bytes cannot exceed u32::MAX",
                "max_frame_bytes",
            ));
        }
        if self.connect_retry_interval_ms == 0 {
            return Err(PoolError::configuration_field(
                "connect_retry_interval_ms must be greater than 0",
                "connect_retry_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Builder for ClusterConfig
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
        }
    }

    pub fn work_address(mut self, address: impl Into<String>) -> Self {
        self.config.work_address = address.into();
        self
    }

    pub fn result_address(mut self, address: impl Into<String>) -> Self {
        self.config.result_address = address.into();
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.config.max_frame_bytes = bytes;
        self
    }

    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.config.connect_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_well_known_ports() {
        let config = ClusterConfig::default();
        assert_eq!(config.work_address, "0.0.0.0:1337");
        assert_eq!(config.result_address, "0.0.0.0:1338");
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn yaml_fills_missing_fields() {
        let config = ClusterConfig::from_yaml_str(
            "work_address: 10.0.0.5:7000\nresult_address: 10.0.0.5:7001\nconnect_timeout_ms: 2500\n",
        )
        .unwrap();
        assert_eq!(config.work_address, "10.0.0.5:7000");
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn builder_rejects_invalid_values() {
        assert!(ClusterConfig::builder().channel_capacity(0).build().is_err());
        // must at least carry a work request
        assert!(ClusterConfig::builder().max_frame_bytes(64).build().is_err());
        assert!(ClusterConfig::builder()
            .work_address("127.0.0.1:9000")
            .result_address("127.0.0.1:9000")
            .build()
            .is_err());
        // port 0 twice is fine, the OS hands out two different ports
        assert!(ClusterConfig::builder()
            .work_address("127.0.0.1:0")
            .result_address("127.0.0.1:0")
            .build()
            .is_ok());
    }
}
