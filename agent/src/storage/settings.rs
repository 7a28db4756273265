//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::container::{
    ResourceLimits, DEFAULT_CPU_LIMIT, DEFAULT_MEMORY_LIMIT, DEFAULT_STOP_TIMEOUT_SECS,
};
use crate::deploy::health::HealthCheckOptions;
use crate::deploy::orchestrator::{
    OrchestratorOptions, DEFAULT_FAILURE_LOG_TAIL, DEFAULT_IMAGE_RETENTION,
};
use crate::logs::{LogLevel, LogOptions};
use crate::runtime::cli::DEFAULT_BINARY;

/// Host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily-rotated log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Container runtime configuration
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Limits applied to every container
    #[serde(default)]
    pub container: ContainerSettings,

    /// Image retention
    #[serde(default)]
    pub images: ImageSettings,

    /// Post-start health check
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Log lines captured from a container that failed its health check
    #[serde(default = "default_failure_log_tail")]
    pub failure_log_tail: usize,
}

fn default_failure_log_tail() -> usize {
    DEFAULT_FAILURE_LOG_TAIL
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            runtime: RuntimeSettings::default(),
            container: ContainerSettings::default(),
            images: ImageSettings::default(),
            health_check: HealthCheckSettings::default(),
            failure_log_tail: default_failure_log_tail(),
        }
    }
}

impl Settings {
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            limits: ResourceLimits {
                memory: self.container.memory_limit.clone(),
                cpus: self.container.cpu_limit.clone(),
            },
            stop_timeout_secs: self.container.stop_timeout_secs,
            image_retention: self.images.retention,
            health_check: HealthCheckOptions {
                host: self.health_check.host.clone(),
                path: self.health_check.path.clone(),
                interval: Duration::from_millis(self.health_check.interval_ms),
                timeout: Duration::from_millis(self.health_check.timeout_ms),
            },
            failure_log_tail: self.failure_log_tail,
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            json_format: self.log_json,
            ..Default::default()
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Runtime CLI binary, resolved through `PATH`
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
        }
    }
}

/// Container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,

    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,

    /// Grace period given to `stop` before the runtime kills the container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_memory_limit() -> String {
    DEFAULT_MEMORY_LIMIT.to_string()
}

fn default_cpu_limit() -> String {
    DEFAULT_CPU_LIMIT.to_string()
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Images kept per project after a successful deploy
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_retention() -> usize {
    DEFAULT_IMAGE_RETENTION
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

/// Health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_path")]
    pub path: String,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            host: default_host(),
            path: default_path(),
        }
    }
}
