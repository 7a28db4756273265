//! Application configuration options

use std::time::Duration;

use crate::deploy::orchestrator::OrchestratorOptions;
use crate::runtime::cli::DEFAULT_BINARY;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Container runtime CLI binary
    pub runtime_binary: String,

    /// Deployment orchestrator settings
    pub orchestrator: OrchestratorOptions,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            runtime_binary: DEFAULT_BINARY.to_string(),
            orchestrator: OrchestratorOptions::default(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            runtime_binary: settings.runtime.binary.clone(),
            orchestrator: settings.orchestrator_options(),
            ..Default::default()
        }
    }
}
