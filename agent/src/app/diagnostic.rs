//! Runtime and configuration diagnostics

use serde::Serialize;

use crate::runtime::cli::CliRuntime;
use crate::runtime::{args, ContainerRuntime};
use crate::storage::settings::Settings;
use crate::utils::{version_info, VersionInfo};

/// Outcome of `--diagnostic`
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub version: VersionInfo,
    pub settings_file: String,
    pub settings: Settings,
    pub runtime_available: bool,
    pub runtime_version: Option<String>,
}

/// Probe the configured runtime and collect the effective settings
pub async fn run_diagnostic(settings: &Settings, settings_file: &str) -> DiagnosticReport {
    let runtime = CliRuntime::new(&settings.runtime.binary);
    let runtime_available = runtime.is_available().await;

    let runtime_version = if runtime_available {
        let output = runtime
            .exec(&args(["version", "--format", "{{.Server.Version}}"]))
            .await;
        output
            .success()
            .then(|| output.stdout.trim().to_string())
            .filter(|version| !version.is_empty())
    } else {
        None
    };

    DiagnosticReport {
        version: version_info(),
        settings_file: settings_file.to_string(),
        settings: settings.clone(),
        runtime_available,
        runtime_version,
    }
}
