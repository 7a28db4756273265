//! Dockyard - Entry Point
//!
//! Builds, starts, health-checks and follows application containers on a
//! single host.

use std::collections::HashMap;
use std::env;

use anyhow::Context;
use tracing::{error, info, warn};

use dockyard::app::diagnostic::run_diagnostic;
use dockyard::app::options::AppOptions;
use dockyard::app::run::run;
use dockyard::filesys::file::File;
use dockyard::logs::init_logging;
use dockyard::storage::layout::StorageLayout;
use dockyard::storage::settings::Settings;
use dockyard::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        print_json(&version);
        return;
    }

    // Retrieve the settings file
    let layout = StorageLayout::default();
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let (settings, settings_warning) = match load_settings(&settings_file).await {
        Ok(Some(settings)) => (settings, None),
        Ok(None) => (
            Settings::default(),
            Some(format!(
                "Settings file {} not found, using defaults",
                settings_file.path().display()
            )),
        ),
        Err(e) => {
            eprintln!("{:#}", e);
            return;
        }
    };

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        let report =
            run_diagnostic(&settings, &settings_file.path().display().to_string()).await;
        print_json(&report);
        return;
    }

    // Initialize logging
    let _log_guard = match init_logging(settings.log_options()) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };
    if let Some(warning) = settings_warning {
        warn!("{}", warning);
    }

    // Run the host
    let options = AppOptions::from(&settings);
    info!("Running Dockyard with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run dockyard: {e}");
        std::process::exit(1);
    }
}

/// Read the settings file, `None` when it does not exist
async fn load_settings(file: &File) -> anyhow::Result<Option<Settings>> {
    if !file.exists().await {
        return Ok(None);
    }
    let settings = file
        .read_json::<Settings>()
        .await
        .with_context(|| format!("Unable to read settings file {}", file.path().display()))?;
    Ok(Some(settings))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Unable to serialize output: {}", e),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
            }
            _ => {
                error!("Unable to install signal handlers, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
