//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::DockyardError;
use crate::models::deployment::RuntimeLogLine;
use crate::runtime::cli::CliRuntime;
use crate::runtime::ContainerRuntime;

/// Run the Dockyard host until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DockyardError> {
    info!("Initializing Dockyard {}...", version);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&options.runtime_binary));
    let (orchestrator, drain_handle) = init(runtime, &options).await?;

    let recovered = orchestrator.recover_log_streams().await;
    info!("Dockyard ready, following {} container(s)", recovered);

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    shutdown(orchestrator, drain_handle, &options).await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    runtime: Arc<dyn ContainerRuntime>,
    options: &AppOptions,
) -> Result<(Arc<Orchestrator>, JoinHandle<()>), DockyardError> {
    if !runtime.is_available().await {
        return Err(DockyardError::RuntimeError(format!(
            "Container runtime '{}' is not available",
            options.runtime_binary
        )));
    }

    let (logs_tx, logs_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(runtime, options.orchestrator.clone(), logs_tx)?;
    let drain_handle = tokio::spawn(drain_runtime_logs(logs_rx));

    Ok((Arc::new(orchestrator), drain_handle))
}

/// Forward container output of every background stream to the host log
pub async fn drain_runtime_logs(mut logs_rx: mpsc::UnboundedReceiver<RuntimeLogLine>) {
    while let Some(entry) = logs_rx.recv().await {
        info!(target: "dockyard::container", project = %entry.project_id, "{}", entry.line);
    }
}

// ================================= SHUTDOWN ===================================== //

async fn shutdown(
    orchestrator: Arc<Orchestrator>,
    drain_handle: JoinHandle<()>,
    options: &AppOptions,
) -> Result<(), DockyardError> {
    info!("Shutting down Dockyard...");
    orchestrator.shutdown();

    // The drain ends once the orchestrator and every stream task have
    // released their senders
    drop(orchestrator);
    match tokio::time::timeout(options.max_shutdown_delay, drain_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Runtime log drain failed: {}", e);
            return Err(DockyardError::Internal(e.to_string()));
        }
        Err(_) => warn!(
            "Runtime log drain still busy after {:?}, exiting anyway",
            options.max_shutdown_delay
        ),
    }

    info!("Shutdown complete");
    Ok(())
}
