//! Deployment orchestrator
//!
//! Drives a deploy through PREPARING, BUILDING, STARTING and HEALTH_CHECKING
//! into READY, then prunes old images and attaches the runtime log stream.
//! Any failure before READY tears the new container down again and ends in
//! ROLLED_BACK.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::deploy::builder::ImageBuilder;
use crate::deploy::container::{
    ContainerDescriptor, ContainerLifecycle, ResourceLimits, DEFAULT_STOP_TIMEOUT_SECS,
};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::deploy::health::{HealthCheckOptions, HealthChecker};
use crate::deploy::locks::ProjectLocks;
use crate::deploy::naming::{container_name, LABEL_PROJECT};
use crate::deploy::registry::LogStreamRegistry;
use crate::errors::DockyardError;
use crate::models::deployment::{
    DeployRequest, DeploymentOutcome, LogSeverity, LogSink, RuntimeLogLine,
};
use crate::runtime::{ContainerRuntime, LineCallback, StreamHandle};

/// Images kept per project after a successful deploy
pub const DEFAULT_IMAGE_RETENTION: usize = 3;

/// Log lines captured from a container that failed its health check
pub const DEFAULT_FAILURE_LOG_TAIL: usize = 50;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub limits: ResourceLimits,
    pub stop_timeout_secs: u64,
    pub image_retention: usize,
    pub health_check: HealthCheckOptions,
    pub failure_log_tail: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            image_retention: DEFAULT_IMAGE_RETENTION,
            health_check: HealthCheckOptions::default(),
            failure_log_tail: DEFAULT_FAILURE_LOG_TAIL,
        }
    }
}

/// Entry point for every container operation of the host
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    builder: ImageBuilder,
    containers: ContainerLifecycle,
    health: HealthChecker,
    streams: LogStreamRegistry,
    locks: ProjectLocks,
    options: OrchestratorOptions,
    runtime_logs: mpsc::UnboundedSender<RuntimeLogLine>,
}

impl Orchestrator {
    /// Create an orchestrator. Lines of every background log stream are
    /// delivered to `runtime_logs`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        options: OrchestratorOptions,
        runtime_logs: mpsc::UnboundedSender<RuntimeLogLine>,
    ) -> Result<Self, DockyardError> {
        Ok(Self {
            builder: ImageBuilder::new(runtime.clone()),
            containers: ContainerLifecycle::new(runtime.clone()),
            health: HealthChecker::new()?,
            streams: LogStreamRegistry::new(),
            locks: ProjectLocks::new(),
            runtime,
            options,
            runtime_logs,
        })
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Deploy a build. Progress and build output go to `sink`.
    ///
    /// A second deploy, stop or cleanup of the same project while this one
    /// runs is rejected.
    pub async fn deploy(&self, request: &DeployRequest, sink: &LogSink) -> DeploymentOutcome {
        let Some(_guard) = self.locks.try_acquire(&request.project_id) else {
            let message = DockyardError::Busy(format!(
                "another operation is already in progress for project {}",
                request.project_id
            ))
            .to_string();
            emit(sink, LogSeverity::Error, &message);
            return DeploymentOutcome::failed(message);
        };

        info!(
            "Deploying build {} of project {} ({}) on port {}",
            request.build_id, request.project_id, request.app_type, request.host_port
        );

        let mut fsm = DeploymentFsm::new();
        match self.run_deploy(request, sink, &mut fsm).await {
            Ok(container_id) => {
                emit(
                    sink,
                    LogSeverity::Success,
                    &format!("Deployed on port {}", request.host_port),
                );
                DeploymentOutcome::succeeded(container_id)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(transition) = fsm.process(DeploymentEvent::Failed(message.clone())) {
                    warn!("{}", transition);
                }
                emit(
                    sink,
                    LogSeverity::Error,
                    &format!("Deployment failed ({}): {}", fsm.state(), message),
                );
                DeploymentOutcome::failed(message)
            }
        }
    }

    async fn run_deploy(
        &self,
        request: &DeployRequest,
        sink: &LogSink,
        fsm: &mut DeploymentFsm,
    ) -> Result<String, DockyardError> {
        let project_id = request.project_id.as_str();
        let name = container_name(project_id);
        let internal_port = request.app_type.internal_port();

        // PREPARING
        emit(sink, LogSeverity::Info, &format!("{}: {}", fsm.state(), name));
        self.streams.cancel(project_id);
        if let Some(existing) = self.containers.inspect(&name).await {
            if let Some(owner) = existing.labels.get(LABEL_PROJECT) {
                if owner != project_id {
                    emit(
                        sink,
                        LogSeverity::Warn,
                        &format!(
                            "Container {} belongs to project {} and will be replaced",
                            name, owner
                        ),
                    );
                }
            }
        }
        self.containers
            .stop_and_remove(&name, self.options.stop_timeout_secs)
            .await?;
        self.advance(fsm, DeploymentEvent::Prepared, sink)?;

        // BUILDING
        let artifact = self
            .builder
            .build(
                project_id,
                &request.build_id,
                &request.source_dir,
                request.app_type,
                internal_port,
                sink,
            )
            .await?;
        self.advance(fsm, DeploymentEvent::Built, sink)?;

        // STARTING
        let descriptor = ContainerDescriptor {
            name: name.clone(),
            image: artifact.image,
            project_id: project_id.to_string(),
            build_id: request.build_id.clone(),
            host_port: request.host_port,
            internal_port,
            env: request.env.clone(),
            limits: self.options.limits.clone(),
        };
        let run = match self.containers.run(&descriptor).await {
            Ok(run) => run,
            Err(e) => {
                self.teardown(&name).await;
                return Err(e);
            }
        };
        self.advance(fsm, DeploymentEvent::Started, sink)?;

        // HEALTH_CHECKING
        let health = &self.options.health_check;
        emit(
            sink,
            LogSeverity::Info,
            &format!(
                "Waiting up to {}ms for port {}",
                health.timeout.as_millis(),
                request.host_port
            ),
        );
        if !self.health.wait_until_healthy(request.host_port, health).await {
            self.capture_failure_logs(&name, sink).await;
            self.teardown(&name).await;
            return Err(DockyardError::HealthCheckError(format!(
                "no response on port {} within {}ms",
                request.host_port,
                health.timeout.as_millis()
            )));
        }
        self.advance(fsm, DeploymentEvent::Healthy, sink)?;

        // PRUNING
        self.advance(fsm, DeploymentEvent::Prune, sink)?;
        let pruned = self
            .builder
            .prune_images(project_id, self.options.image_retention)
            .await;
        if pruned > 0 {
            emit(sink, LogSeverity::Info, &format!("Pruned {} old image(s)", pruned));
        }

        // STREAMING
        self.advance(fsm, DeploymentEvent::Stream, sink)?;
        if let Err(e) = self.attach_stream(project_id, &name).await {
            emit(
                sink,
                LogSeverity::Warn,
                &format!("Unable to attach log stream: {}", e),
            );
        }

        Ok(run.container_id)
    }

    fn advance(
        &self,
        fsm: &mut DeploymentFsm,
        event: DeploymentEvent,
        sink: &LogSink,
    ) -> Result<DeploymentState, DockyardError> {
        let state = fsm.process(event).map_err(DockyardError::Internal)?;
        match state {
            DeploymentState::Ready => emit(sink, LogSeverity::Success, "READY: container is healthy"),
            _ => emit(sink, LogSeverity::Info, &state.to_string()),
        }
        Ok(state)
    }

    async fn capture_failure_logs(&self, name: &str, sink: &LogSink) {
        match self.containers.get_logs(name, self.options.failure_log_tail).await {
            Ok(logs) if !logs.trim().is_empty() => {
                emit(
                    sink,
                    LogSeverity::Warn,
                    &format!("Last {} log lines of {}:", self.options.failure_log_tail, name),
                );
                for line in logs.lines() {
                    sink(line, LogSeverity::Warn);
                }
            }
            Ok(_) => emit(sink, LogSeverity::Warn, &format!("{} produced no output", name)),
            Err(e) => emit(
                sink,
                LogSeverity::Warn,
                &format!("Unable to fetch logs of {}: {}", name, e),
            ),
        }
    }

    async fn teardown(&self, name: &str) {
        if let Err(e) = self
            .containers
            .stop_and_remove(name, self.options.stop_timeout_secs)
            .await
        {
            error!("Failed to tear down container {}: {}", name, e);
        }
    }

    /// Follow container `name` into the runtime log channel as the
    /// project's background stream
    async fn attach_stream(&self, project_id: &str, name: &str) -> Result<(), DockyardError> {
        let tx = self.runtime_logs.clone();
        let project = project_id.to_string();
        let on_line: LineCallback = Arc::new(move |line: String| {
            let _ = tx.send(RuntimeLogLine {
                project_id: project.clone(),
                line,
            });
        });

        let handle = self.containers.stream_logs(name, on_line).await?;
        self.streams.replace(project_id, handle);
        info!("Attached log stream of {} for project {}", name, project_id);
        Ok(())
    }

    /// Stop and remove the project's container and cancel its log stream.
    /// Returns `false` on failure or when another operation holds the
    /// project.
    pub async fn stop(&self, project_id: &str) -> bool {
        let Some(_guard) = self.locks.try_acquire(project_id) else {
            warn!("Stop rejected: {}", DockyardError::Busy(project_id.to_string()));
            return false;
        };
        self.stop_locked(project_id).await
    }

    async fn stop_locked(&self, project_id: &str) -> bool {
        self.streams.cancel(project_id);
        let name = container_name(project_id);
        match self
            .containers
            .stop_and_remove(&name, self.options.stop_timeout_secs)
            .await
        {
            Ok(()) => {
                info!("Stopped container {}", name);
                true
            }
            Err(e) => {
                error!("Failed to stop container {}: {}", name, e);
                false
            }
        }
    }

    /// Stop the project and delete the images of `build_ids`. Returns
    /// `false` when another operation holds the project.
    pub async fn cleanup(&self, project_id: &str, build_ids: &[String]) -> bool {
        let Some(_guard) = self.locks.try_acquire(project_id) else {
            warn!("Cleanup rejected: {}", DockyardError::Busy(project_id.to_string()));
            return false;
        };
        self.stop_locked(project_id).await;
        let removed = self.builder.remove_build_images(project_id, build_ids).await;
        info!(
            "Cleaned up project {}: {}/{} image(s) removed",
            project_id,
            removed,
            build_ids.len()
        );
        true
    }

    pub async fn is_running(&self, project_id: &str) -> bool {
        self.containers.is_running(&container_name(project_id)).await
    }

    /// Last `tail` lines of the project's container output, empty when the
    /// container is missing.
    pub async fn get_logs(&self, project_id: &str, tail: usize) -> String {
        match self.containers.get_logs(&container_name(project_id), tail).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Unable to read logs of {}: {}", project_id, e);
                String::new()
            }
        }
    }

    /// Open an independent follow stream on the project's container. The
    /// caller owns the handle and must cancel it.
    pub async fn stream_logs(
        &self,
        project_id: &str,
        on_line: LineCallback,
    ) -> Result<StreamHandle, DockyardError> {
        self.containers
            .stream_logs(&container_name(project_id), on_line)
            .await
    }

    /// Re-attach background log streams for every running managed
    /// container. Returns how many streams were attached.
    pub async fn recover_log_streams(&self) -> usize {
        let managed = match self.containers.list_managed().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!("Unable to list managed containers: {}", e);
                return 0;
            }
        };

        let mut attached = 0;
        for container in managed {
            if container.project_id.is_empty() {
                continue;
            }
            match self.attach_stream(&container.project_id, &container.name).await {
                Ok(()) => attached += 1,
                Err(e) => warn!(
                    "Unable to recover log stream for {}: {}",
                    container.name, e
                ),
            }
        }
        info!("Recovered {} log stream(s)", attached);
        attached
    }

    /// One-off health check, `timeout` overriding the configured one
    pub async fn health_check(&self, port: u16, timeout: Option<Duration>) -> bool {
        let options = match timeout {
            Some(timeout) => self.options.health_check.with_timeout(timeout),
            None => self.options.health_check.clone(),
        };
        self.health.wait_until_healthy(port, &options).await
    }

    pub async fn runtime_available(&self) -> bool {
        self.runtime.is_available().await
    }

    pub fn has_log_stream(&self, project_id: &str) -> bool {
        self.streams.contains(project_id)
    }

    /// Cancel every background log stream. Returns how many were active.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.streams.cancel_all();
        info!("Cancelled {} log stream(s)", cancelled);
        cancelled
    }
}

fn emit(sink: &LogSink, severity: LogSeverity, message: &str) {
    match severity {
        LogSeverity::Error => error!("{}", message),
        LogSeverity::Warn => warn!("{}", message),
        _ => info!("{}", message),
    }
    sink(message, severity);
}
