//! Container lifecycle operations

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::deploy::naming::{LABEL_BUILD, LABEL_PROJECT};
use crate::errors::DockyardError;
use crate::runtime::{args, CommandOutput, ContainerRuntime, LineCallback, StreamHandle};

/// Restart policy of every managed container
pub const RESTART_POLICY: &str = "unless-stopped";

/// Default memory ceiling per container
pub const DEFAULT_MEMORY_LIMIT: &str = "512m";

/// Default CPU share per container
pub const DEFAULT_CPU_LIMIT: &str = "0.5";

/// Default grace period before a stopping container is killed
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Resource limits applied to every container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in runtime notation, e.g. `512m`
    pub memory: String,

    /// CPU share, e.g. `0.5`
    pub cpus: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY_LIMIT.to_string(),
            cpus: DEFAULT_CPU_LIMIT.to_string(),
        }
    }
}

/// Everything needed to start a project's container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub project_id: String,
    pub build_id: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
}

impl ContainerDescriptor {
    /// Arguments for a detached `run`
    pub fn run_args(&self) -> Vec<String> {
        let mut run_args = args([
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--memory".to_string(),
            self.limits.memory.clone(),
            "--cpus".to_string(),
            self.limits.cpus.clone(),
            "-p".to_string(),
            format!("{}:{}", self.host_port, self.internal_port),
            "--restart".to_string(),
            RESTART_POLICY.to_string(),
            "--label".to_string(),
            format!("{}={}", LABEL_PROJECT, self.project_id),
            "--label".to_string(),
            format!("{}={}", LABEL_BUILD, self.build_id),
        ]);

        if !self.env.contains_key("PORT") {
            run_args.push("-e".to_string());
            run_args.push(format!("PORT={}", self.internal_port));
        }
        for (key, value) in &self.env {
            run_args.push("-e".to_string());
            run_args.push(format!("{}={}", key, value));
        }

        run_args.push(self.image.clone());
        run_args
    }
}

/// A freshly started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub container_id: String,
}

/// Identifier, lifecycle status and labels of an existing container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// A running container carrying the management labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub name: String,
    pub project_id: String,
    pub build_id: String,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Parse `inspect` output (a JSON array with one entry)
pub fn parse_inspect(output: &str) -> Option<ContainerInfo> {
    let entries: Vec<InspectEntry> = match serde_json::from_str(output) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Unable to parse inspect output: {}", e);
            return None;
        }
    };
    let entry = entries.into_iter().next()?;
    Some(ContainerInfo {
        id: entry.id,
        status: entry.state.status,
        labels: entry
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default(),
    })
}

/// Format of the managed container listing: name, project label, build label
const MANAGED_FORMAT: &str = "{{.Names}}\t{{.Label \"dockyard.project\"}}\t{{.Label \"dockyard.build\"}}";

/// Parse the tab-separated managed container listing
pub fn parse_managed(output: &str) -> Vec<ManagedContainer> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t').map(str::trim);
            let name = fields.next()?;
            let project_id = fields.next()?;
            let build_id = fields.next().unwrap_or_default();
            if name.is_empty() || project_id.is_empty() {
                return None;
            }
            Some(ManagedContainer {
                name: name.to_string(),
                project_id: project_id.to_string(),
                build_id: build_id.to_string(),
            })
        })
        .collect()
}

fn is_not_found(output: &CommandOutput) -> bool {
    output.stderr.to_lowercase().contains("no such container")
}

/// Start/stop/remove/inspect and log access for managed containers
pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Start a detached container
    pub async fn run(&self, descriptor: &ContainerDescriptor) -> Result<RunResult, DockyardError> {
        info!(
            "Starting container {} from {} on port {} -> {}",
            descriptor.name, descriptor.image, descriptor.host_port, descriptor.internal_port
        );

        let output = self.runtime.exec(&descriptor.run_args()).await;
        if !output.success() {
            return Err(DockyardError::ContainerError(output.error_text()));
        }

        let container_id = output.stdout.trim().to_string();
        debug!("Container {} started: {}", descriptor.name, container_id);
        Ok(RunResult { container_id })
    }

    /// Stop a container. Absent or already stopped containers are a no-op.
    pub async fn stop(&self, name: &str, timeout_secs: u64) -> Result<(), DockyardError> {
        let output = self
            .runtime
            .exec(&args(["stop".to_string(), "-t".to_string(), timeout_secs.to_string(), name.to_string()]))
            .await;

        if output.success() || is_not_found(&output) {
            return Ok(());
        }
        Err(DockyardError::ContainerError(output.error_text()))
    }

    /// Remove a container. With `force`, an absent container is a no-op.
    pub async fn remove(&self, name: &str, force: bool) -> Result<(), DockyardError> {
        let mut rm_args = vec!["rm".to_string()];
        if force {
            rm_args.push("-f".to_string());
        }
        rm_args.push(name.to_string());

        let output = self.runtime.exec(&rm_args).await;
        if output.success() || (force && is_not_found(&output)) {
            return Ok(());
        }
        Err(DockyardError::ContainerError(output.error_text()))
    }

    /// Uniform teardown: stop, then force-remove
    pub async fn stop_and_remove(&self, name: &str, timeout_secs: u64) -> Result<(), DockyardError> {
        if let Err(e) = self.stop(name, timeout_secs).await {
            warn!("Failed to stop container {}: {}", name, e);
        }
        self.remove(name, true).await
    }

    /// Inspect a container, `None` when it does not exist
    pub async fn inspect(&self, name: &str) -> Option<ContainerInfo> {
        let output = self
            .runtime
            .exec(&args(["inspect", "--type", "container", name]))
            .await;
        if !output.success() {
            return None;
        }
        parse_inspect(&output.stdout)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.inspect(name)
            .await
            .is_some_and(|info| info.is_running())
    }

    /// Last `tail` lines of a container's stdout and stderr
    pub async fn get_logs(&self, name: &str, tail: usize) -> Result<String, DockyardError> {
        let output = self
            .runtime
            .exec(&args(["logs".to_string(), "--tail".to_string(), tail.to_string(), name.to_string()]))
            .await;
        if !output.success() {
            return Err(DockyardError::ContainerError(output.error_text()));
        }
        Ok(output.combined())
    }

    /// Follow a container's output from now on. Every call opens an
    /// independent stream that its owner must cancel.
    pub async fn stream_logs(
        &self,
        name: &str,
        on_line: LineCallback,
    ) -> Result<StreamHandle, DockyardError> {
        self.runtime
            .follow(&args(["logs", "-f", "--tail", "0", name]), on_line)
            .await
    }

    /// Running containers that carry the management labels
    pub async fn list_managed(&self) -> Result<Vec<ManagedContainer>, DockyardError> {
        let output = self
            .runtime
            .exec(&args([
                "ps".to_string(),
                "--filter".to_string(),
                format!("label={}", LABEL_PROJECT),
                "--format".to_string(),
                MANAGED_FORMAT.to_string(),
            ]))
            .await;
        if !output.success() {
            return Err(DockyardError::RuntimeError(output.error_text()));
        }
        Ok(parse_managed(&output.stdout))
    }
}
