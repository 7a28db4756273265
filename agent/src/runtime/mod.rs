//! Container runtime bridge
//!
//! Everything Dockyard asks of the container engine goes through the
//! [`ContainerRuntime`] trait as a plain argument vector. The image builder
//! and container lifecycle layers never touch processes directly, so the CLI
//! bridge in [`cli`] can be replaced by a native engine client (or an
//! in-memory fake in tests) without changing them.

pub mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::DockyardError;

/// Callback receiving output lines as they arrive
pub type LineCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Exit code reported when the runtime process could not be spawned
pub const SPAWN_FAILURE_CODE: i32 = -1;

/// Result of a runtime command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code, [`SPAWN_FAILURE_CODE`] when it never ran or was
    /// terminated by a signal
    pub code: i32,

    /// Buffered stdout (empty for streamed commands)
    pub stdout: String,

    /// Buffered stderr, or the trailing stderr lines for streamed commands
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and error text
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Best description of what went wrong
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.code)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Handle to a long-running output stream (e.g. a log follower).
///
/// Cancelling sends a termination request to the underlying process. A few
/// buffered lines may still be delivered afterwards. Dropping the handle
/// without cancelling has the same effect.
#[derive(Debug)]
pub struct StreamHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Wrap a pump task that terminates its process once `cancel_tx` fires
    /// or is dropped
    pub fn new(cancel_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            cancel_tx: Some(cancel_tx),
            task,
        }
    }

    /// Request termination of the stream
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the stream process has exited and its output is drained
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the stream has fully terminated
    pub async fn closed(self) {
        let Self { cancel_tx, task } = self;
        // keep the sender alive so waiting does not itself cancel the stream
        let _cancel_tx = cancel_tx;
        let _ = task.await;
    }
}

/// Narrow interface to the external container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a short command and buffer its output
    async fn exec(&self, args: &[String]) -> CommandOutput;

    /// Run a command, forwarding stdout and stderr lines to `on_line` as
    /// they arrive. The returned output carries the exit code and the last
    /// stderr lines.
    async fn exec_streaming(&self, args: &[String], on_line: LineCallback) -> CommandOutput;

    /// Start a long-running command whose output is forwarded to `on_line`
    /// until the returned handle is cancelled or the process exits
    async fn follow(&self, args: &[String], on_line: LineCallback)
        -> Result<StreamHandle, DockyardError>;

    /// Check whether the runtime is installed and answering
    async fn is_available(&self) -> bool {
        let output = self.exec(&["version".to_string()]).await;
        output.success() && !output.stdout.trim().is_empty()
    }
}

/// Turn a list of string slices into an owned argument vector
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
