//! Runtime bridge backed by the container engine's command line

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::DockyardError;
use crate::runtime::{CommandOutput, ContainerRuntime, LineCallback, StreamHandle, SPAWN_FAILURE_CODE};

/// Number of trailing stderr lines kept from a streamed command
const STDERR_TAIL_LINES: usize = 20;

/// Binary used when none is configured
pub const DEFAULT_BINARY: &str = "docker";

/// Executes runtime commands through a CLI binary (`docker` by default)
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn_piped(&self, args: &[String]) -> std::io::Result<Child> {
        self.command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn spawn_error(&self, err: &std::io::Error) -> String {
        format!("Failed to run {}: {}", self.binary, err)
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn exec(&self, args: &[String]) -> CommandOutput {
        debug!("exec: {} {}", self.binary, args.join(" "));

        match self.command(args).output().await {
            Ok(output) => CommandOutput {
                code: output.status.code().unwrap_or(SPAWN_FAILURE_CODE),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => CommandOutput::failed(SPAWN_FAILURE_CODE, self.spawn_error(&e)),
        }
    }

    async fn exec_streaming(&self, args: &[String], on_line: LineCallback) -> CommandOutput {
        debug!("exec (streaming): {} {}", self.binary, args.join(" "));

        let mut child = match self.spawn_piped(args) {
            Ok(child) => child,
            Err(e) => return CommandOutput::failed(SPAWN_FAILURE_CODE, self.spawn_error(&e)),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, stderr_tail, status) = tokio::join!(
            pump_lines(stdout, &on_line, 0),
            pump_lines(stderr, &on_line, STDERR_TAIL_LINES),
            child.wait(),
        );

        let stderr = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
        match status {
            Ok(status) => CommandOutput {
                code: status.code().unwrap_or(SPAWN_FAILURE_CODE),
                stdout: String::new(),
                stderr,
            },
            Err(e) => CommandOutput::failed(SPAWN_FAILURE_CODE, self.spawn_error(&e)),
        }
    }

    async fn follow(
        &self,
        args: &[String],
        on_line: LineCallback,
    ) -> Result<StreamHandle, DockyardError> {
        debug!("follow: {} {}", self.binary, args.join(" "));

        let mut child = self
            .spawn_piped(args)
            .map_err(|e| DockyardError::RuntimeError(self.spawn_error(&e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let pumps = tokio::spawn(async move {
                tokio::join!(
                    pump_lines(stdout, &on_line, 0),
                    pump_lines(stderr, &on_line, 0),
                );
            });

            tokio::select! {
                status = child.wait() => {
                    debug!("Stream process exited: {:?}", status);
                }
                // fires on explicit cancel and when the handle is dropped
                _ = cancel_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Failed to signal stream process: {}", e);
                    }
                    let _ = child.wait().await;
                }
            }

            let _ = pumps.await;
        });

        Ok(StreamHandle::new(cancel_tx, task))
    }
}

/// Forward every line of `reader` to `on_line`, returning the last `keep`
/// lines
async fn pump_lines<R>(reader: Option<R>, on_line: &LineCallback, keep: usize) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(keep);
    let Some(reader) = reader else {
        return tail;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        on_line(line);
    }
    tail
}
