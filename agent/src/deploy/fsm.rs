//! Finite state machine for a single deploy attempt

use serde::{Deserialize, Serialize};

/// Deploy stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Tearing down whatever runs for the project
    Preparing,

    /// Building the image
    Building,

    /// Starting the new container
    Starting,

    /// Waiting for the container to answer HTTP
    HealthChecking,

    /// Container verified healthy
    Ready,

    /// Deploy failed, nothing left running
    RolledBack,

    /// Removing images beyond retention
    Pruning,

    /// Log stream attached, deploy complete
    Streaming,
}

impl DeploymentState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::RolledBack | DeploymentState::Streaming)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeploymentState::Preparing => "PREPARING",
            DeploymentState::Building => "BUILDING",
            DeploymentState::Starting => "STARTING",
            DeploymentState::HealthChecking => "HEALTH_CHECKING",
            DeploymentState::Ready => "READY",
            DeploymentState::RolledBack => "ROLLED_BACK",
            DeploymentState::Pruning => "PRUNING",
            DeploymentState::Streaming => "STREAMING",
        };
        f.write_str(name)
    }
}

/// Deploy event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Old container torn down
    Prepared,

    /// Image built
    Built,

    /// Container started
    Started,

    /// Container answered the health check
    Healthy,

    /// Begin pruning old images
    Prune,

    /// Begin streaming runtime logs
    Stream,

    /// The current stage failed
    Failed(String),
}

/// Deploy FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
    history: Vec<DeploymentState>,
}

impl DeploymentFsm {
    /// Create a new FSM in the preparing state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Preparing,
            error: None,
            history: vec![DeploymentState::Preparing],
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[DeploymentState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, String> {
        let new_state = match (self.state, &event) {
            (DeploymentState::Preparing, DeploymentEvent::Prepared) => DeploymentState::Building,
            (DeploymentState::Building, DeploymentEvent::Built) => DeploymentState::Starting,
            (DeploymentState::Starting, DeploymentEvent::Started) => DeploymentState::HealthChecking,
            (DeploymentState::HealthChecking, DeploymentEvent::Healthy) => DeploymentState::Ready,
            (DeploymentState::Ready, DeploymentEvent::Prune) => DeploymentState::Pruning,
            (DeploymentState::Pruning, DeploymentEvent::Stream) => DeploymentState::Streaming,

            // Every stage up to the health check can fail the deploy
            (
                DeploymentState::Preparing
                | DeploymentState::Building
                | DeploymentState::Starting
                | DeploymentState::HealthChecking,
                DeploymentEvent::Failed(err),
            ) => {
                self.error = Some(err.clone());
                DeploymentState::RolledBack
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }

    /// Whether the deploy ended with a healthy container
    pub fn succeeded(&self) -> bool {
        matches!(
            self.state,
            DeploymentState::Ready | DeploymentState::Pruning | DeploymentState::Streaming
        )
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
