//! Deployment models

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::app_type::AppType;

/// Severity attached to every message sent to a [`LogSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
    Success,
}

/// Caller-supplied receiver for deploy progress and build output
pub type LogSink = Arc<dyn Fn(&str, LogSeverity) + Send + Sync>;

/// A deploy request from the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Opaque project key
    pub project_id: String,

    /// Opaque build key
    pub build_id: String,

    /// Source tree to build
    pub source_dir: PathBuf,

    /// Application type hint
    pub app_type: AppType,

    /// Host port the container's internal port is published on
    pub host_port: u16,

    /// Environment passed to the container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Result of one deploy attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentOutcome {
    pub fn succeeded(container_id: impl Into<String>) -> Self {
        Self {
            success: true,
            container_id: Some(container_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            container_id: None,
            error: Some(error.into()),
        }
    }
}

/// A runtime log line from a registry-owned stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLogLine {
    /// Project key the stream belongs to
    pub project_id: String,

    pub line: String,
}
