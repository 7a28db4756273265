//! HTTP health verification of freshly started containers

use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::DockyardError;

/// Upper bound for a single probe request
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check settings
#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    /// Host the published port is reachable on
    pub host: String,

    /// Path requested on every probe
    pub path: String,

    /// Delay between probes
    pub interval: Duration,

    /// Wall-clock budget for the whole check
    pub timeout: Duration,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            path: "/".to_string(),
            interval: Duration::from_millis(500),
            timeout: Duration::from_millis(15_000),
        }
    }
}

impl HealthCheckOptions {
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    fn url(&self, port: u16) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, port, path)
    }
}

/// Polls a port over HTTP until the application answers
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Result<Self, DockyardError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Poll `port` until a response with a status below 500 arrives or the
    /// timeout elapses. Client errors count as healthy: the application is
    /// up and answering.
    pub async fn wait_until_healthy(&self, port: u16, options: &HealthCheckOptions) -> bool {
        let url = options.url(port);
        let deadline = Instant::now() + options.timeout;
        let mut attempts: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!("Health check for {} timed out after {} attempts", url, attempts);
                return false;
            }

            attempts += 1;
            let probe = self
                .client
                .get(&url)
                .timeout(remaining.min(MAX_PROBE_TIMEOUT))
                .send()
                .await;

            match probe {
                Ok(response) if response.status().as_u16() < 500 => {
                    info!("Health check for {} passed ({})", url, response.status());
                    return true;
                }
                Ok(response) => {
                    debug!("Health check for {} returned {}", url, response.status());
                }
                Err(e) => {
                    debug!("Health check for {} failed: {}", url, e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(options.interval.min(remaining)).await;
        }
    }
}
