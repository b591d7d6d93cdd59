//! Health polling of collaborator HTTP endpoints

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::process::ManagedProcess;

/// Condition on a response body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyPredicate {
    /// Any body is accepted
    #[default]
    Any,

    /// Body contains the given text
    Contains { text: String },

    /// Body is JSON and the value at `pointer` equals `value`
    JsonEquals {
        pointer: String,
        value: serde_json::Value,
    },

    /// Body matches the regular expression
    Matches { pattern: String },
}

impl BodyPredicate {
    pub fn matches(&self, body: &str) -> bool {
        match self {
            BodyPredicate::Any => true,
            BodyPredicate::Contains { text } => body.contains(text.as_str()),
            BodyPredicate::JsonEquals { pointer, value } => {
                serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|json| json.pointer(pointer).cloned())
                    .map(|found| &found == value)
                    .unwrap_or(false)
            }
            BodyPredicate::Matches { pattern } => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(body),
                Err(e) => {
                    warn!("Invalid body pattern {:?}: {}", pattern, e);
                    false
                }
            },
        }
    }
}

/// What "ready" means for one endpoint, and how long to wait for it
#[derive(Debug, Clone)]
pub struct HealthCheckSpec {
    pub url: String,
    pub expected_status: u16,
    pub body: BodyPredicate,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub max_wait: Duration,
    pub max_attempts: u32,
}

/// Successful health check
#[derive(Debug, Clone, Serialize)]
pub struct ReadyReport {
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub ready_at: DateTime<Utc>,
}

/// Outcome of a single probe
enum Probe {
    Ready,
    NotReady(String),
}

#[derive(Debug, Clone)]
pub struct HealthPoller {
    client: reqwest::Client,
}

impl HealthPoller {
    pub fn new() -> E2eResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    /// Poll `spec.url` until it reports ready, the process dies, or the
    /// budget (`max_wait` or `max_attempts`, whichever comes first) runs out.
    pub async fn wait_ready(
        &self,
        process: &mut ManagedProcess,
        spec: &HealthCheckSpec,
    ) -> E2eResult<ReadyReport> {
        let role = process.role();
        let start = Instant::now();
        let deadline = start + spec.max_wait;
        let mut attempts = 0;

        info!("Waiting for {} to become ready at {}", role, spec.url);

        loop {
            let state = process.refresh_state();
            if !state.is_running() {
                return Err(E2eError::ProcessDied {
                    role,
                    status: state.to_string(),
                });
            }

            let now = Instant::now();
            if attempts >= spec.max_attempts || now >= deadline {
                return Err(E2eError::HealthCheckTimeout {
                    role,
                    url: spec.url.clone(),
                    attempts,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }

            attempts += 1;
            let probe_timeout = spec.request_timeout.min(deadline - now);

            match timeout(probe_timeout, self.probe(spec)).await {
                Ok(Probe::Ready) => {
                    let elapsed = start.elapsed();
                    info!(
                        "{} is ready after {} attempt(s) ({} ms)",
                        role,
                        attempts,
                        elapsed.as_millis()
                    );
                    return Ok(ReadyReport {
                        attempts,
                        elapsed_ms: elapsed.as_millis() as u64,
                        ready_at: Utc::now(),
                    });
                }
                Ok(Probe::NotReady(reason)) => {
                    debug!("{} not ready (attempt {}): {}", role, attempts, reason);
                }
                Err(_) => {
                    debug!("{} probe timed out after {:?} (attempt {})", role, probe_timeout, attempts);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() && attempts < spec.max_attempts {
                sleep(spec.poll_interval.min(remaining)).await;
            }
        }
    }

    async fn probe(&self, spec: &HealthCheckSpec) -> Probe {
        let resp = match self.client.get(&spec.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                // Connection refused is expected while the service is starting
                if !e.is_connect() {
                    warn!("Health check error: {}", e);
                }
                return Probe::NotReady(e.to_string());
            }
        };

        let status = resp.status().as_u16();
        if status != spec.expected_status {
            return Probe::NotReady(format!(
                "status {} (expected {})",
                status, spec.expected_status
            ));
        }

        match resp.text().await {
            Ok(body) if spec.body.matches(&body) => Probe::Ready,
            Ok(_) => Probe::NotReady("body did not match".to_string()),
            Err(e) => Probe::NotReady(format!("failed to read body: {}", e)),
        }
    }
}
