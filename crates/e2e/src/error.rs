//! Error types for the integration supervisor

use thiserror::Error;

use crate::process::Role;

/// All steps passed and every declared requirement was exercised.
pub const EXIT_SUCCESS: i32 = 0;

/// A step failed, coverage was incomplete, or startup aborted the run.
pub const EXIT_FAILURE: i32 = 1;

/// The whole-run watchdog deadline expired.
pub const EXIT_WATCHDOG: i32 = 2;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Failed to spawn {role} process `{program}`: {source}")]
    ProcessSpawn {
        role: Role,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} process exited before becoming healthy ({status})")]
    ProcessDied { role: Role, status: String },

    #[error("{role} health check at {url} failed after {attempts} attempts in {elapsed_ms} ms")]
    HealthCheckTimeout {
        role: Role,
        url: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Requirements never exercised: {}", missing.join(", "))]
    CoverageGap { missing: Vec<String> },

    #[error("Watchdog deadline of {seconds}s exceeded")]
    WatchdogTimeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Startup and deadline errors end the run; the rest are recorded per step.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProcessSpawn { .. }
                | Self::ProcessDied { .. }
                | Self::HealthCheckTimeout { .. }
                | Self::WatchdogTimeout { .. }
                | Self::InvalidConfig(_)
                | Self::Logging(_)
        )
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WatchdogTimeout { .. } => EXIT_WATCHDOG,
            _ => EXIT_FAILURE,
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
