//! Supervisor configuration

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::drain::DrainConfig;
use crate::error::{E2eError, E2eResult};
use crate::health::{BodyPredicate, HealthCheckSpec};
use crate::process::{LaunchSpec, Role};
use crate::session_log::DEFAULT_RETENTION;

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root the service working directories are relative to
    pub project_root: PathBuf,

    /// Directory for per-run log files
    pub logs_dir: PathBuf,

    /// Number of log files to keep
    pub log_retention: usize,

    /// Echo the transcript to the console
    pub echo_console: bool,

    /// Requirement declaration the run must cover
    pub requirements_path: PathBuf,

    /// HTTP timeout for each test step request
    pub step_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on teardown
    pub teardown_grace_ms: u64,

    pub watchdog: WatchdogConfig,
    pub ports: PortsConfig,
    pub drain: DrainSettings,
    pub backend: ServiceConfig,
    pub frontend: ServiceConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            logs_dir: PathBuf::from("logs"),
            log_retention: DEFAULT_RETENTION,
            echo_console: true,
            requirements_path: PathBuf::from("requirements.yaml"),
            step_timeout_secs: 20,
            teardown_grace_ms: 5000,
            watchdog: WatchdogConfig::default(),
            ports: PortsConfig::default(),
            drain: DrainSettings::default(),
            backend: ServiceConfig::backend(),
            frontend: ServiceConfig::frontend(),
        }
    }
}

/// Whole-run deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub deadline_secs: u64,

    /// After expiry, exit the process outright if the driver has not
    /// finished within this grace. `None` disables the hard exit.
    pub hard_exit_grace_ms: Option<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 180,
            hard_exit_grace_ms: Some(5000),
        }
    }
}

/// Port reclamation before launch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub reclaim: bool,
    pub settle_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            reclaim: true,
            settle_ms: 2000,
        }
    }
}

/// Output drain sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSettings {
    pub channel_capacity: usize,
    pub tail_lines: usize,
}

impl Default for DrainSettings {
    fn default() -> Self {
        let defaults = DrainConfig::default();
        Self {
            channel_capacity: defaults.channel_capacity,
            tail_lines: defaults.tail_lines,
        }
    }
}

impl From<&DrainSettings> for DrainConfig {
    fn from(settings: &DrainSettings) -> Self {
        DrainConfig {
            channel_capacity: settings.channel_capacity,
            tail_lines: settings.tail_lines,
        }
    }
}

/// How to start one collaborator and how to tell it is ready
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the project root
    #[serde(default)]
    pub workdir: PathBuf,

    pub host: String,
    pub port: u16,

    /// Variables that receive the port number
    #[serde(default)]
    pub port_env: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub health: HealthConfig,
}

impl ServiceConfig {
    /// Flask backend started as a module
    pub fn backend() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "backend.app".to_string()],
            workdir: PathBuf::new(),
            host: "127.0.0.1".to_string(),
            port: 5001,
            port_env: vec!["LOL_PICKBAN_PORT".to_string()],
            env: BTreeMap::new(),
            health: HealthConfig {
                path: "/api/data".to_string(),
                body: BodyPredicate::JsonEquals {
                    pointer: "/message".to_string(),
                    value: json!("Hello from Flask!"),
                },
                poll_interval_ms: 1000,
                max_wait_secs: 30,
                max_attempts: 30,
                ..HealthConfig::default()
            },
        }
    }

    /// Vite dev server started through npm
    pub fn frontend() -> Self {
        let npm = if cfg!(windows) { "npm.cmd" } else { "npm" };
        Self {
            program: npm.to_string(),
            args: vec!["start".to_string()],
            workdir: PathBuf::from("frontend"),
            host: "localhost".to_string(),
            port: 3001,
            port_env: vec!["PORT".to_string(), "LOL_PICKBAN_FRONTEND_PORT".to_string()],
            env: BTreeMap::new(),
            health: HealthConfig {
                path: "/".to_string(),
                poll_interval_ms: 2000,
                max_wait_secs: 60,
                max_attempts: 30,
                ..HealthConfig::default()
            },
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn launch_spec(&self, role: Role, project_root: &Path) -> LaunchSpec {
        let mut env: Vec<(String, String)> = self
            .port_env
            .iter()
            .map(|name| (name.clone(), self.port.to_string()))
            .collect();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        LaunchSpec {
            role,
            program: self.program.clone(),
            args: self.args.clone(),
            workdir: project_root.join(&self.workdir),
            env,
        }
    }

    pub fn health_spec(&self) -> HealthCheckSpec {
        HealthCheckSpec {
            url: format!("{}{}", self.base_url(), self.health.path),
            expected_status: self.health.expected_status,
            body: self.health.body.clone(),
            poll_interval: Duration::from_millis(self.health.poll_interval_ms),
            request_timeout: Duration::from_millis(self.health.request_timeout_ms),
            max_wait: Duration::from_secs(self.health.max_wait_secs),
            max_attempts: self.health.max_attempts,
        }
    }
}

/// Readiness probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub path: String,
    pub expected_status: u16,
    pub body: BodyPredicate,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_wait_secs: u64,
    pub max_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            expected_status: 200,
            body: BodyPredicate::Any,
            poll_interval_ms: 1000,
            request_timeout_ms: 2000,
            max_wait_secs: 30,
            max_attempts: 30,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from file, falling back to defaults if it is absent
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> E2eResult<()> {
        for (role, service) in [(Role::Backend, &self.backend), (Role::Frontend, &self.frontend)] {
            if service.port == 0 {
                return Err(invalid(format!("{} port must be non-zero", role)));
            }
            if service.program.trim().is_empty() {
                return Err(invalid(format!("{} program is empty", role)));
            }
            if service.health.max_attempts == 0 {
                return Err(invalid(format!("{} health max_attempts must be positive", role)));
            }
            if service.health.poll_interval_ms == 0 {
                return Err(invalid(format!("{} health poll interval must be positive", role)));
            }
        }
        if self.backend.port == self.frontend.port {
            return Err(invalid(format!(
                "backend and frontend share port {}",
                self.backend.port
            )));
        }
        if self.watchdog.deadline_secs == 0 {
            return Err(invalid("watchdog deadline must be positive".to_string()));
        }
        if self.log_retention == 0 {
            return Err(invalid("log retention must keep at least one file".to_string()));
        }
        Ok(())
    }

    /// Ports owned exclusively by this run
    pub fn service_ports(&self) -> BTreeSet<u16> {
        BTreeSet::from([self.backend.port, self.frontend.port])
    }

    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_secs(self.watchdog.deadline_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn port_settle(&self) -> Duration {
        Duration::from_millis(self.ports.settle_ms)
    }
}

fn invalid(message: String) -> E2eError {
    E2eError::InvalidConfig(message)
}
