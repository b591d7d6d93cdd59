//! The run driver: startup, tests, teardown, classification
//!
//! The supervisor owns both managed processes for the whole run. The
//! watchdog races the pipeline; if it fires, the pipeline future is dropped
//! wherever it was suspended and every process is killed.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{E2eError, E2eResult, EXIT_FAILURE, EXIT_SUCCESS, EXIT_WATCHDOG};
use crate::health::HealthPoller;
use crate::ports::PortReclaimer;
use crate::process::{ManagedProcess, ProcessLauncher, ProcessRegistry, ProcessState, Role};
use crate::requirements::RequirementSet;
use crate::runner::{SuiteReport, TestRunner};
use crate::steps::{StepContext, TestStep};
use crate::watchdog::{DisarmOutcome, Watchdog};

/// Marker logged when the deadline fires
pub const WATCHDOG_MARKER: &str = "WATCHDOG TIMEOUT";

/// Final classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Passed => EXIT_SUCCESS,
            RunOutcome::Failed => EXIT_FAILURE,
            RunOutcome::TimedOut => EXIT_WATCHDOG,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub role: Role,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub state: ProcessState,
}

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the watchdog preempted the pipeline
    pub suite: Option<SuiteReport>,
    pub processes: Vec<ProcessSummary>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Write the report as pretty JSON
    pub fn write_json(&self, path: &Path) -> E2eResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Results written to: {}", path.display());
        Ok(())
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    launcher: ProcessLauncher,
    poller: HealthPoller,
    reclaimer: PortReclaimer,
    backend: Option<ManagedProcess>,
    frontend: Option<ManagedProcess>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> E2eResult<Self> {
        config.validate()?;

        let registry = ProcessRegistry::new();
        let launcher = ProcessLauncher::new((&config.drain).into(), registry.clone());

        Ok(Self {
            config,
            registry,
            launcher,
            poller: HealthPoller::new()?,
            reclaimer: PortReclaimer::new(),
            backend: None,
            frontend: None,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn process(&self, role: Role) -> Option<&ManagedProcess> {
        match role {
            Role::Backend => self.backend.as_ref(),
            Role::Frontend => self.frontend.as_ref(),
        }
    }

    /// Run the whole pipeline, teardown included, under the watchdog.
    pub async fn run(&mut self, steps: Vec<TestStep>, requirements: &RequirementSet) -> RunReport {
        let started_at = Utc::now();
        let deadline = self.config.watchdog_deadline();
        let hard_exit = self.config.watchdog.hard_exit_grace_ms.map(Duration::from_millis);

        let watchdog = Watchdog::arm(
            deadline,
            expiry_action(self.registry.clone(), deadline, hard_exit),
        );
        let expired = watchdog.expired();
        let runner = TestRunner::new(steps);

        let suite = tokio::select! {
            biased;
            _ = expired.cancelled() => None,
            suite = self.pipeline(&runner, requirements) => Some(suite),
        };

        // Teardown still runs under the deadline
        if suite.is_none() {
            self.force_kill_all().await;
        } else {
            self.teardown().await;
        }

        let fired = watchdog.disarm() == DisarmOutcome::AlreadyFired;
        if fired {
            // The expiry action may have killed processes mid-teardown
            self.force_kill_all().await;
        }

        let (outcome, error) = match &suite {
            _ if fired => (
                RunOutcome::TimedOut,
                Some(E2eError::WatchdogTimeout { seconds: deadline.as_secs() }.to_string()),
            ),
            None => (RunOutcome::TimedOut, None),
            Some(report) if report.success() => (RunOutcome::Passed, None),
            Some(report) => (
                RunOutcome::Failed,
                report
                    .aborted
                    .clone()
                    .or_else(|| report.coverage_gap().map(|gap| gap.to_string())),
            ),
        };

        if let Some(report) = &suite {
            report.log_summary();
        }
        match outcome {
            RunOutcome::Passed => info!("All tests passed successfully!"),
            RunOutcome::Failed => error!("Some tests failed."),
            RunOutcome::TimedOut => error!("{}: run aborted by watchdog", WATCHDOG_MARKER),
        }

        RunReport {
            outcome,
            exit_code: outcome.exit_code(),
            started_at,
            finished_at: Utc::now(),
            suite,
            processes: self.process_summaries(),
            error,
        }
    }

    async fn pipeline(&mut self, runner: &TestRunner, requirements: &RequirementSet) -> SuiteReport {
        if let Err(e) = self.startup().await {
            error!("Startup failed: {}", e);
            return SuiteReport::aborted(&e, requirements);
        }

        let ctx = match StepContext::new(
            self.config.backend.base_url(),
            self.config.frontend.base_url(),
            self.config.step_timeout(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Could not build HTTP client: {}", e);
                return SuiteReport::aborted(&e, requirements);
            }
        };

        let report = runner.run(&ctx, requirements).await;
        if report.failed > 0 {
            if let Some(backend) = &self.backend {
                log_output_tail(backend);
            }
        }
        report
    }

    /// Reclaim ports, then bring up the backend and the frontend in order.
    async fn startup(&mut self) -> E2eResult<()> {
        if self.config.ports.reclaim {
            let killed = self.reclaimer.free(&self.config.service_ports()).await;
            if !killed.is_empty() {
                let settle = self.config.port_settle();
                info!(
                    "Reclaimed {} port binding(s), waiting {:?} for ports to settle",
                    killed.len(),
                    settle
                );
                tokio::time::sleep(settle).await;
            }
        }

        self.start_service(Role::Backend).await?;
        self.start_service(Role::Frontend).await?;
        Ok(())
    }

    async fn start_service(&mut self, role: Role) -> E2eResult<()> {
        let grace = self.config.teardown_grace();
        let service = match role {
            Role::Backend => &self.config.backend,
            Role::Frontend => &self.config.frontend,
        };
        let launch = service.launch_spec(role, &self.config.project_root);
        let health = service.health_spec();

        let slot = match role {
            Role::Backend => &mut self.backend,
            Role::Frontend => &mut self.frontend,
        };

        // One live process per role
        if let Some(previous) = slot.as_mut() {
            if let Err(e) = previous.terminate(grace).await {
                warn!("Could not stop previous {} process: {}", role, e);
            }
        }

        let process = slot.insert(self.launcher.start(&launch)?);

        match self.poller.wait_ready(process, &health).await {
            Ok(ready) => {
                info!(
                    "{} ready at {} ({} attempt(s))",
                    role,
                    ready.ready_at.to_rfc3339(),
                    ready.attempts
                );
                Ok(())
            }
            Err(e) => {
                error!("{} failed to start: {}", role, e);
                log_output_tail(process);
                Err(e)
            }
        }
    }

    /// Terminate every managed process and wait for it. Idempotent.
    pub async fn teardown(&mut self) {
        let grace = self.config.teardown_grace();
        for process in [self.frontend.as_mut(), self.backend.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = process.terminate(grace).await {
                warn!("Teardown of {} process failed: {}", process.role(), e);
            }
        }
    }

    /// Kill every managed process without a graceful phase. Idempotent.
    pub async fn force_kill_all(&mut self) {
        self.registry.kill_all();
        for process in [self.frontend.as_mut(), self.backend.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = process.force_kill().await {
                warn!("Force kill of {} process failed: {}", process.role(), e);
            }
        }
    }

    fn process_summaries(&self) -> Vec<ProcessSummary> {
        [self.backend.as_ref(), self.frontend.as_ref()]
            .into_iter()
            .flatten()
            .map(|p| ProcessSummary {
                role: p.role(),
                pid: p.pid(),
                started_at: p.started_at(),
                state: p.state(),
            })
            .collect()
    }
}

/// Deadline action: log the marker, kill every registered process tree and,
/// if configured, exit the process should the driver fail to wind down.
fn expiry_action(
    registry: ProcessRegistry,
    deadline: Duration,
    hard_exit: Option<Duration>,
) -> impl FnOnce() + Send + 'static {
    move || {
        error!(
            "{}: run exceeded {}s deadline, force-killing managed processes",
            WATCHDOG_MARKER,
            deadline.as_secs()
        );
        let killed = registry.kill_all();
        error!("Watchdog killed {} process tree(s)", killed);

        if let Some(grace) = hard_exit {
            std::thread::spawn(move || {
                std::thread::sleep(grace);
                eprintln!("{}: driver did not stop within {:?}, exiting", WATCHDOG_MARKER, grace);
                std::process::exit(EXIT_WATCHDOG);
            });
        }
    }
}

fn log_output_tail(process: &ManagedProcess) {
    let lines = process.recent_output();
    if lines.is_empty() {
        warn!("{} produced no output", process.role());
        return;
    }
    warn!("--- {} output (last {} lines) ---", process.role(), lines.len());
    for line in lines {
        warn!("{} | {}", process.role(), line);
    }
    warn!("---");
}
