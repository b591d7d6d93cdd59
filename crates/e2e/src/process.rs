//! Launching and owning collaborator processes

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::drain::{DrainConfig, OutputDrain};
use crate::error::{E2eError, E2eResult};

/// Which collaborator a process plays in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Backend,
    Frontend,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ProcessState {
    Running,
    /// Exited on its own. `code` is `None` when a signal ended it.
    Exited { code: Option<i32> },
    /// Terminated by the supervisor
    Killed,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => f.write_str("running"),
            ProcessState::Exited { code: Some(code) } => write!(f, "exit code {}", code),
            ProcessState::Exited { code: None } => f.write_str("terminated by signal"),
            ProcessState::Killed => f.write_str("killed"),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    live: HashMap<Role, u32>,
    /// Signalled by `kill_all` but not yet reaped by their handle
    killed: HashSet<u32>,
}

/// Pids of live managed processes, shared with the watchdog so it can kill
/// them without borrowing the handles the driver owns.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, role: Role, pid: u32) {
        if let Some(previous) = self.inner.lock().live.insert(role, pid) {
            warn!("Replacing registered {} pid {} with {}", role, previous, pid);
        }
    }

    fn unregister(&self, role: Role, pid: u32) {
        let mut inner = self.inner.lock();
        if inner.live.get(&role) == Some(&pid) {
            inner.live.remove(&role);
        }
    }

    /// Whether `kill_all` signalled `pid`. Clears the mark.
    fn take_killed(&self, pid: u32) -> bool {
        self.inner.lock().killed.remove(&pid)
    }

    pub fn pid(&self, role: Role) -> Option<u32> {
        self.inner.lock().live.get(&role).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().live.is_empty()
    }

    /// SIGKILL every registered process group. Safe to call from any thread.
    /// Returns how many processes were signalled.
    pub fn kill_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let pids: Vec<(Role, u32)> = inner.live.iter().map(|(r, p)| (*r, *p)).collect();
        let mut killed = 0;
        for (role, pid) in pids {
            warn!("Force killing {} process tree (pid: {})", role, pid);
            if signal_tree(pid, Signal::Kill) {
                inner.killed.insert(pid);
                killed += 1;
            }
        }
        killed
    }
}

/// What to start for one role
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: Role,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns managed processes with captured output
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    drain: DrainConfig,
    registry: ProcessRegistry,
}

impl ProcessLauncher {
    pub fn new(drain: DrainConfig, registry: ProcessRegistry) -> Self {
        Self { drain, registry }
    }

    /// Spawn the process and start draining its output right away.
    pub fn start(&self, spec: &LaunchSpec) -> E2eResult<ManagedProcess> {
        info!(
            "Starting {} process: {} (cwd: {})",
            spec.role,
            spec.command_line(),
            spec.workdir.display()
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| E2eError::ProcessSpawn {
            role: spec.role,
            program: spec.program.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| E2eError::ProcessDied {
            role: spec.role,
            status: "exited before a pid was observed".to_string(),
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(E2eError::ProcessSpawn {
                    role: spec.role,
                    program: spec.program.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "output pipes were not captured",
                    ),
                })
            }
        };
        let output = OutputDrain::start(spec.role, stdout, stderr, self.drain);

        self.registry.register(spec.role, pid);
        info!("{} process started (pid: {})", spec.role, pid);

        Ok(ManagedProcess {
            role: spec.role,
            child,
            pid,
            started_at: Utc::now(),
            state: ProcessState::Running,
            output,
            registry: self.registry.clone(),
        })
    }
}

/// Handle to a running collaborator, owned by the supervisor
pub struct ManagedProcess {
    role: Role,
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    state: ProcessState,
    output: OutputDrain,
    registry: ProcessRegistry,
}

impl ManagedProcess {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last known state, without polling the OS
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Recent output lines, oldest first
    pub fn recent_output(&self) -> Vec<String> {
        self.output.recent()
    }

    /// Poll the OS for an exit without blocking.
    pub fn refresh_state(&mut self) -> ProcessState {
        if self.state.is_running() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    // A mark on a process that exited with a code is stale
                    let killed = self.registry.take_killed(self.pid);
                    self.state = if killed && status.code().is_none() {
                        ProcessState::Killed
                    } else {
                        ProcessState::Exited { code: status.code() }
                    };
                    self.registry.unregister(self.role, self.pid);
                    debug!("{} process exited: {}", self.role, self.state);
                }
                Ok(None) => {}
                Err(e) => warn!("Could not poll {} process: {}", self.role, e),
            }
        }
        self.state
    }

    /// Ask the process tree to stop, escalating to SIGKILL after `grace`.
    /// Idempotent: an already-stopped process just has its output drained.
    pub async fn terminate(&mut self, grace: Duration) -> E2eResult<ProcessState> {
        if !self.refresh_state().is_running() {
            self.output.finish(grace).await;
            return Ok(self.state);
        }

        info!("Stopping {} process (pid: {})", self.role, self.pid);
        signal_tree(self.pid, Signal::Term);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} process stopped: {}", self.role, status);
                self.state = ProcessState::Killed;
            }
            Ok(Err(e)) => {
                self.registry.unregister(self.role, self.pid);
                return Err(e.into());
            }
            Err(_) => {
                warn!("{} process ignored SIGTERM for {:?}, killing", self.role, grace);
                self.kill_and_reap().await?;
            }
        }

        self.registry.unregister(self.role, self.pid);
        self.output.finish(grace).await;
        info!("{} process stopped", self.role);
        Ok(self.state)
    }

    /// Kill the process tree with no graceful phase. Idempotent.
    pub async fn force_kill(&mut self) -> E2eResult<ProcessState> {
        if self.refresh_state().is_running() {
            signal_tree(self.pid, Signal::Kill);
            self.kill_and_reap().await?;
            self.registry.unregister(self.role, self.pid);
        }
        self.output.cancel();
        Ok(self.state)
    }

    async fn kill_and_reap(&mut self) -> E2eResult<()> {
        // Ignore the error: the group signal may already have reaped it
        let _ = self.child.start_kill();
        self.child.wait().await?;
        self.registry.take_killed(self.pid);
        self.state = ProcessState::Killed;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`. Returns false if nothing was signalled.
#[cfg(unix)]
fn signal_tree(pid: u32, signal: Signal) -> bool {
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {:?} to process group {}: {}", sig, pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_tree(pid: u32, _signal: Signal) -> bool {
    // No process groups here; callers fall back to Child::start_kill
    debug!("Process tree signalling unsupported on this platform (pid: {})", pid);
    false
}
