//! Reclaiming the fixed service ports before a run

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::E2eResult;

/// A port and the process found listening on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub pid: u32,
}

/// Finds the processes bound to a port
#[async_trait]
pub trait PortOwnerLookup: Send + Sync {
    async fn owners(&self, port: u16) -> E2eResult<Vec<u32>>;
}

/// Looks up listeners with `lsof`
#[derive(Debug, Clone, Default)]
pub struct LsofLookup;

#[async_trait]
impl PortOwnerLookup for LsofLookup {
    async fn owners(&self, port: u16) -> E2eResult<Vec<u32>> {
        let output = match Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("lsof not found, cannot check port {}", port);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        // lsof exits 1 when nothing matches
        Ok(parse_pid_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse one pid per line, ignoring anything that is not a number.
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

pub struct PortReclaimer<L = LsofLookup> {
    lookup: L,
}

impl PortReclaimer<LsofLookup> {
    pub fn new() -> Self {
        Self { lookup: LsofLookup }
    }
}

impl Default for PortReclaimer<LsofLookup> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: PortOwnerLookup> PortReclaimer<L> {
    pub fn with_lookup(lookup: L) -> Self {
        Self { lookup }
    }

    /// Kill every process bound to one of `ports`. Best effort: failures are
    /// logged and skipped. Returns the bindings that were killed.
    ///
    /// Callers still have to wait a settle interval afterwards; the ports
    /// are not re-probed.
    pub async fn free(&self, ports: &BTreeSet<u16>) -> Vec<PortBinding> {
        let own_pid = std::process::id();
        let mut killed = Vec::new();

        for &port in ports {
            let pids = match self.lookup.owners(port).await {
                Ok(pids) => pids,
                Err(e) => {
                    warn!("Could not look up owners of port {}: {}", port, e);
                    continue;
                }
            };

            if pids.is_empty() {
                debug!("Port {} is free", port);
                continue;
            }

            for pid in pids {
                if pid == own_pid {
                    continue;
                }
                let binding = PortBinding { port, pid };
                if kill_owner(binding) {
                    killed.push(binding);
                }
            }
        }

        killed
    }
}

#[cfg(unix)]
fn kill_owner(binding: PortBinding) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(binding.pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            info!("Killed pid {} holding port {}", binding.pid, binding.port);
            true
        }
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => {
            warn!(
                "No permission to kill pid {} holding port {}, skipping",
                binding.pid, binding.port
            );
            false
        }
        Err(e) => {
            warn!("Failed to kill pid {} on port {}: {}", binding.pid, binding.port, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_owner(binding: PortBinding) -> bool {
    warn!(
        "Port reclamation unsupported on this platform (port {}, pid {})",
        binding.port, binding.pid
    );
    false
}
