//! Whole-run deadline
//!
//! `Watchdog::arm` starts an independent timer task. If it is not disarmed
//! before the deadline, it runs the expiry action exactly once and trips the
//! `expired` token so the driver can abandon whatever it was doing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ARMED: u8 = 0;
const DISARMED: u8 = 1;
const FIRED: u8 = 2;

/// Result of disarming a watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisarmOutcome {
    /// Disarmed before the deadline; the expiry action will never run
    Disarmed,
    /// The deadline already fired; its outcome overrides normal completion
    AlreadyFired,
}

pub struct Watchdog;

impl Watchdog {
    /// Arm a deadline. `on_expire` runs on the timer task if the deadline
    /// passes before `disarm`. Must be called inside a Tokio runtime.
    pub fn arm<F>(deadline: Duration, on_expire: F) -> WatchdogHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(ARMED));
        let disarmed = CancellationToken::new();
        let expired = CancellationToken::new();

        let task = tokio::spawn({
            let state = state.clone();
            let disarmed = disarmed.clone();
            let expired = expired.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = disarmed.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        if state
                            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            on_expire();
                            expired.cancel();
                        }
                    }
                }
            }
        });

        debug!("Watchdog armed for {:?}", deadline);

        WatchdogHandle {
            deadline,
            state,
            disarmed,
            expired,
            task,
        }
    }
}

pub struct WatchdogHandle {
    deadline: Duration,
    state: Arc<AtomicU8>,
    disarmed: CancellationToken,
    expired: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Whether the expiry action has started
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Token cancelled once the expiry action has completed
    pub fn expired(&self) -> CancellationToken {
        self.expired.clone()
    }

    /// Stop the timer. Once the deadline has fired this reports
    /// `AlreadyFired` and nothing is undone.
    pub fn disarm(self) -> DisarmOutcome {
        match self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.disarmed.cancel();
                debug!("Watchdog disarmed");
                DisarmOutcome::Disarmed
            }
            Err(FIRED) => DisarmOutcome::AlreadyFired,
            Err(_) => DisarmOutcome::Disarmed,
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        // Dropping without disarming keeps the timer alive; only an explicit
        // disarm stops it.
        if self.state.load(Ordering::Acquire) == DISARMED {
            self.task.abort();
        }
    }
}
