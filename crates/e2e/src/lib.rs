//! Pick/Ban Integration Test Supervisor
//!
//! This crate boots the backend and frontend collaborators, waits for them to
//! become healthy, runs ordered assertion steps against them, and tears
//! everything down deterministically:
//! - Reclaims the fixed service ports before launch
//! - Spawns each service with captured, continuously drained output
//! - Health-polls each service with a bounded retry budget
//! - Races the whole run against a watchdog deadline
//! - Checks executed steps against a declared requirement set
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Supervisor (sequential driver)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PortReclaimer::free(ports)                                 │
//! │  ProcessLauncher::start(backend)  ──► OutputDrain (task)    │
//! │  HealthPoller::wait_ready(backend)                          │
//! │  ProcessLauncher::start(frontend) ──► OutputDrain (task)    │
//! │  HealthPoller::wait_ready(frontend)                         │
//! │  TestRunner::run(steps) ──► SuiteReport + coverage          │
//! │  teardown()  (always)                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Watchdog (timer task, races everything above)              │
//! │    └── on expiry: kill all process trees, exit code 2       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SessionLog: console + flushed per-run file, retention 10   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod drain;
pub mod error;
pub mod health;
pub mod ports;
pub mod process;
pub mod requirements;
pub mod runner;
pub mod session_log;
pub mod steps;
pub mod supervisor;
pub mod watchdog;

pub use config::SupervisorConfig;
pub use error::{E2eError, E2eResult};
pub use requirements::RequirementSet;
pub use runner::{SuiteReport, TestRunner};
pub use steps::{Check, StepContext, TestStep};
pub use supervisor::{RunOutcome, RunReport, Supervisor};
