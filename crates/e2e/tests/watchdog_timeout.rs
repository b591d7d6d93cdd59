//! A frontend that never becomes healthy is cut off by the watchdog.
//!
//! Kept in its own test binary because it installs the global subscriber.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use pickban_e2e::process::{ProcessState, Role};
use pickban_e2e::session_log::SessionLog;
use pickban_e2e::steps::default_suite;
use pickban_e2e::supervisor::WATCHDOG_MARKER;
use pickban_e2e::{RequirementSet, RunOutcome, Supervisor};

#[tokio::test]
async fn stuck_frontend_trips_watchdog() {
    let logs = tempfile::tempdir().unwrap();
    let log = SessionLog::create(logs.path(), 10).unwrap();
    log.install(false).unwrap();

    let names = common::champion_names(171);
    let backend = common::serve(common::backend_router(common::champions_payload(&names, 171))).await;
    let frontend = common::serve(common::unavailable_router()).await;

    let mut config = common::test_config(backend.port, frontend.port, logs.path());
    config.watchdog.deadline_secs = 2;
    config.frontend.health.max_wait_secs = 60;
    config.frontend.health.max_attempts = 10_000;

    let requirements = RequirementSet::load(&common::workspace_requirements()).unwrap();
    let mut supervisor = Supervisor::new(config).unwrap();

    let start = Instant::now();
    let report = supervisor.run(default_suite(), &requirements).await;

    assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(report.exit_code(), 2);
    assert!(report.suite.is_none());

    for role in [Role::Backend, Role::Frontend] {
        let process = supervisor.process(role).unwrap();
        assert_eq!(process.state(), ProcessState::Killed, "{}", role);
    }
    assert!(supervisor.registry().is_empty());

    let transcript = std::fs::read_to_string(log.path()).unwrap();
    assert!(transcript.contains(WATCHDOG_MARKER), "{}", transcript);
    assert!(transcript.contains("backend ready"), "{}", transcript);
}
