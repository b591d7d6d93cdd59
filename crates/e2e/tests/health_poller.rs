#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use pickban_e2e::drain::DrainConfig;
use pickban_e2e::health::{BodyPredicate, HealthCheckSpec, HealthPoller};
use pickban_e2e::process::{LaunchSpec, ManagedProcess, ProcessLauncher, ProcessRegistry, Role};
use pickban_e2e::E2eError;

fn launch(script: &str) -> ManagedProcess {
    let launcher = ProcessLauncher::new(DrainConfig::default(), ProcessRegistry::new());
    launcher
        .start(&LaunchSpec {
            role: Role::Backend,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: std::env::temp_dir(),
            env: vec![],
        })
        .unwrap()
}

fn spec(url: String) -> HealthCheckSpec {
    HealthCheckSpec {
        url,
        expected_status: 200,
        body: BodyPredicate::Any,
        poll_interval: Duration::from_millis(50),
        request_timeout: Duration::from_millis(500),
        max_wait: Duration::from_secs(10),
        max_attempts: 100,
    }
}

#[tokio::test]
async fn ready_after_service_warms_up() {
    let (router, hits) = common::flaky_router(2);
    let service = common::serve(router).await;
    let mut process = launch("sleep 30");

    let poller = HealthPoller::new().unwrap();
    let ready = poller
        .wait_ready(&mut process, &spec(format!("{}/health", service.url())))
        .await
        .unwrap();

    assert_eq!(ready.attempts, 3);
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    process.terminate(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn body_predicate_must_match() {
    let (router, _) = common::flaky_router(0);
    let service = common::serve(router).await;
    let mut process = launch("sleep 30");

    let mut spec = spec(format!("{}/health", service.url()));
    spec.body = BodyPredicate::Contains {
        text: "Hello from Flask!".to_string(),
    };
    spec.max_attempts = 3;

    let err = HealthPoller::new()
        .unwrap()
        .wait_ready(&mut process, &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, E2eError::HealthCheckTimeout { attempts: 3, .. }), "{}", err);
    process.terminate(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out_within_max_wait() {
    // Accepts connections (via the backlog) but never answers
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", silent.local_addr().unwrap());
    let mut process = launch("sleep 30");

    let mut spec = spec(url);
    spec.max_wait = Duration::from_secs(1);
    spec.request_timeout = Duration::from_secs(5);

    let start = Instant::now();
    let err = HealthPoller::new()
        .unwrap()
        .wait_ready(&mut process, &spec)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, E2eError::HealthCheckTimeout { .. }), "{}", err);
    assert!(
        elapsed < spec.max_wait + Duration::from_millis(250),
        "timed out late: {:?}",
        elapsed
    );
    process.terminate(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn attempt_budget_stops_before_max_wait() {
    let url = format!("http://127.0.0.1:{}/", common::unused_port());
    let mut process = launch("sleep 30");

    let mut spec = spec(url);
    spec.max_attempts = 3;
    spec.max_wait = Duration::from_secs(30);

    let start = Instant::now();
    let err = HealthPoller::new()
        .unwrap()
        .wait_ready(&mut process, &spec)
        .await
        .unwrap_err();

    match err {
        E2eError::HealthCheckTimeout { attempts, role, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(role, Role::Backend);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    process.terminate(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn process_death_is_reported_within_one_interval() {
    let url = format!("http://127.0.0.1:{}/", common::unused_port());
    let mut process = launch("sleep 0.3; exit 7");

    let mut spec = spec(url);
    spec.poll_interval = Duration::from_millis(200);
    spec.max_wait = Duration::from_secs(30);

    let start = Instant::now();
    let err = HealthPoller::new()
        .unwrap()
        .wait_ready(&mut process, &spec)
        .await
        .unwrap_err();

    match err {
        E2eError::ProcessDied { role, status } => {
            assert_eq!(role, Role::Backend);
            assert_eq!(status, "exit code 7");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(
        start.elapsed() < Duration::from_millis(300 + 200 + 500),
        "death noticed late: {:?}",
        start.elapsed()
    );

    // Already exited: teardown is a no-op
    process.terminate(Duration::from_secs(2)).await.unwrap();
    process.terminate(Duration::from_secs(2)).await.unwrap();
}
