//! Fake collaborator services and configuration helpers shared by the
//! integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use pickban_e2e::config::{ServiceConfig, SupervisorConfig};

/// An axum server on an ephemeral port, aborted on drop
pub struct FakeService {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl FakeService {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn serve(router: Router) -> FakeService {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    FakeService { port, handle }
}

/// `count` distinct names, Aatrox first
pub fn champion_names(count: usize) -> Vec<String> {
    std::iter::once("Aatrox".to_string())
        .chain((1..count).map(|i| format!("Champion{:03}", i)))
        .collect()
}

pub fn champions_payload(names: &[String], count: usize) -> Value {
    let champions: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "champion_id": name,
                "name": name,
                "icon_url": format!("https://ddragon.example/img/champion/{}.png", name),
            })
        })
        .collect();
    json!({ "success": true, "champions": champions, "count": count })
}

/// Backend with `/api/data` and `/api/champions`
pub fn backend_router(champions: Value) -> Router {
    Router::new()
        .route(
            "/api/data",
            get(|| async { Json(json!({ "message": "Hello from Flask!" })) }),
        )
        .route(
            "/api/champions",
            get(move || {
                let champions = champions.clone();
                async move { Json(champions) }
            }),
        )
}

/// Frontend serving a fixed page at `/`
pub fn frontend_router(html: String) -> Router {
    Router::new().route(
        "/",
        get(move || {
            let html = html.clone();
            async move { Html(html) }
        }),
    )
}

/// Service that answers 503 to the first `failures` requests, then 200
pub fn flaky_router(failures: usize) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/health",
        get(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
                } else {
                    (StatusCode::OK, "ok").into_response()
                }
            }
        }),
    );
    (router, hits)
}

/// Frontend that never becomes healthy
pub fn unavailable_router() -> Router {
    Router::new().route(
        "/",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "still compiling") }),
    )
}

/// A port nothing listens on
pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Service definition whose process is a plain `sleep`, while the health
/// checks and steps talk to a fake service on `port`.
pub fn sleeper(mut base: ServiceConfig, port: u16) -> ServiceConfig {
    base.program = "sleep".to_string();
    base.args = vec!["30".to_string()];
    base.workdir = PathBuf::new();
    base.host = "127.0.0.1".to_string();
    base.port = port;
    base.health.poll_interval_ms = 50;
    base.health.request_timeout_ms = 500;
    base
}

/// Configuration pointing both services at fake ports, with reclamation and
/// the hard exit disabled
pub fn test_config(backend_port: u16, frontend_port: u16, logs_dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.project_root = std::env::temp_dir();
    config.logs_dir = logs_dir.to_path_buf();
    config.echo_console = false;
    config.ports.reclaim = false;
    config.watchdog.deadline_secs = 30;
    config.watchdog.hard_exit_grace_ms = None;
    config.teardown_grace_ms = 2000;
    config.step_timeout_secs = 5;
    config.backend = sleeper(ServiceConfig::backend(), backend_port);
    config.frontend = sleeper(ServiceConfig::frontend(), frontend_port);
    config
}

/// The requirement file shipped at the workspace root
pub fn workspace_requirements() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../requirements.yaml")
}
