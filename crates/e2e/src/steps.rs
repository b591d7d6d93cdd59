//! Assertion steps run against the live backend and frontend

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{E2eError, E2eResult};

/// Expected `/api/data` greeting
pub const BACKEND_GREETING: &str = "Hello from Flask!";

/// Champion every champion list must contain
pub const SENTINEL_CHAMPION: &str = "Aatrox";

/// State shared by the steps of one run
pub struct StepContext {
    client: reqwest::Client,
    backend_url: String,
    frontend_url: String,
    champion_names: Mutex<Option<Vec<String>>>,
}

impl StepContext {
    pub fn new(
        backend_url: impl Into<String>,
        frontend_url: impl Into<String>,
        request_timeout: Duration,
    ) -> E2eResult<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            backend_url: backend_url.into(),
            frontend_url: frontend_url.into(),
            champion_names: Mutex::new(None),
        })
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn frontend_url(&self) -> &str {
        &self.frontend_url
    }

    /// GET a URL and return status and body
    pub async fn get(&self, url: &str) -> E2eResult<(u16, String)> {
        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok((status, body))
    }

    /// Champion names recorded by an earlier step
    pub fn champion_names(&self) -> Option<Vec<String>> {
        self.champion_names.lock().clone()
    }

    pub fn set_champion_names(&self, names: Vec<String>) {
        *self.champion_names.lock() = Some(names);
    }
}

/// The executable part of a step. Returns a diagnostic message on success.
#[async_trait]
pub trait Check: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> E2eResult<String>;
}

/// One ordered assertion, tied to the requirement it exercises
pub struct TestStep {
    pub id: String,
    pub description: String,
    pub requirement: String,
    check: Box<dyn Check>,
}

impl TestStep {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        requirement: impl Into<String>,
        check: impl Check + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            requirement: requirement.into(),
            check: Box::new(check),
        }
    }

    pub async fn execute(&self, ctx: &StepContext) -> E2eResult<String> {
        self.check.run(ctx).await
    }
}

impl std::fmt::Debug for TestStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStep")
            .field("id", &self.id)
            .field("requirement", &self.requirement)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Champion {
    pub champion_id: String,
    pub name: String,
    pub icon_url: String,
}

/// `/api/champions` payload
#[derive(Debug, Clone, Deserialize)]
pub struct ChampionsResponse {
    #[serde(default)]
    pub success: bool,
    pub champions: Vec<Champion>,
    pub count: usize,
}

impl ChampionsResponse {
    pub fn names(&self) -> Vec<String> {
        self.champions.iter().map(|c| c.name.clone()).collect()
    }
}

pub fn validate_champions(resp: &ChampionsResponse, expected: &str) -> E2eResult<()> {
    if !resp.success {
        return Err(E2eError::AssertionFailed(
            "champions response reports success = false".to_string(),
        ));
    }
    if resp.champions.is_empty() {
        return Err(E2eError::AssertionFailed("champion list is empty".to_string()));
    }
    if resp.count != resp.champions.len() {
        return Err(E2eError::AssertionFailed(format!(
            "count is {} but {} champions were returned",
            resp.count,
            resp.champions.len()
        )));
    }
    if !resp.champions.iter().any(|c| c.name == expected) {
        return Err(E2eError::AssertionFailed(format!(
            "champion list does not contain {}",
            expected
        )));
    }
    Ok(())
}

/// First champion name that appears literally in the page
pub fn find_rendered_champion<'a>(html: &str, names: &'a [String]) -> Option<&'a str> {
    names
        .iter()
        .map(String::as_str)
        .find(|name| !name.is_empty() && html.contains(name))
}

async fn fetch_champions(ctx: &StepContext) -> E2eResult<ChampionsResponse> {
    let url = format!("{}/api/champions", ctx.backend_url());
    let (status, body) = ctx.get(&url).await?;
    if status != 200 {
        return Err(E2eError::AssertionFailed(format!(
            "champions endpoint failed with status {}: {}",
            status, body
        )));
    }
    serde_json::from_str(&body).map_err(|e| {
        E2eError::AssertionFailed(format!("champions response is malformed: {}", e))
    })
}

/// `GET /api/data` returns the expected greeting
pub struct BackendDataCheck;

#[async_trait]
impl Check for BackendDataCheck {
    async fn run(&self, ctx: &StepContext) -> E2eResult<String> {
        let url = format!("{}/api/data", ctx.backend_url());
        let (status, body) = ctx.get(&url).await?;

        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|json| json.get("message").and_then(|m| m.as_str()).map(String::from));

        if status == 200 && message.as_deref() == Some(BACKEND_GREETING) {
            Ok(format!("{} answered {:?}", url, BACKEND_GREETING))
        } else {
            Err(E2eError::AssertionFailed(format!(
                "backend health check failed. Status: {}, Body: {}",
                status, body
            )))
        }
    }
}

/// `GET /api/champions` returns a consistent list containing a known champion
pub struct ChampionsCheck {
    pub expected: String,
}

impl Default for ChampionsCheck {
    fn default() -> Self {
        Self {
            expected: SENTINEL_CHAMPION.to_string(),
        }
    }
}

#[async_trait]
impl Check for ChampionsCheck {
    async fn run(&self, ctx: &StepContext) -> E2eResult<String> {
        let resp = fetch_champions(ctx).await?;
        validate_champions(&resp, &self.expected)?;
        ctx.set_champion_names(resp.names());
        Ok(format!("{} champions, including {}", resp.count, self.expected))
    }
}

/// `GET /` on the frontend answers 200
pub struct FrontendAccessibleCheck;

#[async_trait]
impl Check for FrontendAccessibleCheck {
    async fn run(&self, ctx: &StepContext) -> E2eResult<String> {
        let (status, _) = ctx.get(ctx.frontend_url()).await?;
        if status == 200 {
            Ok(format!("{} answered 200", ctx.frontend_url()))
        } else {
            Err(E2eError::AssertionFailed(format!(
                "frontend accessibility check failed. Status: {}",
                status
            )))
        }
    }
}

/// The frontend page shows at least one champion the backend knows about
pub struct FrontendChampionsCheck;

#[async_trait]
impl Check for FrontendChampionsCheck {
    async fn run(&self, ctx: &StepContext) -> E2eResult<String> {
        let names = match ctx.champion_names() {
            Some(names) => names,
            None => {
                let names = fetch_champions(ctx).await?.names();
                ctx.set_champion_names(names.clone());
                names
            }
        };

        let (status, html) = ctx.get(ctx.frontend_url()).await?;
        if status != 200 {
            return Err(E2eError::AssertionFailed(format!(
                "frontend returned status {}",
                status
            )));
        }

        match find_rendered_champion(&html, &names) {
            Some(name) => Ok(format!("frontend renders {}", name)),
            None => {
                error!("Frontend HTML without any champion name:\n{}", html);
                Err(E2eError::AssertionFailed(format!(
                    "frontend HTML contains none of the {} backend champion names",
                    names.len()
                )))
            }
        }
    }
}

/// The standard suite, in execution order
pub fn default_suite() -> Vec<TestStep> {
    vec![
        TestStep::new(
            "backend_api_health",
            "Backend /api/data answers with the greeting",
            "REQ-BACKEND-HEALTH",
            BackendDataCheck,
        ),
        TestStep::new(
            "get_champions_api",
            "Backend /api/champions returns a consistent champion list",
            "REQ-CHAMPIONS-API",
            ChampionsCheck::default(),
        ),
        TestStep::new(
            "frontend_accessibility",
            "Frontend root page is reachable",
            "REQ-FRONTEND-AVAILABLE",
            FrontendAccessibleCheck,
        ),
        TestStep::new(
            "frontend_renders_champions",
            "Frontend page shows champions served by the backend",
            "REQ-FRONTEND-CHAMPIONS",
            FrontendChampionsCheck,
        ),
    ]
}
