//! Ordered execution of test steps and requirement coverage

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::E2eError;
use crate::requirements::RequirementSet;
use crate::steps::{StepContext, TestStep};

/// Result of running a single step
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub step_id: String,
    pub requirement: String,
    pub passed: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Aggregate of all steps plus requirement coverage
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
    pub covered: BTreeSet<String>,
    pub missing: Vec<String>,
    /// Startup error that prevented any step from running
    pub aborted: Option<String>,
}

impl SuiteReport {
    fn from_results(
        results: Vec<TestResult>,
        requirements: &RequirementSet,
        duration_ms: u64,
        aborted: Option<String>,
    ) -> Self {
        let covered: BTreeSet<String> = results.iter().map(|r| r.requirement.clone()).collect();
        let missing = requirements.missing(&covered);
        let passed = results.iter().filter(|r| r.passed).count();

        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            duration_ms,
            results,
            covered,
            missing,
            aborted,
        }
    }

    /// Report for a run whose startup failed before any step could execute
    pub fn aborted(error: &E2eError, requirements: &RequirementSet) -> Self {
        Self::from_results(Vec::new(), requirements, 0, Some(error.to_string()))
    }

    /// Pass only if nothing aborted, every step passed, and every declared
    /// requirement was exercised.
    pub fn success(&self) -> bool {
        self.aborted.is_none() && self.failed == 0 && self.missing.is_empty()
    }

    pub fn coverage_gap(&self) -> Option<E2eError> {
        if self.missing.is_empty() {
            None
        } else {
            Some(E2eError::CoverageGap {
                missing: self.missing.clone(),
            })
        }
    }

    pub fn log_summary(&self) {
        info!("--- Test Summary ---");
        for result in &self.results {
            if result.passed {
                info!("✓ {} [{}] ({} ms)", result.step_id, result.requirement, result.duration_ms);
            } else {
                error!("✗ {} [{}] - {}", result.step_id, result.requirement, result.message);
            }
        }
        if let Some(reason) = &self.aborted {
            error!("Run aborted before tests: {}", reason);
        }
        if let Some(gap) = self.coverage_gap() {
            error!("{}", gap);
        }
        info!(
            "Test Results: {} passed, {} failed, {}/{} requirements covered ({} ms)",
            self.passed,
            self.failed,
            self.covered.len(),
            self.covered.len() + self.missing.len(),
            self.duration_ms
        );
    }
}

/// Runs steps strictly in order against the live services
pub struct TestRunner {
    steps: Vec<TestStep>,
}

impl TestRunner {
    pub fn new(steps: Vec<TestStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Execute every step in order. A failed step is recorded and the next
    /// one still runs.
    pub async fn run(&self, ctx: &StepContext, requirements: &RequirementSet) -> SuiteReport {
        let start = Instant::now();
        let mut results = Vec::with_capacity(self.steps.len());

        info!("Running {} test step(s)...", self.steps.len());

        for step in &self.steps {
            results.push(self.run_step(step, ctx).await);
        }

        let report = SuiteReport::from_results(
            results,
            requirements,
            start.elapsed().as_millis() as u64,
            None,
        );

        for id in &report.covered {
            if !requirements.ids().contains(id) {
                warn!("Step requirement {} is not declared in the requirement set", id);
            }
        }

        report
    }

    async fn run_step(&self, step: &TestStep, ctx: &StepContext) -> TestResult {
        let start = Instant::now();
        info!("Testing {}: {}", step.id, step.description);

        let (passed, message) = match step.execute(ctx).await {
            Ok(message) => {
                info!("✓ {} passed: {}", step.id, message);
                (true, message)
            }
            Err(e) => {
                error!("✗ {} failed: {}", step.id, e);
                (false, e.to_string())
            }
        };
        debug!("{} covers {}", step.id, step.requirement);

        TestResult {
            step_id: step.id.clone(),
            requirement: step.requirement.clone(),
            passed,
            message,
            timestamp: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::E2eResult;
    use crate::steps::Check;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct Recorded {
        name: &'static str,
        pass: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Check for Recorded {
        async fn run(&self, _ctx: &StepContext) -> E2eResult<String> {
            self.log.lock().push(self.name);
            if self.pass {
                Ok("ok".to_string())
            } else {
                Err(E2eError::AssertionFailed(format!("{} failed", self.name)))
            }
        }
    }

    fn step(
        name: &'static str,
        requirement: &str,
        pass: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> TestStep {
        TestStep::new(
            name,
            name,
            requirement,
            Recorded {
                name,
                pass,
                log: log.clone(),
            },
        )
    }

    fn ctx() -> StepContext {
        StepContext::new("http://127.0.0.1:9", "http://127.0.0.1:9", Duration::from_secs(1))
            .unwrap()
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_failures_do_not_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = TestRunner::new(vec![
            step("first", "REQ-1", true, &log),
            step("second", "REQ-2", false, &log),
            step("third", "REQ-3", true, &log),
        ]);

        let report = runner
            .run(&ctx(), &RequirementSet::new(["REQ-1", "REQ-2", "REQ-3"]))
            .await;

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.results[1].passed);
        assert!(report.results[1].message.contains("second failed"));
        // Failed steps still count as exercised
        assert!(report.missing.is_empty());
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_coverage_gap_fails_green_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = TestRunner::new(vec![step("only", "REQ-1", true, &log)]);

        let report = runner
            .run(&ctx(), &RequirementSet::new(["REQ-1", "REQ-REMOVED"]))
            .await;

        assert_eq!(report.failed, 0);
        assert_eq!(report.missing, vec!["REQ-REMOVED".to_string()]);
        assert!(!report.success());
        assert!(matches!(report.coverage_gap(), Some(E2eError::CoverageGap { .. })));
    }

    #[tokio::test]
    async fn test_all_green_and_covered_passes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = TestRunner::new(vec![
            step("a", "REQ-1", true, &log),
            step("b", "REQ-1", true, &log),
        ]);

        let report = runner.run(&ctx(), &RequirementSet::new(["REQ-1"])).await;
        assert!(report.success());
        assert!(report.coverage_gap().is_none());
    }

    #[test]
    fn test_aborted_report_misses_everything() {
        let err = E2eError::WatchdogTimeout { seconds: 1 };
        let report = SuiteReport::aborted(&err, &RequirementSet::new(["REQ-1", "REQ-2"]));
        assert_eq!(report.total, 0);
        assert_eq!(report.missing.len(), 2);
        assert!(!report.success());
    }
}
