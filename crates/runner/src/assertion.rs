//! Timeout-polled condition checks.
//!
//! Hard assertions and soft probes share one polling loop but differ in
//! deadline source and response: a hard assertion's expiry is a reportable
//! failure carrying the last observed state, a probe's expiry just means
//! "condition absent".

use cdp_driver::{Driver, SurfaceScope};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::errors::RunnerError;
use crate::surface::SurfaceResolver;
use crate::types::{Assertion, Condition, RunnerConfig, Verdict};

const OBSERVED_SNAPSHOT_LIMIT: usize = 2_000;

pub struct AssertionEngine {
    driver: Arc<dyn Driver>,
    config: RunnerConfig,
}

impl AssertionEngine {
    pub fn new(driver: Arc<dyn Driver>, config: RunnerConfig) -> Self {
        Self { driver, config }
    }

    /// Hard assertion: poll until the condition holds or the assertion's
    /// own deadline elapses. Expiry produces a failed verdict with the last
    /// observed surface text attached for diagnosis.
    pub async fn check(&self, assertion: &Assertion, resolver: &SurfaceResolver) -> Verdict {
        let deadline = Duration::from_millis(assertion.deadline_ms);
        let scope = resolver.current().scope;

        info!(
            locator = %assertion.locator,
            deadline_ms = assertion.deadline_ms,
            "checking assertion"
        );

        match self.poll(assertion, &scope, deadline).await {
            Ok(()) => Verdict::Pass,
            Err(err) => {
                let last_observed = self.observe(&scope).await;
                let reason = assertion
                    .message
                    .clone()
                    .unwrap_or_else(|| err.to_string());
                Verdict::Fail {
                    reason,
                    last_observed,
                }
            }
        }
    }

    /// Soft probe used mid-script to decide branching: deadline expiry is
    /// swallowed, and the deadline is the independently tunable probe
    /// budget rather than the assertion's.
    pub async fn probe(&self, assertion: &Assertion, resolver: &SurfaceResolver) -> bool {
        let deadline = Duration::from_millis(self.config.probe_deadline_ms);
        let scope = resolver.current().scope;
        self.poll(assertion, &scope, deadline).await.is_ok()
    }

    /// Snapshot the current surface's rendered text for a failure report.
    pub async fn observe_current(&self, resolver: &SurfaceResolver) -> String {
        self.observe(&resolver.current().scope).await
    }

    async fn poll(
        &self,
        assertion: &Assertion,
        scope: &SurfaceScope,
        deadline: Duration,
    ) -> Result<(), RunnerError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let deadline_at = Instant::now() + deadline;

        loop {
            match self.holds(assertion, scope).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                // Transient driver errors read as "not yet"; the deadline
                // still bounds the loop.
                Err(err) => debug!(%err, "condition evaluation failed, retrying"),
            }

            if Instant::now() >= deadline_at {
                return Err(RunnerError::AssertionTimeout(format!(
                    "{} not {} within {}ms",
                    assertion.locator,
                    describe(&assertion.condition),
                    deadline.as_millis()
                )));
            }

            sleep(interval).await;
        }
    }

    async fn holds(
        &self,
        assertion: &Assertion,
        scope: &SurfaceScope,
    ) -> Result<bool, RunnerError> {
        match &assertion.condition {
            Condition::Visible => {
                let hits = self.driver.query(scope, &assertion.locator).await?;
                Ok(hits
                    .get(assertion.index)
                    .map(|hit| hit.visible)
                    .unwrap_or(false))
            }
            Condition::TextContains { needle } => {
                let text = self
                    .driver
                    .text_content(scope, &assertion.locator, assertion.index)
                    .await?;
                Ok(text.map(|t| t.contains(needle)).unwrap_or(false))
            }
        }
    }

    /// Last observed state of the scoped surface, bounded for the report.
    async fn observe(&self, scope: &SurfaceScope) -> String {
        match self.driver.page_text(scope).await {
            Ok(text) => {
                let mut text = text;
                if text.len() > OBSERVED_SNAPSHOT_LIMIT {
                    let cut = text
                        .char_indices()
                        .map(|(i, _)| i)
                        .take_while(|&i| i <= OBSERVED_SNAPSHOT_LIMIT)
                        .last()
                        .unwrap_or(0);
                    text.truncate(cut);
                }
                text
            }
            Err(_) => "<surface text unavailable>".to_string(),
        }
    }
}

fn describe(condition: &Condition) -> String {
    match condition {
        Condition::Visible => "visible".to_string(),
        Condition::TextContains { needle } => format!("containing text '{needle}'"),
    }
}
