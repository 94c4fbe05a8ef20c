//! Single-step execution with bounded waits and tagged outcomes.

use cdp_driver::Driver;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::RunnerError;
use crate::surface::SurfaceResolver;
use crate::types::{RunnerConfig, ScrollDelta, Step, StepKind, StepOutcome, StepPolicy, StepRecord};

/// Performs one typed step against the current surface.
///
/// Failures are contained here and converted to outcomes; given an
/// identical surface state the same step resolves to the same element and
/// produces the same outcome class.
pub struct ActionExecutor {
    driver: Arc<dyn Driver>,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn Driver>, config: RunnerConfig) -> Self {
        Self::with_cancellation(driver, config, CancellationToken::new())
    }

    pub fn with_cancellation(
        driver: Arc<dyn Driver>,
        config: RunnerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            driver,
            config,
            cancel,
        }
    }

    /// Execute one step and record its outcome.
    ///
    /// Steps:
    /// 1. Check for cooperative cancellation
    /// 2. Apply the settle delay before element interactions
    /// 3. Dispatch the typed action under its per-step timeout
    /// 4. Map any failure through the step policy into a tagged outcome
    pub async fn execute(
        &self,
        position: usize,
        step: &Step,
        resolver: &mut SurfaceResolver,
    ) -> StepRecord {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            position,
            action = step.kind.name(),
            policy = ?step.policy,
            "executing step"
        );

        let result = self.perform(step, resolver).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                debug!(position, latency_ms, "step succeeded");
                StepOutcome::Success
            }
            Err(err) => match step.policy {
                StepPolicy::BestEffort => {
                    debug!(position, %err, "best-effort step skipped");
                    StepOutcome::Skipped {
                        reason: err.to_string(),
                    }
                }
                StepPolicy::Mandatory => {
                    warn!(position, %err, "mandatory step failed");
                    StepOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            },
        };

        StepRecord {
            position,
            action: step.kind.name().to_string(),
            label: step.label.clone(),
            outcome,
            latency_ms,
            started_at,
        }
    }

    async fn perform(&self, step: &Step, resolver: &mut SurfaceResolver) -> Result<(), RunnerError> {
        // 1. Cancellation check before any waiting begins.
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Interrupted("run cancelled".to_string()));
        }

        // 2. Settle delay: the driven application updates its UI
        // asynchronously after prior steps, so element interactions wait a
        // fixed bounded delay first.
        if matches!(step.kind, StepKind::Fill { .. } | StepKind::Click { .. }) {
            let settle = Duration::from_millis(self.config.settle_delay_ms);
            if !settle.is_zero() {
                tokio::select! {
                    _ = sleep(settle) => {}
                    _ = self.cancel.cancelled() => {
                        return Err(RunnerError::Interrupted("run cancelled".to_string()));
                    }
                }
            }
        }

        // A wait step's duration is its own bound; the action timeout only
        // applies to steps that interact with the surface.
        if let StepKind::Wait { duration_ms } = step.kind {
            return tokio::select! {
                _ = sleep(Duration::from_millis(duration_ms)) => Ok(()),
                _ = self.cancel.cancelled() => {
                    Err(RunnerError::Interrupted("run cancelled".to_string()))
                }
            };
        }

        // 3. Dispatch under the action-level timeout, distinct from the
        // settle delay above. A navigation's budget covers commit plus the
        // settle pass over the new surface set.
        let default_timeout = match step.kind {
            StepKind::Navigate { .. } => {
                self.config.nav_timeout_ms + self.config.surface_settle_timeout_ms
            }
            _ => self.config.default_step_timeout_ms,
        };
        let step_deadline = Duration::from_millis(step.timeout_ms.unwrap_or(default_timeout));

        match timeout(step_deadline, self.dispatch(step, resolver, step_deadline)).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::StepTimeout(format!(
                "{} step timed out after {}ms",
                step.kind.name(),
                step_deadline.as_millis()
            ))),
        }
    }

    async fn dispatch(
        &self,
        step: &Step,
        resolver: &mut SurfaceResolver,
        deadline: Duration,
    ) -> Result<(), RunnerError> {
        let surface = resolver.current();

        match &step.kind {
            StepKind::Fill { locator, value } => self
                .driver
                .fill(&surface.scope, locator, step.index, value, deadline)
                .await
                .map_err(RunnerError::from_step_error),

            StepKind::Click { locator } => self
                .driver
                .click(&surface.scope, locator, step.index, deadline)
                .await
                .map_err(RunnerError::from_step_error),

            StepKind::Navigate { url } => {
                if !url.starts_with("http://")
                    && !url.starts_with("https://")
                    && !url.starts_with("file://")
                {
                    return Err(RunnerError::Internal(format!("invalid url scheme: {url}")));
                }

                let nav_deadline = Duration::from_millis(self.config.nav_timeout_ms).min(deadline);
                self.driver.navigate(url, nav_deadline).await?;

                // Navigation invalidates the frame set: record the commit
                // and re-take the surface snapshot.
                resolver.note_navigation();
                resolver
                    .settle(Duration::from_millis(self.config.surface_settle_timeout_ms))
                    .await
            }

            StepKind::Scroll { delta } => {
                let delta_y = match delta {
                    ScrollDelta::Pages(pages) => self.driver.viewport_height().await? * pages,
                    ScrollDelta::Pixels(pixels) => *pixels,
                };
                self.driver
                    .scroll_by(0.0, delta_y)
                    .await
                    .map_err(RunnerError::Driver)
            }

            // Handled before the timeout wrapper in `perform`.
            StepKind::Wait { .. } => Ok(()),
        }
    }
}
