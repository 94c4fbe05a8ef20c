//! Run orchestration: sequences steps, coordinates the components, and
//! guarantees teardown on every exit path.

use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use pagerun_core_types::RunId;

use crate::assertion::AssertionEngine;
use crate::errors::RunnerError;
use crate::executor::ActionExecutor;
use crate::session::SessionManager;
use crate::surface::SurfaceResolver;
use crate::types::{RunResult, RunnerConfig, Script, StepOutcome, StepRecord, Verdict};

/// Run lifecycle states. `TornDown` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Acquiring,
    Executing(usize),
    Asserting,
    TornDown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Acquiring => write!(f, "acquiring"),
            RunState::Executing(i) => write!(f, "executing({i})"),
            RunState::Asserting => write!(f, "asserting"),
            RunState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// Drives one script through one exclusively-owned session.
///
/// Runs are independent: concurrent runs each construct their own
/// orchestrator and session, sharing no mutable state.
pub struct RunOrchestrator {
    config: RunnerConfig,
    sessions: SessionManager,
}

impl RunOrchestrator {
    pub fn new(config: RunnerConfig) -> Self {
        let sessions = SessionManager::new(config.clone());
        Self { config, sessions }
    }

    pub fn with_session_manager(config: RunnerConfig, sessions: SessionManager) -> Self {
        Self { config, sessions }
    }

    /// Execute the script and report exactly one verdict.
    ///
    /// Teardown runs on every path out of `Executing`/`Asserting`,
    /// including unmodeled errors, which are converted to a failed verdict
    /// after release.
    pub async fn run(&self, script: &Script) -> RunResult {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(run = %run_id, script = %script.name, "run starting");

        // Idle -> Acquiring. Failure here is immediately fatal: there is no
        // session to tear down beyond what acquire cleaned up itself.
        let mut state = self.transition(run_id, RunState::Idle, RunState::Acquiring);
        let session = match self.sessions.acquire().await {
            Ok(session) => session,
            Err(err) => {
                error!(run = %run_id, %err, "acquire failed");
                self.transition(run_id, state, RunState::TornDown);
                return RunResult {
                    run_id,
                    script: script.name.clone(),
                    verdict: Verdict::Fail {
                        reason: err.to_string(),
                        last_observed: String::new(),
                    },
                    steps: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    screenshot: None,
                };
            }
        };

        let driver = session.driver();
        let mut resolver = SurfaceResolver::new(driver.clone());
        resolver.note_navigation();
        let executor = ActionExecutor::new(driver.clone(), self.config.clone());
        let engine = AssertionEngine::new(driver.clone(), self.config.clone());

        let drive_result = self
            .drive(run_id, &mut state, script, &mut resolver, &executor, &engine)
            .await;

        let (verdict, steps) = match drive_result {
            Ok(outcome) => outcome,
            Err(err) => {
                // Unmodeled error: convert to a failed verdict; teardown
                // still happens below.
                error!(run = %run_id, %err, "unexpected error during run");
                (
                    Verdict::Fail {
                        reason: format!("unexpected error: {err}"),
                        last_observed: String::new(),
                    },
                    Vec::new(),
                )
            }
        };

        // Diagnostics need the page alive, so capture before release.
        let screenshot = if !verdict.passed() {
            self.capture_failure_screenshot(run_id, &driver).await
        } else {
            None
        };

        self.sessions.release(&session).await;
        self.transition(run_id, state, RunState::TornDown);

        let result = RunResult {
            run_id,
            script: script.name.clone(),
            verdict,
            steps,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            screenshot,
        };

        if result.passed() {
            info!(run = %run_id, duration_ms = result.duration_ms, "run passed");
        } else {
            warn!(run = %run_id, duration_ms = result.duration_ms, "run failed");
        }
        result
    }

    async fn drive(
        &self,
        run_id: RunId,
        state: &mut RunState,
        script: &Script,
        resolver: &mut SurfaceResolver,
        executor: &ActionExecutor,
        engine: &AssertionEngine,
    ) -> Result<(Verdict, Vec<StepRecord>), RunnerError> {
        // The acquire navigation only waited for commit; give the surface
        // set one settle pass before the first step.
        resolver
            .settle(std::time::Duration::from_millis(
                self.config.surface_settle_timeout_ms,
            ))
            .await?;

        let mut records = Vec::with_capacity(script.steps.len());

        for (position, step) in script.steps.iter().enumerate() {
            *state = self.transition(run_id, *state, RunState::Executing(position));

            let record = executor.execute(position, step, resolver).await;
            let failed = record.outcome.is_failed();
            records.push(record);

            // A mandatory failure skips remaining steps and the assertion
            // phase, never teardown.
            if failed {
                let last = records.last().expect("record just pushed");
                let reason = match &last.outcome {
                    StepOutcome::Failed { reason } => format!(
                        "mandatory step {} ({}) failed: {reason}",
                        last.position, last.action
                    ),
                    _ => unreachable!("guarded by is_failed"),
                };
                let verdict = Verdict::Fail {
                    reason,
                    last_observed: engine.observe_current(resolver).await,
                };
                return Ok((verdict, records));
            }
        }

        *state = self.transition(run_id, *state, RunState::Asserting);

        for assertion in &script.assertions {
            match engine.check(assertion, resolver).await {
                Verdict::Pass => continue,
                fail => return Ok((fail, records)),
            }
        }

        Ok((Verdict::Pass, records))
    }

    fn transition(&self, run_id: RunId, from: RunState, to: RunState) -> RunState {
        debug!(run = %run_id, %from, %to, "state transition");
        to
    }

    async fn capture_failure_screenshot(
        &self,
        run_id: RunId,
        driver: &std::sync::Arc<dyn cdp_driver::Driver>,
    ) -> Option<PathBuf> {
        let dir = self.config.screenshot_dir.as_ref()?;

        let bytes = match driver.screenshot().await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return None,
            Err(err) => {
                warn!(run = %run_id, ?err, "failure screenshot capture failed");
                return None;
            }
        };

        let path = dir.join(format!("run-{run_id}.png"));
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(run = %run_id, ?err, "could not create screenshot dir");
            return None;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(run = %run_id, ?err, "could not write failure screenshot");
                None
            }
        }
    }
}
