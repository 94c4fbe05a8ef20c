//! Error taxonomy for the orchestration core.

use cdp_driver::DriverError;
use thiserror::Error;

/// Failures surfaced by the runner components.
///
/// Step-level failures are contained at the executor boundary and converted
/// to outcomes; only unmodeled errors travel up to the orchestrator.
#[derive(Debug, Error, Clone)]
pub enum RunnerError {
    /// Driven-client instance or context could not be created. Fatal: the
    /// run aborts before any step.
    #[error("session acquire failed: {0}")]
    Acquire(String),

    /// A step's action did not complete within its timeout.
    #[error("step timeout: {0}")]
    StepTimeout(String),

    /// A step's locator matched nothing before its deadline.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// A hard assertion's condition never held before its deadline.
    #[error("assertion timeout: {0}")]
    AssertionTimeout(String),

    /// The run was cancelled cooperatively.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Error at the CDP boundary.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Unmodeled error; the orchestrator converts these to a failed verdict.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// Classify a driver error for a step that targeted an element.
    pub fn from_step_error(err: DriverError) -> Self {
        if err.is_not_found() {
            RunnerError::ElementNotFound(err.to_string())
        } else if err.is_timeout() {
            RunnerError::StepTimeout(err.to_string())
        } else {
            RunnerError::Driver(err)
        }
    }
}
