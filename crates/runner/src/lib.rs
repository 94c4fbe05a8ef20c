//! Pagerun orchestration core.
//!
//! Drives one live browser session through an ordered script of user-like
//! steps and verifies a final observable state within a time budget:
//! - Session lifecycle (acquire, isolated context, teardown on every path)
//! - Surface resolution across the top document and embedded frames
//! - Bounded-wait step execution with mandatory/best-effort policies
//! - Timeout-polled assertions with diagnostic snapshots

pub mod assertion;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod session;
pub mod surface;
pub mod types;

pub use assertion::AssertionEngine;
pub use errors::RunnerError;
pub use executor::ActionExecutor;
pub use orchestrator::{RunOrchestrator, RunState};
pub use session::{DriverFactory, Session, SessionManager};
pub use surface::{Surface, SurfaceResolver};
pub use types::{
    Assertion, Condition, RunResult, RunnerConfig, ScrollDelta, Script, Step, StepKind,
    StepOutcome, StepPolicy, StepRecord, Verdict,
};
