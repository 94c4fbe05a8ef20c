//! Core data types for scripted runs.

use chrono::{DateTime, Utc};
use cdp_driver::DriverConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use pagerun_core_types::{Locator, RunId, Viewport};

/// Whether a step's failure aborts the run or is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    /// Failure aborts the run (teardown still occurs).
    Mandatory,

    /// Failure is recorded as skipped and the run proceeds.
    BestEffort,
}

impl Default for StepPolicy {
    fn default() -> Self {
        StepPolicy::Mandatory
    }
}

/// Viewport advance for scroll steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDelta {
    /// Multiples of the viewport height (1.0 = one screen down).
    Pages(f64),

    /// Raw pixel delta, positive scrolls down.
    Pixels(f64),
}

/// The typed action a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepKind {
    /// Set a text value on a located element.
    Fill { locator: Locator, value: String },

    /// Dispatch a pointer activation on a located element.
    Click { locator: Locator },

    /// Issue a direct address change.
    Navigate { url: String },

    /// Advance the viewport offset by a computed delta.
    Scroll { delta: ScrollDelta },

    /// Pure delay.
    Wait { duration_ms: u64 },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Fill { .. } => "fill",
            StepKind::Click { .. } => "click",
            StepKind::Navigate { .. } => "navigate",
            StepKind::Scroll { .. } => "scroll",
            StepKind::Wait { .. } => "wait",
        }
    }

    /// The locator this action targets, if it targets an element at all.
    pub fn locator(&self) -> Option<&Locator> {
        match self {
            StepKind::Fill { locator, .. } | StepKind::Click { locator } => Some(locator),
            _ => None,
        }
    }
}

/// One ordered instruction. Immutable once defined; script order is
/// semantically significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Which match to target when the locator returns several (first by
    /// default).
    #[serde(default)]
    pub index: usize,

    #[serde(default)]
    pub policy: StepPolicy,

    /// Per-step action timeout override, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Human-readable label for the run log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Step {
    pub fn fill(locator: Locator, value: impl Into<String>) -> Self {
        Self::from_kind(StepKind::Fill {
            locator,
            value: value.into(),
        })
    }

    pub fn click(locator: Locator) -> Self {
        Self::from_kind(StepKind::Click { locator })
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::from_kind(StepKind::Navigate { url: url.into() })
    }

    pub fn scroll(delta: ScrollDelta) -> Self {
        Self::from_kind(StepKind::Scroll { delta })
    }

    pub fn wait_ms(duration_ms: u64) -> Self {
        Self::from_kind(StepKind::Wait { duration_ms })
    }

    fn from_kind(kind: StepKind) -> Self {
        Self {
            kind,
            index: 0,
            policy: StepPolicy::default(),
            timeout_ms: None,
            label: None,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.policy = StepPolicy::BestEffort;
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Tagged outcome of one step execution. Timeouts and absent elements are
/// data here, never control-flow exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Skipped { reason: String },
    Failed { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Log entry for one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based position in the script.
    pub position: usize,

    pub action: String,

    pub label: Option<String>,

    #[serde(flatten)]
    pub outcome: StepOutcome,

    pub latency_ms: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
}

/// Target condition an assertion polls for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The located element is rendered and visible.
    Visible,

    /// The located element's text content contains the needle.
    TextContains { needle: String },
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Visible
    }
}

fn default_assert_deadline_ms() -> u64 {
    5_000
}

/// Final check polled up to a deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub locator: Locator,

    #[serde(default)]
    pub index: usize,

    #[serde(default)]
    pub condition: Condition,

    #[serde(default = "default_assert_deadline_ms")]
    pub deadline_ms: u64,

    /// Human-readable failure context reported instead of the mechanical
    /// reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Assertion {
    pub fn visible(locator: Locator) -> Self {
        Self {
            locator,
            index: 0,
            condition: Condition::Visible,
            deadline_ms: default_assert_deadline_ms(),
            message: None,
        }
    }

    pub fn text_contains(locator: Locator, needle: impl Into<String>) -> Self {
        Self {
            condition: Condition::TextContains {
                needle: needle.into(),
            },
            ..Self::visible(locator)
        }
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Pass/fail outcome of a run, with diagnostic context on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail {
        reason: String,
        /// Rendered text of the current surface when the run failed.
        last_observed: String,
    },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// An ordered list of steps plus the terminal assertions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,

    /// Overrides the configured target address when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// Aggregated result of one run. Immutable after construction; exactly one
/// is produced per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub script: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub steps: Vec<StepRecord>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Saved failure screenshot, when capture succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Session-scoped configuration, immutable for the run's duration and
/// passed explicitly rather than held as ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Address the session navigates to on acquire.
    pub target_address: String,

    pub viewport: Viewport,

    /// Action-level timeout for a step, unless the step overrides it.
    pub default_step_timeout_ms: u64,

    /// Fixed delay before element interactions, letting asynchronous UI
    /// updates finish rendering. Determinism over speed.
    pub settle_delay_ms: u64,

    /// Per-surface bound while waiting for content-loaded signals.
    pub surface_settle_timeout_ms: u64,

    /// Bound on navigation commit.
    pub nav_timeout_ms: u64,

    /// Assertion polling cadence.
    pub poll_interval_ms: u64,

    /// Deadline for soft probes, tuned independently of hard assertion
    /// deadlines.
    pub probe_deadline_ms: u64,

    /// Directory for failure screenshots; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_dir: Option<PathBuf>,

    pub driver: DriverConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            target_address: "http://localhost:5173".to_string(),
            viewport: Viewport::default(),
            default_step_timeout_ms: 5_000,
            settle_delay_ms: 3_000,
            surface_settle_timeout_ms: 3_000,
            nav_timeout_ms: 10_000,
            poll_interval_ms: 250,
            probe_deadline_ms: 1_000,
            screenshot_dir: None,
            driver: DriverConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Config suitable for unit tests: no real waiting.
    pub fn fast() -> Self {
        Self {
            default_step_timeout_ms: 200,
            settle_delay_ms: 0,
            surface_settle_timeout_ms: 100,
            nav_timeout_ms: 200,
            poll_interval_ms: 10,
            probe_deadline_ms: 50,
            ..Self::default()
        }
    }
}
