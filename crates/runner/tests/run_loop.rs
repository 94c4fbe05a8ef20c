//! End-to-end run loop behavior against a scripted driver: sequencing,
//! policy handling, verdicts, and unconditional teardown.

use async_trait::async_trait;
use cdp_driver::{Driver, DriverError, DriverErrorKind, ElementHit, FrameHandle, SurfaceScope};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use pagerun_core_types::Locator;
use pagerun_runner::{
    Assertion, DriverFactory, RunOrchestrator, RunnerConfig, Script, SessionManager, Step,
    StepOutcome, Verdict,
};

/// Driver whose surface is a small scripted state machine: some locators
/// are permanently absent, some become visible after a specific click.
struct ScriptedDriver {
    calls: Mutex<Vec<String>>,
    visible: Mutex<HashSet<String>>,
    missing: HashSet<String>,
    reveal_on_click: Option<(String, String)>,
    closes: AtomicUsize,
    page_text: String,
    fail_enumeration: bool,
}

impl ScriptedDriver {
    fn builder() -> ScriptedDriverBuilder {
        ScriptedDriverBuilder::default()
    }

    fn log(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct ScriptedDriverBuilder {
    visible: HashSet<String>,
    missing: HashSet<String>,
    reveal_on_click: Option<(String, String)>,
    page_text: String,
    fail_enumeration: bool,
}

impl ScriptedDriverBuilder {
    fn missing(mut self, locator: &Locator) -> Self {
        self.missing.insert(locator.to_string());
        self
    }

    fn reveals(mut self, click: &Locator, revealed: &Locator) -> Self {
        self.reveal_on_click = Some((click.to_string(), revealed.to_string()));
        self
    }

    fn page_text(mut self, text: &str) -> Self {
        self.page_text = text.to_string();
        self
    }

    fn fail_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    fn build(self) -> Arc<ScriptedDriver> {
        Arc::new(ScriptedDriver {
            calls: Mutex::new(Vec::new()),
            visible: Mutex::new(self.visible),
            missing: self.missing,
            reveal_on_click: self.reveal_on_click,
            closes: AtomicUsize::new(0),
            page_text: self.page_text,
            fail_enumeration: self.fail_enumeration,
        })
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn navigate(&self, url: &str, _deadline: Duration) -> Result<(), DriverError> {
        self.log(format!("navigate:{url}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok("http://localhost:5173/".to_string())
    }

    async fn frames(&self) -> Result<Vec<FrameHandle>, DriverError> {
        if self.fail_enumeration {
            return Err(DriverError::new(DriverErrorKind::Internal)
                .with_hint("frame tree unavailable"));
        }
        Ok(Vec::new())
    }

    async fn ready_state(&self, _scope: &SurfaceScope) -> Result<String, DriverError> {
        Ok("complete".to_string())
    }

    async fn query(
        &self,
        _scope: &SurfaceScope,
        locator: &Locator,
    ) -> Result<Vec<ElementHit>, DriverError> {
        self.log(format!("query:{locator}"));
        if self.visible.lock().unwrap().contains(&locator.to_string()) {
            Ok(vec![ElementHit {
                x: 100.0,
                y: 100.0,
                visible: true,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn click(
        &self,
        _scope: &SurfaceScope,
        locator: &Locator,
        _index: usize,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        self.log(format!("click:{locator}"));
        let key = locator.to_string();
        if self.missing.contains(&key) {
            return Err(DriverError::new(DriverErrorKind::TargetNotFound).with_hint(key));
        }
        if let Some((trigger, revealed)) = &self.reveal_on_click {
            if *trigger == key {
                self.visible.lock().unwrap().insert(revealed.clone());
            }
        }
        Ok(())
    }

    async fn fill(
        &self,
        _scope: &SurfaceScope,
        locator: &Locator,
        _index: usize,
        text: &str,
        _deadline: Duration,
    ) -> Result<(), DriverError> {
        self.log(format!("fill:{locator}={text}"));
        let key = locator.to_string();
        if self.missing.contains(&key) {
            return Err(DriverError::new(DriverErrorKind::TargetNotFound).with_hint(key));
        }
        Ok(())
    }

    async fn text_content(
        &self,
        _scope: &SurfaceScope,
        _locator: &Locator,
        _index: usize,
    ) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn scroll_by(&self, _dx: f64, dy: f64) -> Result<(), DriverError> {
        self.log(format!("scroll:{dy}"));
        Ok(())
    }

    async fn viewport_height(&self) -> Result<f64, DriverError> {
        Ok(720.0)
    }

    async fn page_text(&self, _scope: &SurfaceScope) -> Result<String, DriverError> {
        Ok(self.page_text.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn orchestrator_for(driver: Arc<ScriptedDriver>) -> RunOrchestrator {
    let config = RunnerConfig::fast();
    let factory: DriverFactory = Arc::new(move |_cfg| {
        let driver = Arc::clone(&driver);
        Box::pin(async move { Ok(driver as Arc<dyn Driver>) })
    });
    let sessions = SessionManager::with_factory(config.clone(), factory);
    RunOrchestrator::with_session_manager(config, sessions)
}

fn login_script() -> (Script, Locator, Locator, Locator, Locator) {
    let email = Locator::XPath("html/body/div/form/div[1]/input".into());
    let password = Locator::XPath("html/body/div/form/div[2]/input".into());
    let submit = Locator::XPath("html/body/div/form/button".into());
    let welcome = Locator::text("Welcome");

    let script = Script {
        name: "login".into(),
        target: None,
        steps: vec![
            Step::fill(email.clone(), "a@b.com"),
            Step::fill(password.clone(), "x"),
            Step::click(submit.clone()),
        ],
        assertions: vec![Assertion::visible(welcome.clone()).with_deadline_ms(300)],
    };
    (script, email, password, submit, welcome)
}

#[tokio::test]
async fn successful_login_run_passes() {
    let (script, email, password, submit, welcome) = login_script();
    let driver = ScriptedDriver::builder()
        .reveals(&submit, &welcome)
        .build();
    let orchestrator = orchestrator_for(Arc::clone(&driver));

    let result = orchestrator.run(&script).await;

    assert!(result.passed(), "verdict: {:?}", result.verdict);
    assert_eq!(result.steps.len(), 3);
    assert!(result.steps.iter().all(|s| s.outcome.is_success()));

    // Steps executed in declared order, each resolved before the next
    // began.
    let calls = driver.calls();
    let fill_email = calls
        .iter()
        .position(|c| c.starts_with(&format!("fill:{email}")))
        .unwrap();
    let fill_password = calls
        .iter()
        .position(|c| c.starts_with(&format!("fill:{password}")))
        .unwrap();
    let click_submit = calls
        .iter()
        .position(|c| c.starts_with(&format!("click:{submit}")))
        .unwrap();
    assert!(fill_email < fill_password && fill_password < click_submit);

    // Teardown ran exactly once.
    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mandatory_failure_halts_run_but_not_teardown() {
    let (script, _, _, submit, welcome) = login_script();
    let driver = ScriptedDriver::builder()
        .missing(&submit)
        .page_text("Sign In")
        .build();
    let orchestrator = orchestrator_for(Arc::clone(&driver));

    let result = orchestrator.run(&script).await;

    match &result.verdict {
        Verdict::Fail {
            reason,
            last_observed,
        } => {
            assert!(reason.contains("mandatory step 2"), "reason: {reason}");
            assert_eq!(last_observed, "Sign In");
        }
        Verdict::Pass => panic!("expected failure"),
    }
    assert_eq!(result.steps.len(), 3);
    assert!(result.steps[2].outcome.is_failed());

    // The assertion phase was skipped: the welcome text was never polled.
    assert!(!driver
        .calls()
        .iter()
        .any(|c| c.starts_with(&format!("query:{welcome}"))));

    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn best_effort_failure_does_not_block_later_steps() {
    let banner = Locator::Css(".dismiss-banner".into());
    let submit = Locator::XPath("html/body/div/form/button".into());
    let welcome = Locator::text("Welcome");

    let script = Script {
        name: "optional-banner".into(),
        target: None,
        steps: vec![
            Step::click(banner.clone()).best_effort(),
            Step::click(submit.clone()),
        ],
        assertions: vec![Assertion::visible(welcome.clone()).with_deadline_ms(300)],
    };

    let driver = ScriptedDriver::builder()
        .missing(&banner)
        .reveals(&submit, &welcome)
        .build();
    let orchestrator = orchestrator_for(Arc::clone(&driver));

    let result = orchestrator.run(&script).await;

    assert!(result.passed(), "verdict: {:?}", result.verdict);
    assert!(matches!(
        result.steps[0].outcome,
        StepOutcome::Skipped { .. }
    ));
    assert!(result.steps[1].outcome.is_success());
    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn assertion_timeout_fails_with_observed_state() {
    let error_text = Locator::text("Error");
    let script = Script {
        name: "no-error-shown".into(),
        target: None,
        steps: Vec::new(),
        assertions: vec![Assertion::visible(error_text).with_deadline_ms(200)],
    };

    let driver = ScriptedDriver::builder()
        .page_text("dashboard without any error banner")
        .build();
    let orchestrator = orchestrator_for(Arc::clone(&driver));

    let result = orchestrator.run(&script).await;

    match &result.verdict {
        Verdict::Fail {
            reason,
            last_observed,
        } => {
            assert!(reason.contains("assertion timeout"), "reason: {reason}");
            assert!(last_observed.contains("dashboard"));
        }
        Verdict::Pass => panic!("expected failure"),
    }
    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unexpected_error_is_converted_and_still_torn_down() {
    let (script, ..) = login_script();
    let driver = ScriptedDriver::builder().fail_enumeration().build();
    let orchestrator = orchestrator_for(Arc::clone(&driver));

    let result = orchestrator.run(&script).await;

    match &result.verdict {
        Verdict::Fail { reason, .. } => {
            assert!(reason.contains("unexpected error"), "reason: {reason}");
        }
        Verdict::Pass => panic!("expected failure"),
    }
    assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acquire_failure_aborts_before_any_step() {
    let config = RunnerConfig::fast();
    let factory: DriverFactory = Arc::new(|_cfg| {
        Box::pin(async {
            Err(DriverError::new(DriverErrorKind::Launch)
                .with_hint("chrome executable not found"))
        })
    });
    let sessions = SessionManager::with_factory(config.clone(), factory);
    let orchestrator = RunOrchestrator::with_session_manager(config, sessions);

    let (script, ..) = login_script();
    let result = orchestrator.run(&script).await;

    match &result.verdict {
        Verdict::Fail { reason, .. } => {
            assert!(reason.contains("session acquire failed"), "reason: {reason}");
        }
        Verdict::Pass => panic!("expected failure"),
    }
    assert!(result.steps.is_empty());
}

#[tokio::test]
async fn identical_scripts_produce_identical_outcome_classes() {
    let (script, _, _, submit, welcome) = login_script();

    let mut outcome_sequences = Vec::new();
    for _ in 0..2 {
        let driver = ScriptedDriver::builder()
            .reveals(&submit, &welcome)
            .build();
        let orchestrator = orchestrator_for(driver);
        let result = orchestrator.run(&script).await;
        let classes: Vec<&'static str> = result
            .steps
            .iter()
            .map(|s| match s.outcome {
                StepOutcome::Success => "success",
                StepOutcome::Skipped { .. } => "skipped",
                StepOutcome::Failed { .. } => "failed",
            })
            .collect();
        outcome_sequences.push((classes, result.passed()));
    }

    assert_eq!(outcome_sequences[0], outcome_sequences[1]);
}

#[tokio::test]
async fn parallel_runs_own_isolated_sessions() {
    let (script, _, _, submit, welcome) = login_script();

    let driver_a = ScriptedDriver::builder()
        .reveals(&submit, &welcome)
        .build();
    let driver_b = ScriptedDriver::builder()
        .reveals(&submit, &welcome)
        .build();
    let orchestrator_a = orchestrator_for(Arc::clone(&driver_a));
    let orchestrator_b = orchestrator_for(Arc::clone(&driver_b));

    let (result_a, result_b) =
        tokio::join!(orchestrator_a.run(&script), orchestrator_b.run(&script));

    assert!(result_a.passed());
    assert!(result_b.passed());
    assert_eq!(driver_a.closes.load(Ordering::SeqCst), 1);
    assert_eq!(driver_b.closes.load(Ordering::SeqCst), 1);
}
