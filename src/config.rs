//! Application configuration: defaults, optional TOML file, env overrides.
//!
//! The resolved configuration is converted once into the runner's
//! session-scoped config and passed explicitly from there on.

use anyhow::{Context, Result};
use cdp_driver::DriverConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use pagerun_core_types::Viewport;
use pagerun_runner::RunnerConfig;

/// User-facing configuration, usually loaded from `pagerun.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address sessions navigate to on acquire.
    pub target_address: String,

    pub viewport_width: u32,
    pub viewport_height: u32,

    pub headless: bool,

    /// Explicit chrome/chromium path; auto-detected when absent.
    pub chrome_executable: Option<PathBuf>,

    pub default_step_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub surface_settle_timeout_ms: u64,
    pub nav_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub probe_deadline_ms: u64,

    /// Directory for failure screenshots; disabled when absent.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            target_address: runner.target_address,
            viewport_width: runner.viewport.width,
            viewport_height: runner.viewport.height,
            headless: true,
            chrome_executable: None,
            default_step_timeout_ms: runner.default_step_timeout_ms,
            settle_delay_ms: runner.settle_delay_ms,
            surface_settle_timeout_ms: runner.surface_settle_timeout_ms,
            nav_timeout_ms: runner.nav_timeout_ms,
            poll_interval_ms: runner.poll_interval_ms,
            probe_deadline_ms: runner.probe_deadline_ms,
            screenshot_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration: explicit file, else `./pagerun.toml` when
    /// present, else defaults. Environment variables override either.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let implicit = Path::new("pagerun.toml");
                if implicit.exists() {
                    Self::from_file(implicit)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("PAGERUN_TARGET") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.target_address = trimmed.to_string();
            }
        }

        if let Ok(value) = env::var("PAGERUN_HEADLESS") {
            let lower = value.to_ascii_lowercase();
            self.headless = !matches!(lower.as_str(), "0" | "false" | "no" | "off");
        }

        if let Ok(value) = env::var("PAGERUN_CHROME") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.chrome_executable = Some(PathBuf::from(trimmed));
            }
        }
    }

    /// Resolve into the immutable session-scoped runner configuration.
    pub fn into_runner_config(self) -> RunnerConfig {
        let viewport = Viewport {
            width: self.viewport_width,
            height: self.viewport_height,
        };

        let mut driver = DriverConfig::default();
        driver.headless = self.headless;
        driver.viewport = viewport;
        if let Some(executable) = self.chrome_executable {
            driver.executable = executable;
        }

        RunnerConfig {
            target_address: self.target_address,
            viewport,
            default_step_timeout_ms: self.default_step_timeout_ms,
            settle_delay_ms: self.settle_delay_ms,
            surface_settle_timeout_ms: self.surface_settle_timeout_ms,
            nav_timeout_ms: self.nav_timeout_ms,
            poll_interval_ms: self.poll_interval_ms,
            probe_deadline_ms: self.probe_deadline_ms,
            screenshot_dir: self.screenshot_dir,
            driver,
        }
    }
}
