//! Script files: YAML or JSON on disk, validated before a session is spent
//! on them.

use anyhow::{Context, Result};
use std::path::Path;
use thiserror::Error;
use pagerun_runner::{Script, StepKind};

/// Structural problems a script can carry.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script name cannot be empty")]
    EmptyName,

    #[error("script has neither steps nor assertions")]
    Empty,

    #[error("step {position}: navigate url '{url}' has an unsupported scheme")]
    BadNavigateUrl { position: usize, url: String },

    #[error("step {position}: wait duration must be greater than 0")]
    ZeroWait { position: usize },

    #[error("assertion {position}: deadline must be greater than 0")]
    ZeroDeadline { position: usize },
}

/// Load a script from disk, picking the format by extension (`.yaml`/
/// `.yml` or `.json`).
pub fn load_script(path: &Path) -> Result<Script> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let script: Script = match extension.as_str() {
        "json" => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON script {}", path.display()))?,
        _ => serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML script {}", path.display()))?,
    };

    Ok(script)
}

/// Validate script structure before acquiring a session for it.
pub fn validate_script(script: &Script) -> Result<(), ScriptError> {
    if script.name.trim().is_empty() {
        return Err(ScriptError::EmptyName);
    }

    if script.steps.is_empty() && script.assertions.is_empty() {
        return Err(ScriptError::Empty);
    }

    for (position, step) in script.steps.iter().enumerate() {
        match &step.kind {
            StepKind::Navigate { url } => {
                if !url.starts_with("http://")
                    && !url.starts_with("https://")
                    && !url.starts_with("file://")
                {
                    return Err(ScriptError::BadNavigateUrl {
                        position,
                        url: url.clone(),
                    });
                }
            }
            StepKind::Wait { duration_ms } if *duration_ms == 0 => {
                return Err(ScriptError::ZeroWait { position });
            }
            _ => {}
        }
    }

    for (position, assertion) in script.assertions.iter().enumerate() {
        if assertion.deadline_ms == 0 {
            return Err(ScriptError::ZeroDeadline { position });
        }
    }

    Ok(())
}
