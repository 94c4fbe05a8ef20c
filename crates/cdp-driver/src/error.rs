//! Error types surfaced by the CDP driver boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// High-level error categories surfaced by the driver.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
pub enum DriverErrorKind {
    #[error("navigation timed out")]
    NavTimeout,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("target element not found")]
    TargetNotFound,
    #[error("launch failure")]
    Launch,
    #[error("internal error")]
    Internal,
}

/// Enriched error metadata passed back to the runner layers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

impl DriverError {
    pub fn new(kind: DriverErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    /// True when the element a command targeted was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DriverErrorKind::TargetNotFound)
    }

    /// True when the command gave up on a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, DriverErrorKind::NavTimeout)
    }
}
