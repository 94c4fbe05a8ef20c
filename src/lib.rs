//! Pagerun CLI library
//!
//! Exposes configuration and script-file handling for integration testing.

pub mod config;
pub mod script;

pub use config::AppConfig;
pub use script::{load_script, validate_script, ScriptError};
