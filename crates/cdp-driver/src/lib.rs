//! Chromium DevTools Protocol driver for pagerun sessions.
//!
//! One `CdpDriver` owns one browser process, one isolated browser context,
//! and one attached page. The runner layers wire against the [`Driver`]
//! trait, so tests can substitute a scripted implementation.

pub mod config;
pub mod driver;
pub mod error;
pub mod transport;

pub use config::{detect_chrome_executable, DriverConfig};
pub use driver::{CdpDriver, Driver, ElementHit, FrameHandle, SurfaceScope};
pub use error::{DriverError, DriverErrorKind};
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};
