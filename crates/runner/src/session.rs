//! Session lifecycle: acquire a driven-client instance, guarantee its
//! teardown.

use cdp_driver::{CdpDriver, Driver, DriverConfig};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use pagerun_core_types::{PageId, SessionId};

use crate::errors::RunnerError;
use crate::types::RunnerConfig;

/// One exclusively-owned driven-client instance with one isolated context
/// and one active page.
pub struct Session {
    pub id: SessionId,
    pub page: PageId,
    driver: Arc<dyn Driver>,
    released: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("page", &self.page)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn driver(&self) -> Arc<dyn Driver> {
        Arc::clone(&self.driver)
    }
}

/// Builds the driver backing a session; tests substitute scripted drivers.
pub type DriverFactory = Arc<
    dyn Fn(DriverConfig) -> BoxFuture<'static, Result<Arc<dyn Driver>, cdp_driver::DriverError>>
        + Send
        + Sync,
>;

/// Owns launch and teardown of sessions for one configuration.
pub struct SessionManager {
    config: RunnerConfig,
    factory: DriverFactory,
}

impl SessionManager {
    pub fn new(config: RunnerConfig) -> Self {
        let factory: DriverFactory = Arc::new(|cfg: DriverConfig| {
            Box::pin(async move {
                let driver = CdpDriver::launch(cfg).await?;
                Ok(driver as Arc<dyn Driver>)
            })
        });
        Self::with_factory(config, factory)
    }

    /// Inject a driver factory; tests substitute scripted drivers here.
    pub fn with_factory(config: RunnerConfig, factory: DriverFactory) -> Self {
        Self { config, factory }
    }

    /// Launch the driven client, then navigate to the target address,
    /// waiting only until the navigation is committed so startup latency
    /// stays bounded.
    pub async fn acquire(&self) -> Result<Session, RunnerError> {
        let id = SessionId::new();
        let page = PageId::new();
        info!(
            session = %id,
            page = %page,
            target = %self.config.target_address,
            viewport = %self.config.viewport,
            "acquiring session"
        );

        let mut driver_cfg = self.config.driver.clone();
        driver_cfg.viewport = self.config.viewport;

        let driver = (self.factory)(driver_cfg)
            .await
            .map_err(|err| RunnerError::Acquire(err.to_string()))?;

        let nav_deadline = Duration::from_millis(self.config.nav_timeout_ms);
        if let Err(err) = driver.navigate(&self.config.target_address, nav_deadline).await {
            // The instance partially launched; tear it down before
            // reporting the acquire failure.
            if let Err(close_err) = driver.close().await {
                warn!(session = %id, ?close_err, "teardown after failed acquire");
            }
            return Err(RunnerError::Acquire(format!(
                "navigation to {} failed: {err}",
                self.config.target_address
            )));
        }

        Ok(Session {
            id,
            page,
            driver,
            released: AtomicBool::new(false),
        })
    }

    /// Close page, context, and driver instance. Unconditional: errors are
    /// logged, never propagated, and a second call is a no-op.
    pub async fn release(&self, session: &Session) {
        if session.released.swap(true, Ordering::SeqCst) {
            debug!(session = %session.id, "release called twice, ignoring");
            return;
        }

        if let Err(err) = session.driver.close().await {
            warn!(session = %session.id, ?err, "teardown error swallowed");
        } else {
            info!(session = %session.id, "session released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdp_driver::{DriverError, DriverErrorKind, ElementHit, FrameHandle, SurfaceScope};
    use std::sync::atomic::AtomicUsize;
    use pagerun_core_types::Locator;

    /// Driver stub counting close calls; navigation optionally fails.
    struct CloseCountingDriver {
        closes: AtomicUsize,
        fail_navigation: bool,
    }

    #[async_trait]
    impl Driver for CloseCountingDriver {
        async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<(), DriverError> {
            if self.fail_navigation {
                Err(DriverError::new(DriverErrorKind::CdpIo).with_hint("connection refused"))
            } else {
                Ok(())
            }
        }

        async fn current_url(&self) -> Result<String, DriverError> {
            Ok(String::new())
        }

        async fn frames(&self) -> Result<Vec<FrameHandle>, DriverError> {
            Ok(Vec::new())
        }

        async fn ready_state(&self, _scope: &SurfaceScope) -> Result<String, DriverError> {
            Ok("complete".to_string())
        }

        async fn query(
            &self,
            _scope: &SurfaceScope,
            _locator: &Locator,
        ) -> Result<Vec<ElementHit>, DriverError> {
            Ok(Vec::new())
        }

        async fn click(
            &self,
            _scope: &SurfaceScope,
            _locator: &Locator,
            _index: usize,
            _deadline: Duration,
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn fill(
            &self,
            _scope: &SurfaceScope,
            _locator: &Locator,
            _index: usize,
            _text: &str,
            _deadline: Duration,
        ) -> Result<(), DriverError> {
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

        async fn scroll_by(&self, _dx: f64, _dy: f64) -> Result<(), DriverError> {
            Ok(())
        }

        async fn viewport_height(&self) -> Result<f64, DriverError> {
            Ok(720.0)
        }

        async fn page_text(&self, _scope: &SurfaceScope) -> Result<String, DriverError> {
            Ok(String::new())
        }

        async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), DriverError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(driver: Arc<CloseCountingDriver>) -> SessionManager {
        let factory: DriverFactory = Arc::new(move |_cfg| {
            let driver = Arc::clone(&driver);
            Box::pin(async move { Ok(driver as Arc<dyn Driver>) })
        });
        SessionManager::with_factory(RunnerConfig::fast(), factory)
    }

    #[tokio::test]
    async fn release_twice_closes_once() {
        let driver = Arc::new(CloseCountingDriver {
            closes: AtomicUsize::new(0),
            fail_navigation: false,
        });
        let manager = manager_with(Arc::clone(&driver));

        let session = manager.acquire().await.unwrap();
        manager.release(&session).await;
        manager.release(&session).await;

        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_target_navigation_is_acquire_failure_with_teardown() {
        let driver = Arc::new(CloseCountingDriver {
            closes: AtomicUsize::new(0),
            fail_navigation: true,
        });
        let manager = manager_with(Arc::clone(&driver));

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, RunnerError::Acquire(_)));
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }
}
