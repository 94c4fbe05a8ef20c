//! Surface resolution: enumerate the addressable documents and wait for
//! them to reach a ready state.

use cdp_driver::{Driver, SurfaceScope};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use pagerun_core_types::SurfaceId;

use crate::errors::RunnerError;

/// An addressable document context: the top page or an embedded frame.
///
/// Carries a stable id so "current" can be tracked by navigation events
/// rather than by list position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Surface {
    pub id: SurfaceId,
    pub scope: SurfaceScope,
    pub url: String,
}

/// Snapshot-based view over the current surface set.
///
/// Enumeration is re-taken whenever a step is expected to change document
/// structure; navigation invalidates the frame set.
pub struct SurfaceResolver {
    driver: Arc<dyn Driver>,
    surfaces: Vec<Surface>,
    top_id: SurfaceId,
    current: Option<SurfaceId>,
}

impl SurfaceResolver {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let top_id = SurfaceId::new();
        Self {
            driver,
            surfaces: vec![Surface {
                id: top_id,
                scope: SurfaceScope::Document,
                url: String::new(),
            }],
            top_id,
            current: Some(top_id),
        }
    }

    /// Re-take the surface snapshot: top document first, embedded frames in
    /// attach order (most-recently-attached last). Frame ids are kept
    /// stable across refreshes while position and url both match.
    pub async fn refresh(&mut self) -> Result<&[Surface], RunnerError> {
        let top_url = self.driver.current_url().await.unwrap_or_default();
        let frames = self.driver.frames().await?;

        let mut next = vec![Surface {
            id: self.top_id,
            scope: SurfaceScope::Document,
            url: top_url,
        }];

        for frame in frames {
            let scope = SurfaceScope::Frame(frame.index);
            let id = self
                .surfaces
                .iter()
                .find(|known| known.scope == scope && known.url == frame.url)
                .map(|known| known.id)
                .unwrap_or_else(SurfaceId::new);
            next.push(Surface {
                id,
                scope,
                url: frame.url,
            });
        }

        trace!(surfaces = next.len(), "surface snapshot taken");
        self.surfaces = next;
        Ok(&self.surfaces)
    }

    /// Wait for a content-loaded signal on every surface, up to `timeout`
    /// each. A frame that never signals is best-effort ready: embedded
    /// frames unrelated to the tested flow must not block it.
    pub async fn settle(&mut self, timeout: Duration) -> Result<(), RunnerError> {
        self.refresh().await?;

        for surface in self.surfaces.clone() {
            if let Err(err) = self.wait_content_loaded(&surface, timeout).await {
                debug!(
                    surface = %surface.id,
                    url = %surface.url,
                    %err,
                    "surface did not settle in time, continuing"
                );
            }
        }

        Ok(())
    }

    async fn wait_content_loaded(
        &self,
        surface: &Surface,
        timeout: Duration,
    ) -> Result<(), RunnerError> {
        let poll_interval = Duration::from_millis(100);
        let deadline = Instant::now() + timeout;

        loop {
            let state = self
                .driver
                .ready_state(&surface.scope)
                .await
                .unwrap_or_else(|_| "unreachable".to_string());
            if matches!(state.as_str(), "interactive" | "complete") {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(RunnerError::StepTimeout(format!(
                    "surface stuck in readyState '{state}'"
                )));
            }

            sleep(poll_interval).await;
        }
    }

    /// The surface subsequent lookups address: the one recorded by the last
    /// committed navigation, falling back to the most-recently-attached
    /// surface when the tracked one detached.
    pub fn current(&self) -> Surface {
        if let Some(id) = self.current {
            if let Some(surface) = self.surfaces.iter().find(|s| s.id == id) {
                return surface.clone();
            }
        }

        self.surfaces
            .last()
            .cloned()
            .expect("resolver always holds the top document surface")
    }

    /// Record that a navigation committed on the top document; it becomes
    /// current regardless of frame attach order.
    pub fn note_navigation(&mut self) {
        self.current = Some(self.top_id);
    }

    pub fn top_id(&self) -> SurfaceId {
        self.top_id
    }
}
