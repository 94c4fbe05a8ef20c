//! Single-session CDP driver.
//!
//! Wraps the transport with the capability surface the runner needs: one
//! isolated browser context, one attached page, commit-level navigation,
//! frame enumeration, element queries and interactions, and diagnostics.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use pagerun_core_types::Locator;

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind};
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget};

/// Which document a query or interaction addresses: the top document or the
/// n-th embedded frame (in `iframe,frame` attach order).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SurfaceScope {
    Document,
    Frame(usize),
}

/// One embedded frame discovered during enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHandle {
    pub index: usize,
    pub url: String,
}

/// One matched element: viewport-absolute center plus a visibility flag.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementHit {
    pub x: f64,
    pub y: f64,
    pub visible: bool,
}

/// Capability surface the runner layers wire against.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Issue a direct address change and return once the navigation is
    /// committed (request accepted), not once rendering completes.
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// Snapshot of currently attached embedded frames, attach order.
    async fn frames(&self) -> Result<Vec<FrameHandle>, DriverError>;

    /// `document.readyState` for the scope; "unreachable" when the scoped
    /// document cannot be addressed (cross-origin or detached frame).
    async fn ready_state(&self, scope: &SurfaceScope) -> Result<String, DriverError>;

    async fn query(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
    ) -> Result<Vec<ElementHit>, DriverError>;

    async fn click(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
        deadline: Duration,
    ) -> Result<(), DriverError>;

    async fn fill(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
        text: &str,
        deadline: Duration,
    ) -> Result<(), DriverError>;

    /// Text content of the n-th match, `None` when the match is absent.
    async fn text_content(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
    ) -> Result<Option<String>, DriverError>;

    /// Advance the viewport by a wheel delta, positive y scrolls down.
    async fn scroll_by(&self, delta_x: f64, delta_y: f64) -> Result<(), DriverError>;

    async fn viewport_height(&self) -> Result<f64, DriverError>;

    /// Rendered text of the scoped document, for diagnostics.
    async fn page_text(&self, scope: &SurfaceScope) -> Result<String, DriverError>;

    /// PNG capture of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Close page and context. Safe to call more than once.
    async fn close(&self) -> Result<(), DriverError>;
}

#[derive(Clone, Debug)]
struct Attached {
    browser_context_id: String,
    target_id: String,
    cdp_session: String,
}

/// Driver implementation backed by a chromium devtools connection.
pub struct CdpDriver {
    cfg: DriverConfig,
    transport: Arc<dyn CdpTransport>,
    attached: Mutex<Option<Attached>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl CdpDriver {
    /// Launch a browser process and attach to one page in a fresh,
    /// isolated browser context.
    pub async fn launch(cfg: DriverConfig) -> Result<Arc<Self>, DriverError> {
        let transport = Arc::new(ChromiumTransport::new(cfg.clone()));
        Self::with_transport(cfg, transport).await
    }

    /// Same attach sequence over an injected transport.
    pub async fn with_transport(
        cfg: DriverConfig,
        transport: Arc<dyn CdpTransport>,
    ) -> Result<Arc<Self>, DriverError> {
        transport.start().await?;

        // 1. Isolated context: no shared cookies/storage with other sessions.
        let response = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": true }),
            )
            .await?;
        let browser_context_id = string_field(&response, "browserContextId")?;

        // 2. One page inside that context.
        let response = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": browser_context_id }),
            )
            .await?;
        let target_id = string_field(&response, "targetId")?;

        // 3. Flat session so page commands can be routed directly.
        let response = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let cdp_session = string_field(&response, "sessionId")?;

        let driver = Arc::new(Self {
            cfg,
            transport,
            attached: Mutex::new(Some(Attached {
                browser_context_id,
                target_id,
                cdp_session,
            })),
            event_task: Mutex::new(None),
        });

        driver.page_command("Page.enable", json!({})).await?;
        driver.page_command("Runtime.enable", json!({})).await?;

        driver.spawn_event_drain();

        info!(target: "cdp-driver", "page attached in isolated context");
        Ok(driver)
    }

    /// Keep the transport's event channel drained; lifecycle events are only
    /// interesting as trace output here.
    fn spawn_event_drain(self: &Arc<Self>) {
        let transport = Arc::clone(&self.transport);
        let task = tokio::spawn(async move {
            while let Some(event) = transport.next_event().await {
                match event.method.as_str() {
                    "Page.frameNavigated" | "Page.frameAttached" | "Page.frameDetached" => {
                        debug!(target: "cdp-driver", method = %event.method, "frame lifecycle");
                    }
                    _ => {}
                }
            }
        });
        if let Ok(mut guard) = self.event_task.lock() {
            *guard = Some(task);
        }
    }

    fn attached(&self) -> Result<Attached, DriverError> {
        self.attached
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| {
                DriverError::new(DriverErrorKind::Internal).with_hint("driver not attached")
            })
    }

    async fn page_command(&self, method: &str, params: Value) -> Result<Value, DriverError> {
        let attached = self.attached()?;
        self.transport
            .send_command(CommandTarget::Session(attached.cdp_session), method, params)
            .await
    }

    /// Evaluate an expression in the page, returning its JSON value.
    async fn evaluate(&self, expression: String) -> Result<Value, DriverError> {
        let response = self
            .page_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                }),
            )
            .await?;

        Ok(response
            .get("result")
            .and_then(|res| res.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Preamble resolving `scopeDoc` plus the viewport offset of the scoped
    /// document. For frames the offset is the frame element's own rect, so
    /// element centers come out in top-viewport coordinates.
    fn scope_preamble(scope: &SurfaceScope) -> String {
        match scope {
            SurfaceScope::Document => {
                "let scopeDoc = document;\n    let offsetX = 0, offsetY = 0;".to_string()
            }
            SurfaceScope::Frame(index) => format!(
                "let scopeDoc = null;\n    let offsetX = 0, offsetY = 0;\n    {{\n        const frameEl = document.querySelectorAll('iframe,frame')[{index}];\n        if (frameEl) {{\n            try {{\n                scopeDoc = frameEl.contentDocument || (frameEl.contentWindow ? frameEl.contentWindow.document : null);\n            }} catch (err) {{\n                scopeDoc = null;\n            }}\n            const frameRect = frameEl.getBoundingClientRect();\n            offsetX = frameRect.left;\n            offsetY = frameRect.top;\n        }}\n    }}",
            ),
        }
    }

    /// Expression collecting the locator's matches (an element array) out of
    /// `scopeDoc`.
    fn collect_expression(locator: &Locator) -> Result<String, DriverError> {
        let literal = |value: &str| {
            serde_json::to_string(value).map_err(|err| {
                DriverError::new(DriverErrorKind::Internal).with_hint(err.to_string())
            })
        };

        match locator {
            Locator::Css(selector) => {
                let selector = literal(selector)?;
                Ok(format!(
                    "(() => {{ try {{ return Array.from(scopeDoc.querySelectorAll({selector})); }} catch (err) {{ return []; }} }})()"
                ))
            }
            Locator::XPath(path) => {
                let path = literal(path)?;
                Ok(Self::xpath_collect(&path))
            }
            Locator::Text { content, exact } => {
                let needle = literal(content)?;
                let path = if *exact {
                    format!(".//*[text()[normalize-space(.)={needle}]]")
                } else {
                    format!(".//*[text()[contains(normalize-space(.), {needle})]]")
                };
                let path = literal(&path)?;
                Ok(Self::xpath_collect(&path))
            }
        }
    }

    fn xpath_collect(path_literal: &str) -> String {
        format!(
            "(() => {{\n        const out = [];\n        try {{\n            const result = scopeDoc.evaluate({path_literal}, scopeDoc, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);\n            for (let i = 0; i < result.snapshotLength; i++) {{ out.push(result.snapshotItem(i)); }}\n        }} catch (err) {{}}\n        return out;\n    }})()"
        )
    }

    fn query_expression(scope: &SurfaceScope, locator: &Locator) -> Result<String, DriverError> {
        let preamble = Self::scope_preamble(scope);
        let collect = Self::collect_expression(locator)?;
        Ok(format!(
            "(() => {{\n    {preamble}\n    if (!scopeDoc) {{ return []; }}\n    const elements = {collect};\n    return elements.map((el) => {{\n        if (!el || el.nodeType !== 1) {{ return null; }}\n        const rect = el.getBoundingClientRect();\n        const view = el.ownerDocument.defaultView;\n        const style = view ? view.getComputedStyle(el) : null;\n        const visible = rect.width > 0 && rect.height > 0\n            && (!style || (style.visibility !== 'hidden' && style.display !== 'none'));\n        return {{\n            x: (Number.isFinite(rect.left) ? rect.left + rect.width / 2 : 0) + offsetX,\n            y: (Number.isFinite(rect.top) ? rect.top + rect.height / 2 : 0) + offsetY,\n            visible,\n        }};\n    }}).filter(Boolean);\n}})()"
        ))
    }

    fn focus_expression(
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
    ) -> Result<String, DriverError> {
        let preamble = Self::scope_preamble(scope);
        let collect = Self::collect_expression(locator)?;
        Ok(format!(
            "(() => {{\n    {preamble}\n    if (!scopeDoc) {{ return {{ status: 'not-found' }}; }}\n    const candidates = {collect};\n    const el = candidates[{index}];\n    if (!el) {{ return {{ status: 'not-found' }}; }}\n    if (typeof el.focus === 'function') {{ el.focus(); }}\n    if (typeof el.select === 'function') {{ try {{ el.select(); }} catch (err) {{}} }}\n    return {{ status: 'focused' }};\n}})()"
        ))
    }

    /// Poll the query until the requested match exists or the deadline
    /// elapses.
    async fn wait_for_hit(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
        deadline: Duration,
    ) -> Result<ElementHit, DriverError> {
        let poll_interval = Duration::from_millis(100);
        let deadline_at = Instant::now() + deadline;
        loop {
            let hits = self.query(scope, locator).await?;
            if let Some(hit) = hits.get(index) {
                return Ok(hit.clone());
            }

            if Instant::now() >= deadline_at {
                return Err(DriverError::new(DriverErrorKind::TargetNotFound)
                    .with_hint(format!("no match for {locator} (index {index})")));
            }

            sleep(poll_interval).await;
        }
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, DriverError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("response missing '{field}'"))
        })
}

fn parse_hits(value: Value) -> Result<Vec<ElementHit>, DriverError> {
    let entries = value.as_array().ok_or_else(|| {
        DriverError::new(DriverErrorKind::Internal).with_hint("query did not return an array value")
    })?;

    let mut hits = Vec::with_capacity(entries.len());
    for entry in entries {
        let obj = entry.as_object().ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint("query entry was not an object")
        })?;
        let x = obj.get("x").and_then(|v| v.as_f64()).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint("query entry missing 'x'")
        })?;
        let y = obj.get("y").and_then(|v| v.as_f64()).ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal).with_hint("query entry missing 'y'")
        })?;
        let visible = obj.get("visible").and_then(|v| v.as_bool()).unwrap_or(false);
        hits.push(ElementHit { x, y, visible });
    }

    Ok(hits)
}

#[async_trait]
impl Driver for CdpDriver {
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), DriverError> {
        let commit = self.page_command("Page.navigate", json!({ "url": url }));
        let response = tokio::time::timeout(deadline, commit).await.map_err(|_| {
            DriverError::new(DriverErrorKind::NavTimeout)
                .with_hint(format!("navigation to {url} not committed in time"))
        })??;

        // Page.navigate resolves on commit; errorText means the request was
        // rejected rather than accepted.
        if let Some(error_text) = response.get("errorText").and_then(|v| v.as_str()) {
            if !error_text.is_empty() {
                return Err(DriverError::new(DriverErrorKind::CdpIo)
                    .with_hint(format!("navigation to {url} failed: {error_text}")));
            }
        }

        debug!(target: "cdp-driver", url = %url, "navigation committed");
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let value = self.evaluate("window.location.href".to_string()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn frames(&self) -> Result<Vec<FrameHandle>, DriverError> {
        let expression = "(() => {\n    return Array.from(document.querySelectorAll('iframe,frame'), (el, idx) => {\n        let url = '';\n        try {\n            url = el.contentWindow && el.contentWindow.location ? String(el.contentWindow.location.href) : (el.src || '');\n        } catch (err) {\n            url = el.src || '';\n        }\n        return { index: idx, url };\n    });\n})()".to_string();

        let value = self.evaluate(expression).await?;
        let entries = value.as_array().cloned().unwrap_or_default();

        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            let index = entry
                .get("index")
                .and_then(|v| v.as_u64())
                .unwrap_or(frames.len() as u64) as usize;
            let url = entry
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            frames.push(FrameHandle { index, url });
        }

        Ok(frames)
    }

    async fn ready_state(&self, scope: &SurfaceScope) -> Result<String, DriverError> {
        let preamble = Self::scope_preamble(scope);
        let expression = format!(
            "(() => {{\n    {preamble}\n    return scopeDoc ? scopeDoc.readyState : 'unreachable';\n}})()"
        );
        let value = self.evaluate(expression).await?;
        Ok(value.as_str().unwrap_or("unreachable").to_string())
    }

    async fn query(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
    ) -> Result<Vec<ElementHit>, DriverError> {
        let expression = Self::query_expression(scope, locator)?;
        let value = self.evaluate(expression).await?;
        parse_hits(value)
    }

    async fn click(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
        deadline: Duration,
    ) -> Result<(), DriverError> {
        let hit = self.wait_for_hit(scope, locator, index, deadline).await?;

        let press_payload = json!({
            "type": "mousePressed",
            "x": hit.x,
            "y": hit.y,
            "button": "left",
            "buttons": 1,
            "clickCount": 1,
            "pointerType": "mouse",
        });
        self.page_command("Input.dispatchMouseEvent", press_payload)
            .await?;

        let release_payload = json!({
            "type": "mouseReleased",
            "x": hit.x,
            "y": hit.y,
            "button": "left",
            "buttons": 1,
            "clickCount": 1,
            "pointerType": "mouse",
        });
        self.page_command("Input.dispatchMouseEvent", release_payload)
            .await?;
        Ok(())
    }

    async fn fill(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
        text: &str,
        deadline: Duration,
    ) -> Result<(), DriverError> {
        let expression = Self::focus_expression(scope, locator, index)?;
        let retry_interval = Duration::from_millis(100);
        let deadline_at = Instant::now() + deadline;

        loop {
            let value = self.evaluate(expression.clone()).await?;
            let status = value
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            match status {
                "focused" => break,
                "not-found" => {
                    if Instant::now() >= deadline_at {
                        return Err(DriverError::new(DriverErrorKind::TargetNotFound)
                            .with_hint(format!(
                                "no match for {locator} (index {index}) before deadline"
                            )));
                    }
                    sleep(retry_interval).await;
                }
                other => {
                    return Err(DriverError::new(DriverErrorKind::Internal).with_hint(format!(
                        "failed to focus element for {locator} (status: {other})"
                    )));
                }
            }
        }

        // insertText replaces the selection made by focus/select, so the
        // field ends up holding exactly `text`.
        self.page_command("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn text_content(
        &self,
        scope: &SurfaceScope,
        locator: &Locator,
        index: usize,
    ) -> Result<Option<String>, DriverError> {
        let preamble = Self::scope_preamble(scope);
        let collect = Self::collect_expression(locator)?;
        let expression = format!(
            "(() => {{\n    {preamble}\n    if (!scopeDoc) {{ return null; }}\n    const candidates = {collect};\n    const el = candidates[{index}];\n    if (!el) {{ return null; }}\n    return el.textContent;\n}})()"
        );
        let value = self.evaluate(expression).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    async fn scroll_by(&self, delta_x: f64, delta_y: f64) -> Result<(), DriverError> {
        let x = f64::from(self.cfg.viewport.width) / 2.0;
        let y = f64::from(self.cfg.viewport.height) / 2.0;
        let payload = json!({
            "type": "mouseWheel",
            "x": x,
            "y": y,
            "deltaX": delta_x,
            "deltaY": delta_y,
            "pointerType": "mouse",
        });
        self.page_command("Input.dispatchMouseEvent", payload)
            .await
            .map(|_| ())
    }

    async fn viewport_height(&self) -> Result<f64, DriverError> {
        let value = self.evaluate("window.innerHeight".to_string()).await?;
        value.as_f64().ok_or_else(|| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint("window.innerHeight was not a number")
        })
    }

    async fn page_text(&self, scope: &SurfaceScope) -> Result<String, DriverError> {
        let preamble = Self::scope_preamble(scope);
        let expression = format!(
            "(() => {{\n    {preamble}\n    if (!scopeDoc || !scopeDoc.body) {{ return ''; }}\n    return scopeDoc.body.innerText;\n}})()"
        );
        let value = self.evaluate(expression).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let response = self
            .page_command("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = string_field(&response, "data")?;
        STANDARD.decode(data).map_err(|err| {
            DriverError::new(DriverErrorKind::Internal)
                .with_hint(format!("screenshot payload was not base64: {err}"))
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        let attached = match self.attached.lock().ok().and_then(|mut g| g.take()) {
            Some(attached) => attached,
            None => return Ok(()),
        };

        if let Ok(mut guard) = self.event_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }

        // Page first, then its context; a failure on one does not skip the
        // other.
        let close_result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.closeTarget",
                json!({ "targetId": attached.target_id }),
            )
            .await;
        if let Err(err) = &close_result {
            warn!(target: "cdp-driver", ?err, "failed to close page target");
        }

        let dispose_result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.disposeBrowserContext",
                json!({ "browserContextId": attached.browser_context_id }),
            )
            .await;
        if let Err(err) = &dispose_result {
            warn!(target: "cdp-driver", ?err, "failed to dispose browser context");
        }

        close_result.and(dispose_result).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    /// Transport stub that records every command and replays canned
    /// responses per method.
    struct RecordingTransport {
        commands: StdMutex<Vec<(CommandTarget, String, Value)>>,
        responses: StdMutex<HashMap<String, VecDeque<Value>>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                commands: StdMutex::new(Vec::new()),
                responses: StdMutex::new(HashMap::new()),
            }
        }

        fn respond(&self, method: &str, value: Value) {
            self.responses
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_default()
                .push_back(value);
        }

        fn recorded(&self) -> Vec<(String, Value)> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|(_, method, params)| (method.clone(), params.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl CdpTransport for RecordingTransport {
        async fn start(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn next_event(&self) -> Option<crate::transport::TransportEvent> {
            None
        }

        async fn send_command(
            &self,
            target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, DriverError> {
            self.commands
                .lock()
                .unwrap()
                .push((target, method.to_string(), params));
            let canned = self
                .responses
                .lock()
                .unwrap()
                .get_mut(method)
                .and_then(|queue| queue.pop_front());
            Ok(canned.unwrap_or_else(|| json!({})))
        }
    }

    fn attach_responses(transport: &RecordingTransport) {
        transport.respond(
            "Target.createBrowserContext",
            json!({ "browserContextId": "ctx-1" }),
        );
        transport.respond("Target.createTarget", json!({ "targetId": "t-1" }));
        transport.respond("Target.attachToTarget", json!({ "sessionId": "s-1" }));
    }

    async fn attached_driver() -> (Arc<CdpDriver>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        attach_responses(&transport);
        let driver = CdpDriver::with_transport(DriverConfig::default(), transport.clone())
            .await
            .expect("attach");
        (driver, transport)
    }

    #[tokio::test]
    async fn launch_attaches_page_in_isolated_context() {
        let (_driver, transport) = attached_driver().await;

        let methods: Vec<String> = transport
            .recorded()
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(
            &methods[..3],
            &[
                "Target.createBrowserContext".to_string(),
                "Target.createTarget".to_string(),
                "Target.attachToTarget".to_string(),
            ]
        );
        assert!(methods.contains(&"Page.enable".to_string()));
        assert!(methods.contains(&"Runtime.enable".to_string()));

        let create_target = transport
            .recorded()
            .into_iter()
            .find(|(method, _)| method == "Target.createTarget")
            .unwrap();
        assert_eq!(
            create_target.1.get("browserContextId").and_then(|v| v.as_str()),
            Some("ctx-1")
        );
    }

    #[tokio::test]
    async fn page_commands_route_through_attached_session() {
        let (driver, transport) = attached_driver().await;

        driver.scroll_by(0.0, 720.0).await.unwrap();

        let wheel = transport
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|(_, method, _)| method == "Input.dispatchMouseEvent")
            .map(|(target, _, _)| target.clone())
            .unwrap();
        assert!(matches!(wheel, CommandTarget::Session(ref id) if id == "s-1"));
    }

    #[tokio::test]
    async fn click_dispatches_press_then_release_at_hit_center() {
        let (driver, transport) = attached_driver().await;
        transport.respond(
            "Runtime.evaluate",
            json!({ "result": { "value": [{ "x": 40.0, "y": 60.0, "visible": true }] } }),
        );

        driver
            .click(
                &SurfaceScope::Document,
                &Locator::Css("button.submit".into()),
                0,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let mouse_events: Vec<Value> = transport
            .recorded()
            .into_iter()
            .filter(|(method, _)| method == "Input.dispatchMouseEvent")
            .map(|(_, params)| params)
            .collect();
        assert_eq!(mouse_events.len(), 2);
        assert_eq!(
            mouse_events[0].get("type").and_then(|v| v.as_str()),
            Some("mousePressed")
        );
        assert_eq!(
            mouse_events[1].get("type").and_then(|v| v.as_str()),
            Some("mouseReleased")
        );
        assert_eq!(mouse_events[0].get("x").and_then(|v| v.as_f64()), Some(40.0));
        assert_eq!(mouse_events[1].get("y").and_then(|v| v.as_f64()), Some(60.0));
    }

    #[tokio::test]
    async fn click_times_out_when_no_match_appears() {
        let (driver, transport) = attached_driver().await;
        // Every poll sees an empty match list.
        for _ in 0..4 {
            transport.respond("Runtime.evaluate", json!({ "result": { "value": [] } }));
        }

        let err = driver
            .click(
                &SurfaceScope::Document,
                &Locator::Css("#missing".into()),
                0,
                Duration::from_millis(150),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fill_focuses_then_inserts_text() {
        let (driver, transport) = attached_driver().await;
        transport.respond(
            "Runtime.evaluate",
            json!({ "result": { "value": { "status": "focused" } } }),
        );

        driver
            .fill(
                &SurfaceScope::Document,
                &Locator::XPath("html/body/div/form/input".into()),
                0,
                "a@b.com",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let recorded = transport.recorded();
        let focus = recorded
            .iter()
            .find(|(method, _)| method == "Runtime.evaluate")
            .unwrap();
        let focus_expression = focus
            .1
            .get("expression")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        assert!(focus_expression.contains("XPathResult"));

        let insert = recorded
            .iter()
            .find(|(method, _)| method == "Input.insertText")
            .unwrap();
        assert_eq!(insert.1.get("text").and_then(|v| v.as_str()), Some("a@b.com"));
    }

    #[tokio::test]
    async fn navigate_surfaces_commit_errors() {
        let (driver, transport) = attached_driver().await;
        transport.respond(
            "Page.navigate",
            json!({ "frameId": "f-1", "errorText": "net::ERR_CONNECTION_REFUSED" }),
        );

        let err = driver
            .navigate("http://localhost:9", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ERR_CONNECTION_REFUSED"));
    }

    #[tokio::test]
    async fn query_reports_visibility_per_hit() {
        let (driver, transport) = attached_driver().await;
        transport.respond(
            "Runtime.evaluate",
            json!({ "result": { "value": [
                { "x": 10.0, "y": 10.0, "visible": true },
                { "x": 0.0, "y": 0.0, "visible": false },
            ] } }),
        );

        let hits = driver
            .query(&SurfaceScope::Document, &Locator::text("Welcome"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].visible);
        assert!(!hits[1].visible);
    }

    #[tokio::test]
    async fn frame_scope_queries_address_the_frame_document() {
        let (driver, transport) = attached_driver().await;
        transport.respond("Runtime.evaluate", json!({ "result": { "value": [] } }));

        driver
            .query(&SurfaceScope::Frame(2), &Locator::Css("input".into()))
            .await
            .unwrap();

        let expression = transport
            .recorded()
            .into_iter()
            .find(|(method, _)| method == "Runtime.evaluate")
            .and_then(|(_, params)| {
                params
                    .get("expression")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap();
        assert!(expression.contains("querySelectorAll('iframe,frame')[2]"));
        assert!(expression.contains("contentDocument"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (driver, transport) = attached_driver().await;

        driver.close().await.unwrap();
        driver.close().await.unwrap();

        let closes = transport
            .recorded()
            .into_iter()
            .filter(|(method, _)| method == "Target.closeTarget")
            .count();
        assert_eq!(closes, 1);
    }
}
