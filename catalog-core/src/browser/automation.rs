use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{stream, StreamExt};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};
use super::locator::Locator;
use super::metrics::SessionMetrics;
use super::page::{FetchResponse, PortalPage};

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const TARGET_ATTRIBUTE: &str = "data-catalog-target";
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const SETTLE_INTERVAL: Duration = Duration::from_millis(250);
const SETTLE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const NETWORK_QUIET: Duration = Duration::from_millis(500);

/// Marks the first visible element matching the locator with `TARGET_ATTRIBUTE`.
const RESOLVE_SCRIPT: &str = r#"
((spec) => {
    const attr = 'data-catalog-target';
    const visible = (el) => {
        if (!el || !el.isConnected) return false;
        const style = window.getComputedStyle(el);
        if (style.visibility === 'hidden' || style.display === 'none' || Number(style.opacity) === 0) {
            return false;
        }
        const rect = el.getBoundingClientRect();
        return rect.width > 0 && rect.height > 0;
    };
    let candidates = [];
    try {
        if (spec.kind === 'css') {
            candidates = Array.from(document.querySelectorAll(spec.css));
        } else if (spec.kind === 'xpath') {
            const snapshot = document.evaluate(spec.xpath, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
            for (let i = 0; i < snapshot.snapshotLength; i++) {
                candidates.push(snapshot.snapshotItem(i));
            }
        } else {
            const needle = String(spec.text || '').trim().toLowerCase();
            const textOf = (el) => String(el.innerText || el.textContent || '').trim().toLowerCase();
            candidates = Array.from(document.querySelectorAll(spec.css || 'body *'))
                .filter((el) => textOf(el).includes(needle));
            if (!spec.css) {
                candidates = candidates.filter((el) =>
                    !Array.from(el.children).some((child) => textOf(child).includes(needle)));
            }
        }
    } catch (err) {
        return { found: false, error: String((err && err.message) || err) };
    }
    const target = candidates.find(visible);
    if (!target) return { found: false, error: null };
    document.querySelectorAll('[' + attr + ']').forEach((el) => el.removeAttribute(attr));
    target.setAttribute(attr, spec.token);
    return { found: true, error: null };
})(__SPEC__)
"#;

const FOCUSED_SCRIPT: &str = r#"
((token) => {
    const attr = 'data-catalog-target';
    const el = document.activeElement;
    if (!el || el === document.body) return false;
    document.querySelectorAll('[' + attr + ']').forEach((node) => node.removeAttribute(attr));
    el.setAttribute(attr, token);
    return true;
})(__TOKEN__)
"#;

const SETTLE_SCRIPT: &str = r#"
(() => ({
    ready: document.readyState,
    resources: performance.getEntriesByType('resource').length,
}))()
"#;

const FETCH_SCRIPT: &str = r#"
(async (req) => {
    const controller = new AbortController();
    const timer = setTimeout(() => controller.abort(), req.timeoutMs);
    try {
        const res = await fetch(req.url, {
            method: 'GET',
            credentials: 'include',
            signal: controller.signal,
            headers: { 'accept': 'text/csv, application/octet-stream, */*' },
        });
        const buffer = new Uint8Array(await res.arrayBuffer());
        let binary = '';
        const chunk = 0x8000;
        for (let i = 0; i < buffer.length; i += chunk) {
            binary += String.fromCharCode.apply(null, buffer.subarray(i, i + chunk));
        }
        return {
            status: res.status,
            contentType: res.headers.get('content-type') || '',
            body: btoa(binary),
            error: null,
        };
    } catch (e) {
        return { status: 0, contentType: '', body: '', error: String((e && e.message) || e || 'fetch failed') };
    } finally {
        clearTimeout(timer);
    }
})(__REQUEST__)
"#;

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ChromiumSection>,
    navigation_timeout: Duration,
}

impl BrowserLauncher {
    pub fn new(config: ChromiumSection, navigation_timeout: Duration) -> Self {
        Self {
            config: Arc::new(config),
            navigation_timeout,
        }
    }

    pub async fn launch(&self) -> BrowserResult<BrowserAutomation> {
        let profile_dir = tempfile::Builder::new()
            .prefix("catalog-profile-")
            .tempdir()?;
        let viewport = ViewportSpec {
            width: self.config.viewport[0],
            height: self.config.viewport[1],
        };
        let user_agent = self.select_user_agent();
        let headless = self.config.headless;
        let chromium_config =
            self.build_chromium_config(&profile_dir, &viewport, &user_agent, headless)?;
        info!(
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(BrowserAutomation {
            browser,
            profile_dir: Some(profile_dir),
            handler_task: Some(handler_task),
            metrics: Arc::new(Mutex::new(SessionMetrics::default())),
            navigation_timeout: self.navigation_timeout,
        })
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.config
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }

    fn build_chromium_config(
        &self,
        profile_dir: &TempDir,
        viewport: &ViewportSpec,
        user_agent: &str,
        headless: bool,
    ) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir.path())
            .request_timeout(self.navigation_timeout)
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

/// A running Chromium process with its throwaway profile directory.
#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Browser,
    profile_dir: Option<TempDir>,
    handler_task: Option<JoinHandle<()>>,
    metrics: Arc<Mutex<SessionMetrics>>,
    navigation_timeout: Duration,
}

impl BrowserAutomation {
    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn metrics_handle(&self) -> Arc<Mutex<SessionMetrics>> {
        Arc::clone(&self.metrics)
    }

    pub async fn new_context(&self) -> BrowserResult<BrowserContext> {
        {
            let mut metrics = self.metrics.lock().unwrap();
            metrics.record_page_open();
        }
        let params = CreateTargetParams::new("about:blank");
        let page = timeout(self.navigation_timeout, self.browser.new_page(params))
            .await
            .map_err(|_| BrowserError::Timeout("new page".into()))??;
        let network = Arc::new(Mutex::new(NetworkActivity::new(Instant::now())));
        let network_task = track_network(&page, Arc::clone(&network)).await?;
        Ok(BrowserContext {
            page,
            metrics: Arc::clone(&self.metrics),
            network,
            network_task,
        })
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("shutting down chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "failed waiting for chromium process exit");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        if let Some(dir) = self.profile_dir.take() {
            if let Err(err) = dir.close() {
                warn!(error = %err, "failed to remove browser profile directory");
            }
        }
        Ok(())
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("BrowserAutomation dropped without explicit shutdown");
            }
        }
    }
}

/// Requests the page has started and not yet finished.
#[derive(Debug)]
struct NetworkActivity {
    in_flight: HashSet<String>,
    last_change: Instant,
}

impl NetworkActivity {
    fn new(now: Instant) -> Self {
        Self {
            in_flight: HashSet::new(),
            last_change: now,
        }
    }

    fn request_started(&mut self, id: String, now: Instant) {
        self.in_flight.insert(id);
        self.last_change = now;
    }

    fn request_ended(&mut self, id: &str, now: Instant) {
        if self.in_flight.remove(id) {
            self.last_change = now;
        }
    }

    /// Nothing in flight and no request activity for `quiet`, counted from `since` at the earliest.
    fn is_idle(&self, since: Instant, now: Instant, quiet: Duration) -> bool {
        self.in_flight.is_empty()
            && now.saturating_duration_since(self.last_change.max(since)) >= quiet
    }
}

enum NetworkEvent {
    Started(String),
    Ended(String),
}

async fn track_network(
    page: &Page,
    activity: Arc<Mutex<NetworkActivity>>,
) -> BrowserResult<JoinHandle<()>> {
    let started = page
        .event_listener::<EventRequestWillBeSent>()
        .await?
        .map(|event| NetworkEvent::Started(event.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await?
        .map(|event| NetworkEvent::Ended(event.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await?
        .map(|event| NetworkEvent::Ended(event.request_id.inner().clone()));
    let mut events = Box::pin(stream::select(started, stream::select(finished, failed)));

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let now = Instant::now();
            let mut activity = activity.lock().unwrap();
            match event {
                NetworkEvent::Started(id) => activity.request_started(id, now),
                NetworkEvent::Ended(id) => activity.request_ended(&id, now),
            }
        }
    }))
}

/// One page (tab) of a running browser.
#[derive(Debug)]
pub struct BrowserContext {
    page: Page,
    metrics: Arc<Mutex<SessionMetrics>>,
    network: Arc<Mutex<NetworkActivity>>,
    network_task: JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct ResolveResult {
    found: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettleProbe {
    ready: String,
    resources: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResult {
    status: u16,
    content_type: String,
    body: String,
    error: Option<String>,
}

impl BrowserContext {
    pub fn with_metrics<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut SessionMetrics) -> R,
    {
        let mut guard = self.metrics.lock().unwrap();
        f(&mut guard)
    }

    pub async fn close(self) -> BrowserResult<()> {
        self.network_task.abort();
        self.page.close().await?;
        Ok(())
    }

    /// Marks the first visible match of `locator`; returns the marker token when found.
    async fn resolve(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        let token = Uuid::new_v4().simple().to_string();
        let spec = serde_json::to_string(&locator.spec(&token))
            .map_err(|err| BrowserError::Unexpected(err.to_string()))?;
        let script = RESOLVE_SCRIPT.replace("__SPEC__", &spec);
        let result: ResolveResult = self
            .page
            .evaluate(script.as_str())
            .await?
            .into_value()
            .map_err(|err| {
                BrowserError::Unexpected(format!("failed to decode selector probe: {err}"))
            })?;
        if let Some(error) = result.error {
            return Err(BrowserError::Unexpected(format!(
                "selector {locator} rejected by page: {error}"
            )));
        }
        Ok(result.found.then_some(token))
    }

    async fn marked_element(
        &self,
        locator: &Locator,
    ) -> BrowserResult<chromiumoxide::element::Element> {
        let token = self.resolve(locator).await?.ok_or_else(|| {
            BrowserError::Unexpected(format!("selector {locator} no longer matches"))
        })?;
        let element = self
            .page
            .find_element(format!("[{TARGET_ATTRIBUTE}=\"{token}\"]"))
            .await?;
        Ok(element)
    }
}

#[async_trait(?Send)]
impl PortalPage for BrowserContext {
    async fn goto(&mut self, url: &str, limit: Duration) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let navigation = async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok::<(), chromiumoxide::error::CdpError>(())
        };
        match timeout(limit, navigation).await {
            Ok(Ok(())) => {
                self.with_metrics(|metrics| metrics.record_navigation());
                debug!(%url, "navigation complete");
                Ok(())
            }
            Ok(Err(err)) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            }),
            Err(_) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason: format!("timed out after {}ms", limit.as_millis()),
            }),
        }
    }

    async fn is_visible(&mut self, locator: &Locator, limit: Duration) -> BrowserResult<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if self.resolve(locator).await?.is_some() {
                self.with_metrics(|metrics| metrics.record_probe(true));
                return Ok(true);
            }
            if Instant::now() + PROBE_INTERVAL > deadline {
                self.with_metrics(|metrics| metrics.record_probe(false));
                return Ok(false);
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()> {
        let element = self.marked_element(locator).await?;
        element.scroll_into_view().await?;
        element.click().await?;
        Ok(())
    }

    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()> {
        let element = self.marked_element(locator).await?;
        element.click().await?;
        self.page
            .evaluate(format!(
                "(() => {{ const el = document.querySelector('[{TARGET_ATTRIBUTE}]'); if (el) {{ el.value = ''; }} }})()"
            ))
            .await?;
        element.type_str(value).await?;
        Ok(())
    }

    async fn press_enter(&mut self) -> BrowserResult<()> {
        let token = Uuid::new_v4().simple().to_string();
        let token_json = serde_json::to_string(&token)
            .map_err(|err| BrowserError::Unexpected(err.to_string()))?;
        let focused: bool = self
            .page
            .evaluate(FOCUSED_SCRIPT.replace("__TOKEN__", &token_json).as_str())
            .await?
            .into_value()
            .map_err(|err| BrowserError::Unexpected(err.to_string()))?;
        if !focused {
            return Err(BrowserError::Unexpected(
                "no focused element to press Enter in".into(),
            ));
        }
        let element = self
            .page
            .find_element(format!("[{TARGET_ATTRIBUTE}=\"{token}\"]"))
            .await?;
        element.press_key("Enter").await?;
        Ok(())
    }

    /// Settled means the document finished loading, its resource count held across two
    /// probes, and the network has been quiet since the wait began. Probe errors while a
    /// navigation swaps the document count as not settled.
    async fn wait_for_settle(&mut self, limit: Duration) -> BrowserResult<()> {
        let started = Instant::now();
        let deadline = started + limit;
        let mut last_count: Option<u64> = None;
        loop {
            let evaluation = timeout(SETTLE_PROBE_TIMEOUT, self.page.evaluate(SETTLE_SCRIPT)).await;
            let probe = match evaluation {
                Ok(Ok(result)) => result.into_value::<SettleProbe>().ok(),
                Ok(Err(err)) => {
                    debug!(error = %err, "settle probe failed while page is navigating");
                    None
                }
                Err(_) => None,
            };
            let now = Instant::now();
            let network_idle = self
                .network
                .lock()
                .unwrap()
                .is_idle(started, now, NETWORK_QUIET);
            match probe {
                Some(probe) if probe.ready == "complete" => {
                    if network_idle && last_count == Some(probe.resources) {
                        return Ok(());
                    }
                    last_count = Some(probe.resources);
                }
                _ => last_count = None,
            }
            if now >= deadline {
                return Err(BrowserError::Timeout("page to settle".into()));
            }
            sleep(SETTLE_INTERVAL).await;
        }
    }

    async fn current_url(&mut self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn fetch(&mut self, url: &str, limit: Duration) -> BrowserResult<FetchResponse> {
        let request = serde_json::json!({
            "url": url,
            "timeoutMs": limit.as_millis() as u64,
        });
        let script = FETCH_SCRIPT.replace("__REQUEST__", &request.to_string());
        // The in-page AbortController bounds the request; this bounds the CDP round trip.
        let evaluation = timeout(limit + Duration::from_secs(5), self.page.evaluate(script))
            .await
            .map_err(|_| BrowserError::Timeout(format!("export fetch from {url}")))??;
        let result: FetchResult = evaluation
            .into_value()
            .map_err(|err| BrowserError::Fetch(format!("failed to decode fetch result: {err}")))?;
        if let Some(error) = result.error {
            return Err(BrowserError::Fetch(error));
        }
        let body = BASE64
            .decode(result.body.as_bytes())
            .map_err(|err| BrowserError::Fetch(format!("invalid response encoding: {err}")))?;
        Ok(FetchResponse {
            status: result.status,
            content_type: result.content_type,
            body,
        })
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(true).build();
        let bytes = self.page.screenshot(params).await?;
        self.with_metrics(|metrics| metrics.record_screenshot());
        Ok(bytes)
    }
}
