//! Chromium over the DevTools protocol.
//!
//! Element work is done with small injected scripts rather than CDP node
//! handles: the page re-renders aggressively and node ids go stale between
//! probe and click. Waits poll from the Rust side so every deadline is a
//! `tokio::time` deadline.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DriverError, DriverLauncher, ElementState, Locator, PageDriver, TextMatch};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Resource count must hold still this long for the network to count as idle.
const IDLE_QUIET_PERIOD: Duration = Duration::from_millis(1000);
/// DevTools requests may run this much longer than the longest stage wait,
/// so a slow load surfaces as the stage's own timeout.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

fn protocol(err: impl std::fmt::Display) -> DriverError {
    DriverError::Protocol(err.to_string())
}

fn from_cdp(err: CdpError, what: impl Into<String>, after: Duration) -> DriverError {
    match err {
        CdpError::Timeout => DriverError::Timeout {
            what: what.into(),
            after,
        },
        other => protocol(other),
    }
}

/// Launches a fresh headless Chromium per cycle.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub headless: bool,
    /// Upper bound on any single DevTools request.
    pub request_timeout: Duration,
}

impl ChromeLauncher {
    /// `stage_budget` is the longest wait any navigation stage makes.
    pub fn new(headless: bool, stage_budget: Duration) -> Self {
        Self {
            headless,
            request_timeout: stage_budget + REQUEST_TIMEOUT_MARGIN,
        }
    }
}

#[async_trait]
impl DriverLauncher for ChromeLauncher {
    type Driver = ChromeDriver;

    async fn launch(&self) -> Result<ChromeDriver, DriverError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .request_timeout(self.request_timeout);
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::Launch)?;

        let (mut browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            DriverError::Launch(format!(
                "{e}. Ensure google-chrome or chromium is installed and on PATH"
            ))
        })?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.close().await;
                handler_task.abort();
                return Err(DriverError::Launch(format!("failed to open a tab: {e}")));
            }
        };

        info!(headless = self.headless, "browser session started");
        Ok(ChromeDriver {
            page,
            request_timeout: self.request_timeout,
            session: Mutex::new(Session {
                browser,
                handler_task: Some(handler_task),
            }),
        })
    }
}

struct Session {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
}

pub struct ChromeDriver {
    page: Page,
    request_timeout: Duration,
    session: Mutex<Session>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Presence {
    Missing,
    Hidden,
    Visible,
}

impl Presence {
    fn satisfies(self, state: ElementState) -> bool {
        match state {
            ElementState::Visible => self == Presence::Visible,
            ElementState::Attached => self != Presence::Missing,
            ElementState::Detached => self == Presence::Missing,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextProbe {
    found: bool,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoadProbe {
    ready: bool,
    resources: u64,
}

/// Whether a presence probe shows `state` reached. A failed probe is
/// "not yet": evaluation errors while a click navigates the page.
fn reached(probe: Result<Presence, DriverError>, state: ElementState) -> bool {
    match probe {
        Ok(presence) => presence.satisfies(state),
        Err(e) => {
            debug!(error = %e, "presence probe failed; polling again");
            false
        }
    }
}

/// Tracks how long the resource count has held still.
#[derive(Debug, Default)]
struct IdleTracker {
    last: Option<u64>,
    quiet: Duration,
}

impl IdleTracker {
    /// Feed one probe taken `IDLE_POLL_INTERVAL` after the previous one.
    /// Returns true once the page has been quiet for the full period.
    fn observe(&mut self, probe: Result<LoadProbe, DriverError>) -> bool {
        let probe = match probe {
            Ok(probe) => probe,
            Err(e) => {
                debug!(error = %e, "load probe failed; polling again");
                *self = Self::default();
                return false;
            }
        };
        if probe.ready && self.last == Some(probe.resources) {
            self.quiet += IDLE_POLL_INTERVAL;
        } else {
            self.quiet = Duration::ZERO;
        }
        self.last = Some(probe.resources);
        self.quiet >= IDLE_QUIET_PERIOD
    }
}

/// Quote a Rust string as a JavaScript string literal.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_owned()).to_string()
}

/// A script expression evaluating to the located element or `null`.
fn locate_js(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!("document.querySelector({})", js_string(selector)),
        Locator::Text {
            tag,
            text,
            matching,
        } => {
            let scope = js_string(tag.as_deref().unwrap_or("*"));
            let needle = js_string(text);
            let test = match matching {
                TextMatch::Exact => "norm(e.textContent) === needle",
                TextMatch::Contains => {
                    "norm(e.textContent).toLowerCase().includes(needle.toLowerCase())"
                }
            };
            // Any-element matches want the innermost hit, not <body>. A tag
            // scope already pins the element, whatever its label is wrapped in.
            let pick = match tag {
                Some(_) => "hits[0]",
                None => "hits.find((e) => !Array.from(e.children).some(hit))",
            };
            format!(
                r#"(() => {{
    const needle = {needle};
    const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
    const hit = (e) => {test};
    const hits = Array.from(document.querySelectorAll({scope})).filter(hit);
    return {pick} || null;
}})()"#
            )
        }
    }
}

fn presence_js(locator: &Locator) -> String {
    format!(
        r#"(() => {{
    const el = {el};
    if (!el) return 'missing';
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    const shown = rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none';
    return shown ? 'visible' : 'hidden';
}})()"#,
        el = locate_js(locator)
    )
}

fn click_js(locator: &Locator) -> String {
    format!(
        r#"(() => {{
    const el = {el};
    if (!el) return false;
    el.scrollIntoView({{ block: 'center' }});
    el.click();
    return true;
}})()"#,
        el = locate_js(locator)
    )
}

fn fill_js(locator: &Locator, value: &str) -> String {
    format!(
        r#"(() => {{
    const el = {el};
    if (!el) return false;
    el.focus();
    const proto = el instanceof HTMLTextAreaElement
        ? HTMLTextAreaElement.prototype
        : HTMLInputElement.prototype;
    Object.getOwnPropertyDescriptor(proto, 'value').set.call(el, {value});
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}})()"#,
        el = locate_js(locator),
        value = js_string(value)
    )
}

fn text_js(locator: &Locator) -> String {
    format!(
        r#"(() => {{
    const el = {el};
    return el ? {{ found: true, text: el.textContent }} : {{ found: false, text: null }};
}})()"#,
        el = locate_js(locator)
    )
}

const LOAD_PROBE_JS: &str = r#"(() => {
    let resources = 0;
    try { resources = performance.getEntriesByType('resource').length; } catch (_) {}
    return { ready: document.readyState === 'complete', resources };
})()"#;

impl ChromeDriver {
    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T, DriverError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| from_cdp(e, "script evaluation", self.request_timeout))?;
        result
            .into_value::<T>()
            .map_err(|e| DriverError::Protocol(format!("unexpected script result: {e}")))
    }

    async fn presence(&self, locator: &Locator) -> Result<Presence, DriverError> {
        self.eval(presence_js(locator)).await
    }

    /// Poll until `locator` reaches `state`. Unbounded; callers add the deadline.
    async fn poll_until(&self, locator: &Locator, state: ElementState) {
        while !reached(self.presence(locator).await, state) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the document is complete and its resource count holds
    /// still for the quiet period. Unbounded; callers add the deadline.
    async fn settle(&self) {
        let mut idle = IdleTracker::default();
        loop {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            if idle.observe(self.eval(LOAD_PROBE_JS.to_string()).await) {
                return;
            }
        }
    }
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        debug!(url, "navigating");
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(from_cdp(e, format!("load of {url}"), timeout)),
            Err(_) => Err(DriverError::Timeout {
                what: format!("load of {url}"),
                after: timeout,
            }),
        }
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        Ok(self.presence(locator).await? == Presence::Visible)
    }

    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        match tokio::time::timeout(timeout, self.poll_until(locator, state)).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DriverError::Timeout {
                what: format!("{locator} to be {}", state.as_str()),
                after: timeout,
            }),
        }
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        if self.eval::<bool>(click_js(locator)).await? {
            Ok(())
        } else {
            Err(DriverError::NotFound {
                what: locator.to_string(),
            })
        }
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        if self.eval::<bool>(fill_js(locator, value)).await? {
            Ok(())
        } else {
            Err(DriverError::NotFound {
                what: locator.to_string(),
            })
        }
    }

    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        let probe: TextProbe = self.eval(text_js(locator)).await?;
        if probe.found {
            Ok(probe.text)
        } else {
            Err(DriverError::NotFound {
                what: locator.to_string(),
            })
        }
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), DriverError> {
        match tokio::time::timeout(timeout, self.settle()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DriverError::Timeout {
                what: "network idle".to_string(),
                after: timeout,
            }),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut session = self.session.lock().await;
        let closed = session.browser.close().await.map(|_| ()).map_err(protocol);
        if let Err(e) = session.browser.wait().await {
            warn!(error = %e, "browser process did not exit cleanly");
        }
        if let Some(task) = session.handler_task.take() {
            task.abort();
        }
        debug!("browser session closed");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes_and_newlines() {
        assert_eq!(js_string(r#"a "b""#), r#""a \"b\"""#);
        assert_eq!(js_string("x\ny"), r#""x\ny""#);
    }

    #[test]
    fn css_locator_uses_query_selector() {
        let js = locate_js(&Locator::css("input[name=\"username\"]"));
        assert_eq!(js, r#"document.querySelector("input[name=\"username\"]")"#);
    }

    #[test]
    fn text_locators_pick_matching_strategy() {
        let contains = locate_js(&Locator::tag_with_text("button", "Log in"));
        assert!(contains.contains(r#"querySelectorAll("button")"#));
        assert!(contains.contains("includes(needle.toLowerCase())"));

        let exact = locate_js(&Locator::exact_text("Log in"));
        assert!(exact.contains(r#"querySelectorAll("*")"#));
        assert!(exact.contains("=== needle"));
    }

    #[test]
    fn tag_scoped_text_match_keeps_wrapped_labels() {
        // <button><span>Log in</span></button> must resolve to the button.
        let scoped = locate_js(&Locator::tag_with_text("button", "Log in"));
        assert!(scoped.contains("return hits[0] || null;"));
        assert!(!scoped.contains("e.children"));

        let any = locate_js(&Locator::exact_text("Log in"));
        assert!(any.contains("!Array.from(e.children).some(hit)"));
    }

    #[test]
    fn request_timeout_outlasts_stage_budget() {
        let launcher = ChromeLauncher::new(true, Duration::from_secs(60));
        assert!(launcher.request_timeout > Duration::from_secs(60));
    }

    #[test]
    fn cdp_timeouts_become_driver_timeouts() {
        let err = from_cdp(CdpError::Timeout, "load", Duration::from_secs(5));
        assert!(err.is_timeout());

        let err = from_cdp(
            CdpError::ChromeMessage("Cannot find context with specified id".to_string()),
            "script",
            Duration::from_secs(5),
        );
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn fill_script_embeds_value_as_literal() {
        let js = fill_js(&Locator::css("#pw"), "p\"w'd");
        assert!(js.contains(r#"set.call(el, "p\"w'd")"#));
    }

    fn context_lost() -> DriverError {
        DriverError::Protocol("Execution context was destroyed".to_string())
    }

    #[test]
    fn failed_presence_probe_keeps_polling() {
        assert!(!reached(Err(context_lost()), ElementState::Visible));
        assert!(!reached(Err(context_lost()), ElementState::Detached));
        assert!(reached(Ok(Presence::Visible), ElementState::Visible));
    }

    #[test]
    fn idle_needs_a_full_quiet_period() {
        let steady = || {
            Ok(LoadProbe {
                ready: true,
                resources: 12,
            })
        };
        let mut idle = IdleTracker::default();
        let polls = (IDLE_QUIET_PERIOD.as_millis() / IDLE_POLL_INTERVAL.as_millis()) as usize;
        // The first probe only sets the baseline.
        for _ in 0..polls {
            assert!(!idle.observe(steady()));
        }
        assert!(idle.observe(steady()));
    }

    #[test]
    fn failed_load_probe_restarts_quiet_period() {
        let steady = || {
            Ok(LoadProbe {
                ready: true,
                resources: 3,
            })
        };
        let mut idle = IdleTracker::default();
        idle.observe(steady());
        idle.observe(steady());
        assert!(!idle.observe(Err(context_lost())));
        assert_eq!(idle.quiet, Duration::ZERO);
        assert_eq!(idle.last, None);

        let mut settled = false;
        for _ in 0..10 {
            settled = idle.observe(steady());
            if settled {
                break;
            }
        }
        assert!(settled);
    }

    #[test]
    fn presence_satisfies_requested_state() {
        assert!(Presence::Visible.satisfies(ElementState::Visible));
        assert!(!Presence::Hidden.satisfies(ElementState::Visible));
        assert!(Presence::Hidden.satisfies(ElementState::Attached));
        assert!(!Presence::Missing.satisfies(ElementState::Attached));
        assert!(Presence::Missing.satisfies(ElementState::Detached));
        assert!(!Presence::Visible.satisfies(ElementState::Detached));
    }
}
