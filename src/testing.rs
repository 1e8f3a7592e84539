//! Scripted doubles for the driver, launcher, notifier and store seams.
//!
//! Compiled for unit tests and, behind the `scenario-test` feature, for the
//! integration tests under `tests/`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::driver::{DriverError, DriverLauncher, ElementState, Locator, PageDriver};
use crate::notify::{Notifier, NotifyError};
use crate::store::{StatusStore, StoreError};

/// One call made against a [`FakePage`], with locators rendered to text
/// and the deadline each wait was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Goto(String, Duration),
    IsVisible(String),
    WaitFor(String, ElementState, Duration),
    Click(String),
    Fill(String, String),
    TextContent(String),
    NetworkIdle(Duration),
    Close,
}

impl DriverCall {
    /// The deadline of a waiting call.
    pub fn budget(&self) -> Option<Duration> {
        match self {
            DriverCall::Goto(_, t) | DriverCall::WaitFor(_, _, t) | DriverCall::NetworkIdle(t) => {
                Some(*t)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FakeElement {
    visible: bool,
    text: Option<String>,
    removed_on_click: bool,
    /// Absent from the page until this instant.
    appears_at: Option<Instant>,
}

impl FakeElement {
    fn appeared(&self, now: Instant) -> bool {
        self.appears_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct PageState {
    elements: HashMap<String, FakeElement>,
    calls: Vec<DriverCall>,
    load_times_out: bool,
    idle_times_out: bool,
    hangs_on_goto: bool,
    goto_error: Option<String>,
    closed: bool,
}

/// A page whose elements are declared up front.
///
/// Waits resolve instantly: a condition that holds now succeeds, anything
/// else times out with the requested budget. Elements declared with
/// [`FakePage::appearing_after`] are the exception: waiting on one sleeps
/// on the tokio clock until it shows or the budget runs out, so pair them
/// with a paused clock. Clones share state, so a test can keep a handle to
/// a page it gave away to a launcher.
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<PageState>>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, locator: &Locator, f: impl FnOnce(&mut FakeElement)) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            f(state.elements.entry(locator.to_string()).or_default());
        }
        self
    }

    pub fn with_visible(self, locator: &Locator) -> Self {
        self.edit(locator, |e| e.visible = true)
    }

    /// Present in the DOM but not rendered.
    pub fn with_hidden(self, locator: &Locator) -> Self {
        self.edit(locator, |e| e.visible = false)
    }

    pub fn with_text(self, locator: &Locator, text: &str) -> Self {
        self.edit(locator, |e| {
            e.visible = true;
            e.text = Some(text.to_string());
        })
    }

    /// Visible, but only once `delay` has passed from now.
    pub fn appearing_after(self, locator: &Locator, delay: Duration) -> Self {
        let at = Instant::now() + delay;
        self.edit(locator, |e| {
            e.visible = true;
            e.appears_at = Some(at);
        })
    }

    pub fn removed_on_click(self, locator: &Locator) -> Self {
        self.edit(locator, |e| e.removed_on_click = true)
    }

    pub fn load_times_out(self) -> Self {
        self.state.lock().unwrap().load_times_out = true;
        self
    }

    pub fn idle_times_out(self) -> Self {
        self.state.lock().unwrap().idle_times_out = true;
        self
    }

    /// `goto` never completes.
    pub fn hangs_on_goto(self) -> Self {
        self.state.lock().unwrap().hangs_on_goto = true;
        self
    }

    pub fn goto_fails(self, message: &str) -> Self {
        self.state.lock().unwrap().goto_error = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Click(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Fill(target, value) => Some((target, value)),
                _ => None,
            })
            .collect()
    }

    /// Every wait made, in order, with its deadline.
    pub fn waits(&self) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.budget().is_some())
            .collect()
    }

    pub fn is_present(&self, locator: &Locator) -> bool {
        self.element(locator).is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record(&self, call: DriverCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// The element as the page shows it right now.
    fn element(&self, locator: &Locator) -> Option<FakeElement> {
        self.declared(locator).filter(|e| e.appeared(Instant::now()))
    }

    fn declared(&self, locator: &Locator) -> Option<FakeElement> {
        self.state
            .lock()
            .unwrap()
            .elements
            .get(&locator.to_string())
            .cloned()
    }
}

fn satisfies(element: Option<&FakeElement>, state: ElementState) -> bool {
    match state {
        ElementState::Visible => element.is_some_and(|e| e.visible),
        ElementState::Attached => element.is_some(),
        ElementState::Detached => element.is_none(),
    }
}

fn not_found(locator: &Locator) -> DriverError {
    DriverError::NotFound {
        what: locator.to_string(),
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        self.record(DriverCall::Goto(url.to_string(), timeout));
        let (hangs, error, times_out) = {
            let state = self.state.lock().unwrap();
            (
                state.hangs_on_goto,
                state.goto_error.clone(),
                state.load_times_out,
            )
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if let Some(message) = error {
            return Err(DriverError::Protocol(message));
        }
        if times_out {
            return Err(DriverError::Timeout {
                what: format!("load of {url}"),
                after: timeout,
            });
        }
        Ok(())
    }

    async fn is_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        self.record(DriverCall::IsVisible(locator.to_string()));
        Ok(self.element(locator).is_some_and(|e| e.visible))
    }

    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::WaitFor(locator.to_string(), state, timeout));
        if satisfies(self.element(locator).as_ref(), state) {
            return Ok(());
        }

        let timed_out = || DriverError::Timeout {
            what: format!("{locator} to be {}", state.as_str()),
            after: timeout,
        };
        // Only an element that has yet to appear can change while we wait.
        let deadline = Instant::now() + timeout;
        match self.declared(locator).and_then(|e| e.appears_at) {
            Some(at) if at <= deadline => {
                tokio::time::sleep_until(at).await;
                Ok(())
            }
            Some(_) => {
                tokio::time::sleep_until(deadline).await;
                Err(timed_out())
            }
            None => Err(timed_out()),
        }
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        self.record(DriverCall::Click(locator.to_string()));
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let key = locator.to_string();
        match state.elements.get(&key).filter(|e| e.appeared(now)) {
            None => Err(not_found(locator)),
            Some(e) if e.removed_on_click => {
                state.elements.remove(&key);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    async fn fill(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        self.record(DriverCall::Fill(locator.to_string(), value.to_string()));
        match self.element(locator) {
            Some(_) => Ok(()),
            None => Err(not_found(locator)),
        }
    }

    async fn text_content(&self, locator: &Locator) -> Result<Option<String>, DriverError> {
        self.record(DriverCall::TextContent(locator.to_string()));
        self.element(locator)
            .map(|e| e.text)
            .ok_or_else(|| not_found(locator))
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), DriverError> {
        self.record(DriverCall::NetworkIdle(timeout));
        if self.state.lock().unwrap().idle_times_out {
            return Err(DriverError::Timeout {
                what: "network idle".to_string(),
                after: timeout,
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Close);
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out the same [`FakePage`] on every launch.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    page: FakePage,
    launch_error: Option<String>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(page: FakePage) -> Self {
        Self {
            page,
            launch_error: None,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            page: FakePage::new(),
            launch_error: Some(message.to_string()),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverLauncher for FakeLauncher {
    type Driver = FakePage;

    async fn launch(&self) -> Result<FakePage, DriverError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match &self.launch_error {
            Some(message) => Err(DriverError::Launch(message.clone())),
            None => Ok(self.page.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyFailure {
    AuthenticationRejected,
    TransportFailure,
}

/// Records every status it is asked to send.
#[derive(Debug, Clone, Default)]
pub struct FakeNotifier {
    sent: Arc<Mutex<Vec<String>>>,
    failure: Option<NotifyFailure>,
}

impl FakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failure: NotifyFailure) -> Self {
        Self {
            sent: Arc::default(),
            failure: Some(failure),
        }
    }

    /// Every attempted notification, successful or not.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, status: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(status.to_string());
        match self.failure {
            None => Ok(()),
            Some(NotifyFailure::AuthenticationRejected) => {
                Err(NotifyError::AuthenticationRejected {
                    relay: "smtp.test:465".to_string(),
                    user: "watcher@example.com".to_string(),
                    detail: "535 5.7.8 Username and Password not accepted".to_string(),
                })
            }
            Some(NotifyFailure::TransportFailure) => Err(NotifyError::TransportFailure {
                relay: "smtp.test:465".to_string(),
                detail: "connection refused".to_string(),
            }),
        }
    }
}

/// Status held in memory, with a log of every write.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    value: Arc<Mutex<String>>,
    writes: Arc<Mutex<Vec<String>>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new(initial: &str) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial.to_string())),
            ..Self::default()
        }
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn current(&self) -> String {
        self.value.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

impl StatusStore for MemoryStore {
    fn read(&self) -> Result<String, StoreError> {
        Ok(self.current())
    }

    fn write(&self, status: &str) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Write {
                path: "<memory>".into(),
                source: io::Error::other("disk full"),
            });
        }
        self.writes.lock().unwrap().push(status.to_string());
        *self.value.lock().unwrap() = status.to_string();
        Ok(())
    }
}
