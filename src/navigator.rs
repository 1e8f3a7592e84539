//! Page navigation state machine.
//!
//! Walks the monitored page from a cold browser to the status cell. The page
//! shape is not known up front (session may already be signed in, the cookie
//! banner may or may not show, the applications tab may already be selected),
//! so every stage reports one of three outcomes instead of failing:
//!
//! ```text
//! LOAD            → goto(url), wait for load       → timeout: carry on
//! COOKIE_CONSENT  → accept banner if it shows      → absent: no-op
//! LOGIN           → only if the username box shows → fill, LOGIN_CLICK, idle
//!   LOGIN_CLICK   → consent again, first visible candidate
//!                   none visible: LoginControlNotFound (aborts the cycle)
//! TAB             → click the applications tab     → timeout: carry on
//! EXTRACT         → trimmed status cell text       → timeout: ""
//! ```
//!
//! Each stage waits exactly once. Nothing is retried within a run.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{COOKIE_DISMISS_WAIT, COOKIE_WAIT, MonitorConfig, SiteCredentials};
use crate::driver::{DriverError, ElementState, Locator, PageDriver};

/// Idle wait after clicking the applications tab.
const TAB_IDLE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    CookieConsent,
    ConditionalLogin,
    LoginClick,
    TabNavigation,
    StatusExtraction,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::CookieConsent => "cookie_consent",
            Stage::ConditionalLogin => "conditional_login",
            Stage::LoginClick => "login_click",
            Stage::TabNavigation => "tab_navigation",
            Stage::StatusExtraction => "status_extraction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The element showed up and was acted on.
    Handled,
    /// Nothing to do on this page (no banner, already signed in).
    Skipped,
    /// A bounded wait ran out; the run continued with what it had.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Result of one traversal: the status text plus how each stage went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationReport {
    /// Trimmed status text; empty when the cell never showed.
    pub status: String,
    pub stages: Vec<StageRecord>,
}

impl NavigationReport {
    pub fn timed_out(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|r| r.outcome == StageOutcome::TimedOut)
            .map(|r| r.stage)
            .collect()
    }

    /// Outcome of the last run of `stage`, if it ran.
    pub fn outcome_of(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| r.outcome)
    }
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("login button not found (tried {}); update the login selectors", tried.join(", "))]
    LoginControlNotFound { tried: Vec<String> },

    #[error("{stage} failed: {source}")]
    Driver {
        stage: Stage,
        #[source]
        source: DriverError,
    },
}

fn at(stage: Stage) -> impl Fn(DriverError) -> NavigationError {
    move |source| NavigationError::Driver { stage, source }
}

/// Everything the navigator needs to find on the page.
#[derive(Debug, Clone)]
pub struct PageSelectors {
    pub username_input: Locator,
    pub password_input: Locator,
    pub cookie_accept: Locator,
    /// Probed in order; the first visible one is clicked.
    pub login_candidates: Vec<Locator>,
    pub applications_tab: Locator,
    pub status_cell: Locator,
}

impl Default for PageSelectors {
    fn default() -> Self {
        Self {
            username_input: Locator::css(r#"input[name="username"]"#),
            password_input: Locator::css(r#"input[name="password"]"#),
            cookie_accept: Locator::css("#onetrust-accept-btn-handler"),
            login_candidates: vec![
                Locator::css("#login"),
                Locator::tag_with_text("button", "Log in"),
                Locator::exact_text("Log in"),
            ],
            applications_tab: Locator::css(
                "#main-panel > section > div.section__header.section__header--tabs > \
                 div > ul > li:nth-child(2) > a",
            ),
            status_cell: Locator::css(
                "#main-panel > section > div.section__content > article > div > div > \
                 table > tbody > tr:nth-child(2) > td:nth-child(2)",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationTimeouts {
    /// Page load, tab appearance and status cell appearance.
    pub page: Duration,
    pub cookie: Duration,
    pub cookie_dismiss: Duration,
    pub login_idle: Duration,
    pub tab_idle: Duration,
}

impl NavigationTimeouts {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            page: check_timeout,
            cookie: COOKIE_WAIT,
            cookie_dismiss: COOKIE_DISMISS_WAIT,
            login_idle: check_timeout,
            tab_idle: TAB_IDLE_WAIT,
        }
    }
}

pub struct Navigator {
    target_url: String,
    credentials: SiteCredentials,
    selectors: PageSelectors,
    timeouts: NavigationTimeouts,
}

impl Navigator {
    pub fn new(
        target_url: impl Into<String>,
        credentials: SiteCredentials,
        selectors: PageSelectors,
        timeouts: NavigationTimeouts,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            credentials,
            selectors,
            timeouts,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.target_url.clone(),
            config.site.clone(),
            PageSelectors::default(),
            NavigationTimeouts::new(config.check_timeout),
        )
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Drive the page through every stage and return the status text.
    ///
    /// Only a missing login button or an unexpected driver failure aborts
    /// the run; timeouts are recorded and the run moves on.
    pub async fn run<D>(&self, driver: &D) -> Result<NavigationReport, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let mut stages = Vec::with_capacity(6);
        let mut record = |stage: Stage, outcome: StageOutcome| {
            debug!(stage = %stage, outcome = ?outcome, "stage finished");
            stages.push(StageRecord { stage, outcome });
        };

        record(Stage::Load, self.load(driver).await?);
        record(Stage::CookieConsent, self.dismiss_cookies(driver).await?);

        let login = self.login_if_needed(driver).await?;
        if let Some(consent) = login.consent {
            record(Stage::CookieConsent, consent);
        }
        if login.clicked {
            record(Stage::LoginClick, StageOutcome::Handled);
        }
        record(Stage::ConditionalLogin, login.outcome);

        record(Stage::TabNavigation, self.open_applications_tab(driver).await?);

        let (outcome, status) = self.extract_status(driver).await?;
        record(Stage::StatusExtraction, outcome);

        Ok(NavigationReport { status, stages })
    }

    pub async fn load<D>(&self, driver: &D) -> Result<StageOutcome, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        info!(url = %self.target_url, "loading page");
        match driver.goto(&self.target_url, self.timeouts.page).await {
            Ok(()) => Ok(StageOutcome::Handled),
            Err(e) if e.is_timeout() => {
                warn!("page load timed out; continuing");
                Ok(StageOutcome::TimedOut)
            }
            Err(e) => Err(at(Stage::Load)(e)),
        }
    }

    /// Accept the cookie banner if it shows within the cookie wait.
    ///
    /// A page without a banner is a no-op.
    pub async fn dismiss_cookies<D>(&self, driver: &D) -> Result<StageOutcome, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let accept = &self.selectors.cookie_accept;
        match driver
            .wait_for(accept, ElementState::Visible, self.timeouts.cookie)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                debug!("no cookie banner");
                return Ok(StageOutcome::Skipped);
            }
            Err(e) => return Err(at(Stage::CookieConsent)(e)),
        }

        match driver.click(accept).await {
            Ok(()) => {}
            Err(DriverError::NotFound { .. }) => {
                debug!("cookie banner went away before it was clicked");
                return Ok(StageOutcome::Skipped);
            }
            Err(e) => return Err(at(Stage::CookieConsent)(e)),
        }

        match driver
            .wait_for(accept, ElementState::Detached, self.timeouts.cookie_dismiss)
            .await
        {
            Ok(()) => {
                debug!("cookie banner dismissed");
                Ok(StageOutcome::Handled)
            }
            Err(e) if e.is_timeout() => {
                warn!("cookie banner still present after accepting");
                Ok(StageOutcome::TimedOut)
            }
            Err(e) => Err(at(Stage::CookieConsent)(e)),
        }
    }

    async fn login_if_needed<D>(&self, driver: &D) -> Result<LoginRun, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let stage = Stage::ConditionalLogin;
        let visible = driver
            .is_visible(&self.selectors.username_input)
            .await
            .map_err(at(stage))?;
        if !visible {
            debug!("no login form; session already signed in");
            return Ok(LoginRun {
                outcome: StageOutcome::Skipped,
                consent: None,
                clicked: false,
            });
        }

        info!("login form present; signing in");
        driver
            .fill(&self.selectors.username_input, &self.credentials.username)
            .await
            .map_err(at(stage))?;
        driver
            .fill(
                &self.selectors.password_input,
                self.credentials.password.expose(),
            )
            .await
            .map_err(at(stage))?;

        let consent = self.click_login(driver).await?;

        let outcome = match driver
            .wait_for_network_idle(self.timeouts.login_idle)
            .await
        {
            Ok(()) => StageOutcome::Handled,
            Err(e) if e.is_timeout() => {
                warn!("network idle after login timed out; continuing");
                StageOutcome::TimedOut
            }
            Err(e) => return Err(at(stage)(e)),
        };

        Ok(LoginRun {
            outcome,
            consent: Some(consent),
            clicked: true,
        })
    }

    /// Clear the cookie banner again, then click the first visible login
    /// control. Returns how the consent step went.
    pub async fn click_login<D>(&self, driver: &D) -> Result<StageOutcome, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let consent = self.dismiss_cookies(driver).await?;

        for candidate in &self.selectors.login_candidates {
            let visible = driver
                .is_visible(candidate)
                .await
                .map_err(at(Stage::LoginClick))?;
            if visible {
                debug!(selector = %candidate, "clicking login control");
                driver
                    .click(candidate)
                    .await
                    .map_err(at(Stage::LoginClick))?;
                return Ok(consent);
            }
        }

        Err(NavigationError::LoginControlNotFound {
            tried: self
                .selectors
                .login_candidates
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    pub async fn open_applications_tab<D>(
        &self,
        driver: &D,
    ) -> Result<StageOutcome, NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let stage = Stage::TabNavigation;
        let tab = &self.selectors.applications_tab;
        match driver
            .wait_for(tab, ElementState::Visible, self.timeouts.page)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("applications tab not found; reading status anyway");
                return Ok(StageOutcome::TimedOut);
            }
            Err(e) => return Err(at(stage)(e)),
        }

        match driver.click(tab).await {
            Ok(()) => {}
            Err(DriverError::NotFound { .. }) => {
                warn!("applications tab disappeared before it was clicked");
                return Ok(StageOutcome::Skipped);
            }
            Err(e) => return Err(at(stage)(e)),
        }

        match driver.wait_for_network_idle(self.timeouts.tab_idle).await {
            Ok(()) => Ok(StageOutcome::Handled),
            Err(e) if e.is_timeout() => {
                warn!("network idle after opening the applications tab timed out");
                Ok(StageOutcome::TimedOut)
            }
            Err(e) => Err(at(stage)(e)),
        }
    }

    /// Read the status cell. A cell that never shows yields `""`.
    pub async fn extract_status<D>(
        &self,
        driver: &D,
    ) -> Result<(StageOutcome, String), NavigationError>
    where
        D: PageDriver + ?Sized,
    {
        let stage = Stage::StatusExtraction;
        let cell = &self.selectors.status_cell;
        match driver
            .wait_for(cell, ElementState::Visible, self.timeouts.page)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                warn!("status cell not found; returning empty");
                return Ok((StageOutcome::TimedOut, String::new()));
            }
            Err(e) => return Err(at(stage)(e)),
        }

        let text = match driver.text_content(cell).await {
            Ok(text) => text.unwrap_or_default(),
            Err(DriverError::NotFound { .. }) => {
                warn!("status cell disappeared before it was read; returning empty");
                return Ok((StageOutcome::Skipped, String::new()));
            }
            Err(e) => return Err(at(stage)(e)),
        };

        let status = text.trim().to_string();
        info!(status = %status, "status read");
        Ok((StageOutcome::Handled, status))
    }
}

struct LoginRun {
    outcome: StageOutcome,
    consent: Option<StageOutcome>,
    clicked: bool,
}
