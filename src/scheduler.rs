//! Cycle scheduling: one bounded check, or a fixed-interval loop of them.
//!
//! Every check gets a fresh browser session that is closed when the check
//! ends, including when the outer budget runs out. Cycles never overlap;
//! the loop waits for each one to finish before sleeping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::driver::{DriverLauncher, PageDriver};
use crate::log::{CycleEvent, CycleLog};
use crate::monitor::{CycleError, CycleReport, Monitor};
use crate::navigator::Navigator;
use crate::notify::Notifier;
use crate::store::StatusStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Outer budget for one whole cycle, browser launch included.
    pub cycle_budget: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            cycle_budget: Duration::from_secs(300),
        }
    }
}

/// Totals for a finished watch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub cycles: u64,
    /// Cycles that errored or could not deliver their notification.
    pub failed: u64,
}

pub struct Scheduler<'a, L, S, N>
where
    L: DriverLauncher,
    S: StatusStore,
    N: Notifier,
{
    launcher: &'a L,
    monitor: &'a Monitor<S, N>,
    navigator: &'a Navigator,
    config: SchedulerConfig,
    log: Option<&'a CycleLog>,
}

impl<'a, L, S, N> Scheduler<'a, L, S, N>
where
    L: DriverLauncher,
    S: StatusStore,
    N: Notifier,
{
    pub fn new(
        launcher: &'a L,
        monitor: &'a Monitor<S, N>,
        navigator: &'a Navigator,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            launcher,
            monitor,
            navigator,
            config,
            log: None,
        }
    }

    pub fn with_log(mut self, log: &'a CycleLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Run exactly one cycle within the outer budget.
    ///
    /// An abandoned cycle is dropped mid-flight: whatever it had not yet
    /// stored stays unstored.
    pub async fn run_check(&self) -> Result<CycleReport, CycleError> {
        let budget = self.config.cycle_budget;
        self.record(CycleEvent::CycleStarted {
            url: self.navigator.target_url().to_string(),
        });

        let result = match tokio::time::timeout(budget, self.launch_and_run()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(budget_secs = budget.as_secs(), "cycle exceeded its budget; abandoned");
                Err(CycleError::Abandoned { after: budget })
            }
        };

        match &result {
            Ok(report) => {
                for event in CycleEvent::from_report(report) {
                    self.record(event);
                }
            }
            Err(CycleError::Abandoned { after }) => self.record(CycleEvent::CycleAbandoned {
                after_secs: after.as_secs(),
            }),
            Err(e) => self.record(CycleEvent::CycleFailed {
                reason: e.to_string(),
            }),
        }
        result
    }

    async fn launch_and_run(&self) -> Result<CycleReport, CycleError> {
        let driver = self.launcher.launch().await.map_err(CycleError::Launch)?;
        let mut session = Session::new(driver);
        let result = self.monitor.run_cycle(session.driver(), self.navigator).await;
        session.close().await;
        result
    }

    /// Check, sleep, repeat until `shutdown` resolves.
    ///
    /// `shutdown` is only observed between cycles; a running cycle is
    /// bounded by its own budget.
    pub async fn watch<F>(&self, shutdown: F) -> WatchStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = WatchStats::default();
        info!(
            interval_mins = self.config.interval.as_secs() / 60,
            "watching for status changes"
        );

        loop {
            stats.cycles += 1;
            println!("{}", iteration_line(stats.cycles));

            let result = self.run_check().await;
            if cycle_failed(&result) {
                stats.failed += 1;
            }
            println!("{}", summary_line(&result));

            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles = stats.cycles, "shutdown requested; stopping");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    debug!("interval elapsed");
                }
            }
        }

        stats
    }

    fn record(&self, event: CycleEvent) {
        if let Some(log) = self.log
            && let Err(e) = log.log(event)
        {
            warn!(error = %e, "failed to write cycle log");
        }
    }
}

/// Owns the browser for one cycle. A cycle dropped by the outer budget
/// drops its session, which closes the browser on a spawned task.
struct Session<D: PageDriver + 'static> {
    driver: Arc<D>,
    closed: bool,
}

impl<D: PageDriver + 'static> Session<D> {
    fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            closed: false,
        }
    }

    fn driver(&self) -> &D {
        &self.driver
    }

    async fn close(&mut self) {
        self.closed = true;
        if let Err(e) = self.driver.close().await {
            warn!(error = %e, "failed to close browser session");
        }
    }
}

impl<D: PageDriver + 'static> Drop for Session<D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let driver = Arc::clone(&self.driver);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = driver.close().await {
                        warn!(error = %e, "failed to close abandoned browser session");
                    }
                });
            }
            Err(_) => error!("no runtime to close abandoned browser session"),
        }
    }
}

/// A cycle counts as failed when it errored or its notification was lost.
pub fn cycle_failed(result: &Result<CycleReport, CycleError>) -> bool {
    match result {
        Ok(report) => report.outcome.notify_error().is_some(),
        Err(_) => true,
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn iteration_line(cycle: u64) -> String {
    format!("[{}] Check #{cycle}: checking application status...", timestamp())
}

/// The one line printed per cycle.
pub fn summary_line(result: &Result<CycleReport, CycleError>) -> String {
    match result {
        Ok(report) => match report.outcome.notify_error() {
            Some(e) => format!(
                "[{}] {} (notification not delivered: {e})",
                timestamp(),
                report.outcome.summary()
            ),
            None => format!("[{}] {}", timestamp(), report.outcome.summary()),
        },
        Err(e) => format!("[{}] Check failed: {e}", timestamp()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Secret, SiteCredentials};
    use crate::navigator::{NavigationTimeouts, PageSelectors};
    use crate::notify::NotifyError;
    use crate::testing::{FakeLauncher, FakeNotifier, FakePage, MemoryStore, NotifyFailure};

    fn navigator() -> Navigator {
        Navigator::new(
            "https://careers.example.com/applications",
            SiteCredentials {
                username: "candidate".to_string(),
                password: Secret::new("hunter2"),
            },
            PageSelectors::default(),
            NavigationTimeouts::new(Duration::from_secs(60)),
        )
    }

    fn page_showing(status: &str) -> FakePage {
        let sel = PageSelectors::default();
        FakePage::new()
            .with_visible(&sel.applications_tab)
            .with_text(&sel.status_cell, status)
    }

    fn config(budget_secs: u64) -> SchedulerConfig {
        SchedulerConfig {
            interval: DEFAULT_INTERVAL,
            cycle_budget: Duration::from_secs(budget_secs),
        }
    }

    #[tokio::test]
    async fn check_closes_browser_after_cycle() {
        let page = page_showing("Offer");
        let launcher = FakeLauncher::new(page.clone());
        let store = MemoryStore::new("Pending");
        let monitor = Monitor::new(store.clone(), FakeNotifier::new());
        let nav = navigator();

        let report = Scheduler::new(&launcher, &monitor, &nav, config(300))
            .run_check()
            .await
            .unwrap();

        assert_eq!(report.outcome.summary(), "Pending → Offer");
        assert_eq!(store.current(), "Offer");
        assert_eq!(launcher.launches(), 1);
        assert!(page.is_closed());
    }

    #[tokio::test]
    async fn aborted_navigation_still_closes_browser() {
        let sel = PageSelectors::default();
        let page = page_showing("Offer")
            .with_visible(&sel.username_input)
            .with_visible(&sel.password_input);
        let launcher = FakeLauncher::new(page.clone());
        let store = MemoryStore::new("Pending");
        let monitor = Monitor::new(store.clone(), FakeNotifier::new());
        let nav = navigator();

        let result = Scheduler::new(&launcher, &monitor, &nav, config(300))
            .run_check()
            .await;

        assert!(matches!(result, Err(CycleError::Navigation(_))));
        assert!(page.is_closed());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let launcher = FakeLauncher::failing("chrome not found");
        let monitor = Monitor::new(MemoryStore::new(""), FakeNotifier::new());
        let nav = navigator();

        let result = Scheduler::new(&launcher, &monitor, &nav, config(300))
            .run_check()
            .await;

        match result {
            Err(CycleError::Launch(e)) => assert!(e.to_string().contains("chrome not found")),
            other => panic!("expected Launch error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_cycle_is_abandoned_without_storing() {
        let page = page_showing("Offer").hangs_on_goto();
        let launcher = FakeLauncher::new(page.clone());
        let store = MemoryStore::new("Pending");
        let notifier = FakeNotifier::new();
        let monitor = Monitor::new(store.clone(), notifier.clone());
        let nav = navigator();

        let result = Scheduler::new(&launcher, &monitor, &nav, config(300))
            .run_check()
            .await;

        assert!(matches!(result, Err(CycleError::Abandoned { after }) if after.as_secs() == 300));
        assert!(store.writes().is_empty());
        assert!(notifier.sent().is_empty());

        // The dropped session closes on a spawned task.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(page.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_runs_one_cycle_per_interval_until_shutdown() {
        let launcher = FakeLauncher::new(page_showing("Offer"));
        let store = MemoryStore::new("");
        let notifier = FakeNotifier::new();
        let monitor = Monitor::new(store.clone(), notifier.clone());
        let nav = navigator();
        let scheduler = Scheduler::new(&launcher, &monitor, &nav, config(300));

        // Cycles at 0, 30 and 60 minutes; shutdown lands during the third sleep.
        let stats = scheduler
            .watch(tokio::time::sleep(Duration::from_secs(61 * 60)))
            .await;

        assert_eq!(stats, WatchStats { cycles: 3, failed: 0 });
        assert_eq!(launcher.launches(), 3);
        // Only the first cycle saw a change.
        assert_eq!(notifier.sent(), vec!["Offer".to_string()]);
        assert_eq!(store.writes(), vec!["Offer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_retried_next_cycle() {
        let launcher = FakeLauncher::new(page_showing("Offer"));
        let store = MemoryStore::new("Pending");
        let notifier = FakeNotifier::failing(NotifyFailure::TransportFailure);
        let monitor = Monitor::new(store.clone(), notifier.clone());
        let nav = navigator();
        let scheduler = Scheduler::new(&launcher, &monitor, &nav, config(300));

        let stats = scheduler
            .watch(tokio::time::sleep(Duration::from_secs(31 * 60)))
            .await;

        assert_eq!(stats, WatchStats { cycles: 2, failed: 2 });
        assert_eq!(notifier.sent(), vec!["Offer".to_string(), "Offer".to_string()]);
        assert_eq!(store.current(), "Pending");
    }

    #[tokio::test]
    async fn cycle_log_records_stages_and_result() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CycleLog::new(&tmp.path().join("cycles.jsonl")).unwrap();
        let launcher = FakeLauncher::new(page_showing("Offer"));
        let monitor = Monitor::new(MemoryStore::new("Offer"), FakeNotifier::new());
        let nav = navigator();

        Scheduler::new(&launcher, &monitor, &nav, config(300))
            .with_log(&log)
            .run_check()
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(events.first().map(String::as_str), Some("cycle_started"));
        assert_eq!(events.last().map(String::as_str), Some("status_unchanged"));
        assert!(events.iter().any(|e| e == "stage_completed"));
    }

    #[test]
    fn summary_line_flags_lost_notification() {
        let report = CycleReport {
            navigation: crate::navigator::NavigationReport {
                status: "Offer".to_string(),
                stages: Vec::new(),
            },
            outcome: crate::monitor::CycleOutcome::NotifyFailed {
                previous: "Pending".to_string(),
                current: "Offer".to_string(),
                error: NotifyError::Compose("bad address".to_string()),
            },
        };
        let result = Ok(report);

        let line = summary_line(&result);

        assert!(line.contains("Pending → Offer"));
        assert!(line.contains("notification not delivered"));
        assert!(cycle_failed(&result));
    }
}
