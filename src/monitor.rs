//! One check cycle: navigate, compare against the stored status, notify.
//!
//! The stored value only ever moves forward to a status the operator has
//! been told about. An empty observation is never stored, and a failed
//! notification leaves the previous value in place so the next cycle sees
//! the same change and tries again.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::driver::{DriverError, PageDriver};
use crate::navigator::{NavigationError, NavigationReport, Navigator};
use crate::notify::{Notifier, NotifyError};
use crate::store::{StatusStore, StoreError};

const NONE_TOKEN: &str = "[none]";
const EMPTY_TOKEN: &str = "[empty]";

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Launch(#[source] DriverError),

    #[error("cycle abandoned after {}s", after.as_secs())]
    Abandoned { after: Duration },
}

/// What to do with a freshly observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Unchanged,
    /// Changed to a non-empty status: notify, then store.
    Report,
    /// Changed to empty: log only.
    Indeterminate,
}

pub fn decide(previous: &str, current: &str) -> Decision {
    if current == previous {
        Decision::Unchanged
    } else if current.is_empty() {
        Decision::Indeterminate
    } else {
        Decision::Report
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoChange {
        status: String,
    },
    /// Notified and stored.
    Reported {
        previous: String,
        current: String,
    },
    /// Extraction came back empty; the store was left alone.
    Indeterminate {
        previous: String,
    },
    /// The change was seen but could not be delivered. Not stored.
    NotifyFailed {
        previous: String,
        current: String,
        error: NotifyError,
    },
}

impl CycleOutcome {
    /// The one line printed for every completed cycle.
    pub fn summary(&self) -> String {
        match self {
            CycleOutcome::NoChange { .. } => "No change detected.".to_string(),
            CycleOutcome::Reported { previous, current }
            | CycleOutcome::NotifyFailed {
                previous, current, ..
            } => transition(previous, current),
            CycleOutcome::Indeterminate { previous } => transition(previous, ""),
        }
    }

    pub fn notify_error(&self) -> Option<&NotifyError> {
        match self {
            CycleOutcome::NotifyFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

fn transition(previous: &str, current: &str) -> String {
    let from = if previous.is_empty() {
        NONE_TOKEN
    } else {
        previous
    };
    let to = if current.is_empty() {
        EMPTY_TOKEN
    } else {
        current
    };
    format!("{from} → {to}")
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub navigation: NavigationReport,
    pub outcome: CycleOutcome,
}

pub struct Monitor<S: StatusStore, N: Notifier> {
    store: S,
    notifier: N,
}

impl<S: StatusStore, N: Notifier> Monitor<S, N> {
    pub fn new(store: S, notifier: N) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Run one cycle against an already open page.
    ///
    /// Navigation failures abort before the store is read. Notification
    /// failures are not errors here; they come back as
    /// [`CycleOutcome::NotifyFailed`] so the caller can report them.
    pub async fn run_cycle<D>(
        &self,
        driver: &D,
        navigator: &Navigator,
    ) -> Result<CycleReport, CycleError>
    where
        D: PageDriver + ?Sized,
    {
        let navigation = navigator.run(driver).await?;
        let current = navigation.status.clone();
        let previous = self.store.read()?;

        let outcome = match decide(&previous, &current) {
            Decision::Unchanged => {
                info!(status = %current, "status unchanged");
                CycleOutcome::NoChange { status: current }
            }
            Decision::Indeterminate => {
                warn!(previous = %previous, "status came back empty; keeping stored value");
                CycleOutcome::Indeterminate { previous }
            }
            Decision::Report => match self.notifier.notify(&current).await {
                Ok(()) => {
                    self.store.write(&current)?;
                    info!(previous = %previous, current = %current, "status change reported");
                    CycleOutcome::Reported { previous, current }
                }
                Err(error) => {
                    error!(%error, "notification failed; status not stored");
                    CycleOutcome::NotifyFailed {
                        previous,
                        current,
                        error,
                    }
                }
            },
        };

        Ok(CycleReport {
            navigation,
            outcome,
        })
    }
}
