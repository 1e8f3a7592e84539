//! Structured cycle log: JSON lines per event.
//!
//! `--event-log <path>` appends one self-contained JSON object per event:
//! cycle starts, stage outcomes, the comparison result, and failures. Each
//! line carries an RFC 3339 timestamp, so the file is easy to grep, tail,
//! and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::monitor::{CycleOutcome, CycleReport};
use crate::navigator::{Stage, StageOutcome};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: CycleEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum CycleEvent {
    CycleStarted { url: String },
    StageCompleted { stage: Stage, outcome: StageOutcome },
    StatusUnchanged { status: String },
    /// Reported to the operator and stored.
    StatusChanged { previous: String, current: String },
    /// Extraction came back empty.
    StatusIndeterminate { previous: String },
    NotificationFailed {
        status: String,
        reason: String,
        retryable: bool,
    },
    CycleFailed { reason: String },
    CycleAbandoned { after_secs: u64 },
}

impl From<&CycleOutcome> for CycleEvent {
    fn from(outcome: &CycleOutcome) -> Self {
        match outcome {
            CycleOutcome::NoChange { status } => CycleEvent::StatusUnchanged {
                status: status.clone(),
            },
            CycleOutcome::Reported { previous, current } => CycleEvent::StatusChanged {
                previous: previous.clone(),
                current: current.clone(),
            },
            CycleOutcome::Indeterminate { previous } => CycleEvent::StatusIndeterminate {
                previous: previous.clone(),
            },
            CycleOutcome::NotifyFailed { current, error, .. } => CycleEvent::NotificationFailed {
                status: current.clone(),
                reason: error.to_string(),
                retryable: error.is_transient(),
            },
        }
    }
}

impl CycleEvent {
    /// Stage outcomes in the order they ran, then the comparison result.
    pub fn from_report(report: &CycleReport) -> Vec<CycleEvent> {
        report
            .navigation
            .stages
            .iter()
            .map(|r| CycleEvent::StageCompleted {
                stage: r.stage,
                outcome: r.outcome,
            })
            .chain(std::iter::once(CycleEvent::from(&report.outcome)))
            .collect()
    }
}

/// Append-only writer for the JSON lines cycle log.
pub struct CycleLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl CycleLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: CycleEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "cycle log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("cycle log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::{NavigationReport, StageRecord};
    use crate::notify::NotifyError;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-10-16T09:00:00.000Z".to_string(),
            event: CycleEvent::StageCompleted {
                stage: Stage::CookieConsent,
                outcome: StageOutcome::Skipped,
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"stage_completed\""));
        assert!(json.contains("\"stage\":\"cookie_consent\""));
        assert!(json.contains("\"outcome\":\"skipped\""));
        assert!(json.contains("\"timestamp\":\"2026-10-16T09:00:00.000Z\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("cycles.jsonl");

        let log = CycleLog::new(&log_path).unwrap();
        log.log(CycleEvent::CycleStarted {
            url: "https://careers.example.com".to_string(),
        })
        .unwrap();
        log.log(CycleEvent::StatusUnchanged {
            status: "Pending".to_string(),
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            let stamp = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        }
        assert!(lines[0].contains("\"event\":\"cycle_started\""));
        assert!(lines[1].contains("\"event\":\"status_unchanged\""));
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("cycles.jsonl");

        let log = CycleLog::new(&log_path).unwrap();
        log.log(CycleEvent::CycleAbandoned { after_secs: 300 }).unwrap();

        assert!(log_path.exists());
        assert_eq!(log.path(), log_path.as_path());
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("cycles.jsonl");

        {
            let log = CycleLog::new(&log_path).unwrap();
            log.log(CycleEvent::CycleFailed {
                reason: "first".to_string(),
            })
            .unwrap();
        }
        {
            let log = CycleLog::new(&log_path).unwrap();
            log.log(CycleEvent::CycleFailed {
                reason: "second".to_string(),
            })
            .unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn failed_delivery_records_retryability() {
        let outcome = CycleOutcome::NotifyFailed {
            previous: "Pending".to_string(),
            current: "Offer".to_string(),
            error: NotifyError::TransportFailure {
                relay: "smtp.example.com:465".to_string(),
                detail: "connection reset".to_string(),
            },
        };

        match CycleEvent::from(&outcome) {
            CycleEvent::NotificationFailed {
                status, retryable, ..
            } => {
                assert_eq!(status, "Offer");
                assert!(retryable);
            }
            other => panic!("expected NotificationFailed, got {other:?}"),
        }
    }

    #[test]
    fn report_events_follow_stage_order() {
        let report = CycleReport {
            navigation: NavigationReport {
                status: "Offer".to_string(),
                stages: vec![
                    StageRecord {
                        stage: Stage::Load,
                        outcome: StageOutcome::Handled,
                    },
                    StageRecord {
                        stage: Stage::StatusExtraction,
                        outcome: StageOutcome::Handled,
                    },
                ],
            },
            outcome: CycleOutcome::Reported {
                previous: String::new(),
                current: "Offer".to_string(),
            },
        };

        let events = CycleEvent::from_report(&report);

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[0],
            CycleEvent::StageCompleted {
                stage: Stage::Load,
                ..
            }
        ));
        assert!(matches!(events[2], CycleEvent::StatusChanged { .. }));
    }
}
