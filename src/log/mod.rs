//! Structured execution log: one JSON object per line, per run.
//!
//! Every `stacker run` writes a `.jsonl` file capturing run start, phase
//! boundaries, prompt dispatches, accept retries, failures, watchdog repairs
//! and how the run ended. Each line carries an RFC 3339 timestamp and the run
//! id, so logs from several runs can be concatenated and still grepped apart.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::FailureClass;
use crate::session::Phase;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted { prompts: usize },
    PhaseStarted {
        phase: Phase,
        index: Option<usize>,
        secs: f64,
    },
    PhaseFinished {
        phase: Phase,
        index: Option<usize>,
        skipped: bool,
        retries: u32,
        elapsed_secs: f64,
    },
    /// A prompt was pasted and submitted.
    PromptDispatched { index: usize, chars: usize },
    AcceptRetried { index: usize },
    /// The operator moved on before the prompt's cycle finished.
    PromptAdvanced { index: usize, phase: Phase },
    /// A non-fatal failure that stayed inside its phase.
    RecoverableFailure { index: usize, detail: String },
    RunFailed { class: FailureClass, reason: String },
    RunCancelled { index: usize },
    RunCompleted { prompts: usize },
    WatchdogRepair { check: String, detail: String },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("path", &self.path)
            .finish()
    }
}

impl ExecutionLog {
    /// Open (or create) a log file, creating parent directories as needed.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
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

    pub fn log(&self, run_id: &str, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Log location for a run started at `started`, under the project's
/// `.stacker` directory.
pub fn run_log_path(stacker_dir: &Path, started: DateTime<Utc>) -> PathBuf {
    stacker_dir
        .join("logs")
        .join(format!("run-{}.jsonl", started.format("%Y%m%dT%H%M%SZ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            run_id: "run-1".to_string(),
            event: LogEvent::PromptDispatched { index: 1, chars: 12 },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"prompt_dispatched\""));
        assert!(json.contains("\"index\":1"));
        assert!(json.contains("\"run_id\":\"run-1\""));
    }

    #[test]
    fn phase_and_failure_events_use_snake_case_names() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            run_id: "r".to_string(),
            event: LogEvent::PhaseStarted {
                phase: Phase::GetReady,
                index: Some(0),
                secs: 2.0,
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"phase\":\"get_ready\""));

        let entry = LogEntry {
            timestamp: Utc::now(),
            run_id: "r".to_string(),
            event: LogEvent::RunFailed {
                class: FailureClass::Consistency,
                reason: "timers edited".to_string(),
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"run_failed\""));
        assert!(json.contains("\"class\":\"consistency\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("test.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log("abc", LogEvent::RunStarted { prompts: 2 }).unwrap();
        log.log("abc", LogEvent::AcceptRetried { index: 0 }).unwrap();
        log.log("abc", LogEvent::RunCompleted { prompts: 2 }).unwrap();

        let lines = read_lines(&log_path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "run_started");
        assert_eq!(lines[1]["event"], "accept_retried");
        assert_eq!(lines[2]["event"], "run_completed");
        for line in &lines {
            assert_eq!(line["run_id"], "abc");
            let ts = line["timestamp"].as_str().unwrap();
            assert!(
                DateTime::parse_from_rfc3339(ts).is_ok(),
                "timestamp should be RFC 3339: {ts}"
            );
        }
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let started = DateTime::parse_from_rfc3339("2026-03-01T09:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let log_path = run_log_path(&tmp.path().join(".stacker"), started);

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log("deadbeef", LogEvent::RunCancelled { index: 0 })
            .unwrap();

        assert!(log_path.exists());
        assert!(log_path.ends_with("logs/run-20260301T093005Z.jsonl"));
        assert_eq!(log.path(), log_path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("append.jsonl");

        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log("one", LogEvent::RunStarted { prompts: 1 }).unwrap();
        }
        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(
                "two",
                LogEvent::WatchdogRepair {
                    check: "orphaned_worker".to_string(),
                    detail: "reset to idle".to_string(),
                },
            )
            .unwrap();
        }

        let lines = read_lines(&log_path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["data"]["check"], "orphaned_worker");
    }
}
