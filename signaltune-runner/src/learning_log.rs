//! Learning log: JSONL append-only record of what the loop did.
//!
//! One JSON object per line. The log is an audit trail, not state: write
//! failures are logged and swallowed, and reading skips malformed lines.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Something the loop or the approval path did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    LoopStarted {
        seed: u64,
    },
    DraftGenerated {
        content_hash: String,
        description: String,
    },
    Evaluated {
        content_hash: String,
        accuracy_gain: f64,
        baseline: f64,
        candidate: f64,
    },
    EvaluationFailed {
        content_hash: String,
        reason: String,
    },
    AutoPromoted {
        version_id: String,
        accuracy: f64,
    },
    ApprovalRequested {
        request_id: String,
        accuracy: f64,
    },
    Approved {
        request_id: String,
        version_id: String,
    },
    Rejected {
        request_id: String,
    },
    Expired {
        request_id: String,
    },
    ApproveAllFinished {
        promoted: usize,
        failed: usize,
    },
    RolledBack {
        target: String,
        version_id: String,
    },
    LoopError {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// JSONL learning log file.
#[derive(Debug, Clone)]
pub struct LearningLog {
    path: PathBuf,
}

impl LearningLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event stamped with the current time. Never fails.
    pub fn record(&self, event: LogEvent) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            event,
        };
        if let Err(e) = self.append(&entry) {
            warn!(path = %self.path.display(), error = %e, "cannot write learning log entry");
        }
    }

    pub fn append(&self, entry: &LogEntry) -> io::Result<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()
    }

    /// Read all entries. Skips malformed lines.
    pub fn read_all(&self) -> io::Result<Vec<LogEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for (lineno, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed learning log entry"
                ),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn events_roundtrip_with_tag() {
        let tmp = TempDir::new().unwrap();
        let log = LearningLog::new(tmp.path().join("logs/learning_log.jsonl"));

        log.record(LogEvent::LoopStarted { seed: 42 });
        log.record(LogEvent::Rejected {
            request_id: "20240101120000".into(),
        });

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, LogEvent::LoopStarted { seed: 42 });

        let raw = fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().nth(1).unwrap().contains(r#""event":"rejected""#));
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn malformed_lines_are_skipped_with_a_warning() {
        let tmp = TempDir::new().unwrap();
        let log = LearningLog::new(tmp.path().join("learning_log.jsonl"));
        log.record(LogEvent::LoopError {
            message: "boom".into(),
        });
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "not json at all").unwrap();

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let entries = tracing::subscriber::with_default(subscriber, || log.read_all().unwrap());

        assert_eq!(entries.len(), 1);
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("skipping malformed learning log entry"), "{output}");
        assert!(output.contains("line=2"), "{output}");
    }

    #[test]
    fn unwritable_log_does_not_panic() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be.
        let log = LearningLog::new(tmp.path());
        log.record(LogEvent::LoopStarted { seed: 1 });
    }
}
