//! Sandbox evaluator contract and the command-backed implementation.
//!
//! The evaluator is a black box: it receives the path of a draft artifact
//! and reports an accuracy delta plus any other numbers it cares to share.
//! Calls are synchronous with a bounded runtime and are never retried; a
//! failure only skips the current cycle.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use signaltune_core::config::EvaluatorConfig;
use signaltune_core::metrics::EvaluationReport;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_STEP: Duration = Duration::from_millis(25);
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error("evaluator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("invalid evaluator output: {0}")]
    InvalidOutput(String),
    #[error("evaluator output has no numeric accuracy_gain")]
    MissingGain,
    #[error("I/O error while evaluating: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Scores a draft artifact.
pub trait SandboxEvaluator: Send + Sync {
    fn evaluate(&self, draft_path: &Path) -> Result<EvaluationReport, EvalError>;
}

impl<F> SandboxEvaluator for F
where
    F: Fn(&Path) -> Result<EvaluationReport, EvalError> + Send + Sync,
{
    fn evaluate(&self, draft_path: &Path) -> Result<EvaluationReport, EvalError> {
        self(draft_path)
    }
}

/// Runs an external program with the draft path as its last argument and
/// reads a JSON object from its stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &EvaluatorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.timeout())
    }
}

impl SandboxEvaluator for CommandEvaluator {
    fn evaluate(&self, draft_path: &Path) -> Result<EvaluationReport, EvalError> {
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(draft_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut command);
        let mut child = command.spawn().map_err(|source| EvalError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // block on a full pipe while we poll for exit.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(&mut child));
            }
            thread::sleep(POLL_STEP);
        };

        // Anything the evaluator left running in the background still holds
        // the pipes open, so reading them is bound by the same deadline.
        let (Some(stdout), Some(stderr)) = (collect(stdout, deadline)?, collect(stderr, deadline)?)
        else {
            return Err(self.timed_out(&mut child));
        };
        debug!(
            program = %self.program,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluator finished"
        );

        if !status.success() {
            return Err(EvalError::Failed {
                status: describe_status(status),
                stderr: tail(&stderr, STDERR_TAIL_CHARS),
            });
        }
        parse_report(&stdout)
    }
}

impl CommandEvaluator {
    fn timed_out(&self, child: &mut Child) -> EvalError {
        warn!(program = %self.program, timeout = ?self.timeout, "evaluator timed out, killing it");
        kill_process_group(child);
        if let Err(e) = child.kill() {
            debug!(error = %e, "kill after timeout failed");
        }
        let _ = child.wait();
        EvalError::Timeout(self.timeout)
    }
}

/// Start the evaluator as the leader of a new process group so a timeout
/// can take down everything it spawned.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let group = format!("-{}", child.id());
    let result = Command::new("kill")
        .args(["-s", "KILL", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        debug!(error = %e, "killing evaluator process group failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

type Reader = mpsc::Receiver<io::Result<String>>;

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Reader {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let result = pipe
            .read_to_end(&mut buf)
            .map(|_| String::from_utf8_lossy(&buf).into_owned());
        let _ = tx.send(result);
    });
    rx
}

/// Pipe contents, or `None` if the pipe was still open at `deadline`.
fn collect(reader: Option<Reader>, deadline: Instant) -> Result<Option<String>, EvalError> {
    let Some(rx) = reader else {
        return Ok(Some(String::new()));
    };
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => result.map(Some).map_err(EvalError::Io),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => {
            Err(EvalError::Other("pipe reader thread panicked".into()))
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    status
        .code()
        .map_or_else(|| "signal".to_string(), |code| format!("code {code}"))
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    trimmed.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Parse evaluator stdout.
///
/// The whole output is tried first, then the last non-empty line, so an
/// evaluator may print progress before its final JSON object.
pub fn parse_report(stdout: &str) -> Result<EvaluationReport, EvalError> {
    let trimmed = stdout.trim();
    let value = serde_json::from_str::<Value>(trimmed).or_else(|first| {
        trimmed
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str::<Value>(l.trim()).ok())
            .ok_or_else(|| EvalError::InvalidOutput(first.to_string()))
    })?;
    report_from_value(&value)
}

/// Build a report from a JSON object: `accuracy_gain` is required and every
/// other numeric field is carried along; non-numeric fields are ignored.
pub fn report_from_value(value: &Value) -> Result<EvaluationReport, EvalError> {
    let object = value
        .as_object()
        .ok_or_else(|| EvalError::InvalidOutput("expected a JSON object".into()))?;

    let accuracy_gain = object
        .get("accuracy_gain")
        .and_then(Value::as_f64)
        .filter(|g| g.is_finite())
        .ok_or(EvalError::MissingGain)?;

    let extra: BTreeMap<String, f64> = object
        .iter()
        .filter(|(key, _)| key.as_str() != "accuracy_gain")
        .filter_map(|(key, v)| v.as_f64().map(|n| (key.clone(), n)))
        .collect();

    Ok(EvaluationReport {
        accuracy_gain,
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gain_and_numeric_extras() {
        let report =
            parse_report(r#"{"accuracy_gain": 0.03, "win_rate": 0.55, "note": "ok", "trades": 12}"#)
                .unwrap();
        assert_eq!(report.accuracy_gain, 0.03);
        assert_eq!(report.extra.get("win_rate"), Some(&0.55));
        assert_eq!(report.extra.get("trades"), Some(&12.0));
        assert!(!report.extra.contains_key("note"));
    }

    #[test]
    fn progress_lines_before_json_are_tolerated() {
        let report = parse_report("loading data...\nbacktesting...\n{\"accuracy_gain\": -0.01}\n").unwrap();
        assert_eq!(report.accuracy_gain, -0.01);
    }

    #[test]
    fn missing_or_non_numeric_gain_is_rejected() {
        assert!(matches!(parse_report(r#"{"win_rate": 0.5}"#), Err(EvalError::MissingGain)));
        assert!(matches!(
            parse_report(r#"{"accuracy_gain": "high"}"#),
            Err(EvalError::MissingGain)
        ));
        assert!(matches!(parse_report("[1, 2]"), Err(EvalError::InvalidOutput(_))));
        assert!(matches!(parse_report("Traceback ..."), Err(EvalError::InvalidOutput(_))));
    }

    #[test]
    fn closures_are_evaluators() {
        let eval = |_: &Path| -> Result<EvaluationReport, EvalError> {
            Ok(EvaluationReport {
                accuracy_gain: 0.02,
                ..Default::default()
            })
        };
        let boxed: Box<dyn SandboxEvaluator> = Box::new(eval);
        assert_eq!(boxed.evaluate(Path::new("x")).unwrap().accuracy_gain, 0.02);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let eval = CommandEvaluator::new(
            "signaltune-no-such-evaluator",
            Vec::new(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            eval.evaluate(Path::new("draft.toml")),
            Err(EvalError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_output_is_parsed() {
        let eval = CommandEvaluator::new(
            "sh",
            vec!["-c".into(), r#"echo '{"accuracy_gain": 0.04}'"#.into(), "sh".into()],
            Duration::from_secs(10),
        );
        let report = eval.evaluate(Path::new("draft.toml")).unwrap();
        assert_eq!(report.accuracy_gain, 0.04);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_failure() {
        let eval = CommandEvaluator::new(
            "sh",
            vec!["-c".into(), "echo broken >&2; exit 3".into(), "sh".into()],
            Duration::from_secs(10),
        );
        match eval.evaluate(Path::new("draft.toml")) {
            Err(EvalError::Failed { status, stderr }) => {
                assert_eq!(status, "code 3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn background_child_cannot_stretch_the_deadline() {
        let eval = CommandEvaluator::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"accuracy_gain": 0.04}'; sleep 30 & exit 0"#.into(),
                "sh".into(),
            ],
            Duration::from_millis(500),
        );
        let started = Instant::now();
        let result = eval.evaluate(Path::new("draft.toml"));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        assert!(matches!(result, Err(EvalError::Timeout(_))), "{result:?}");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_whole_process_group() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("survivor");
        let script = format!("(sleep 1; touch '{}') & sleep 30", marker.display());
        let eval = CommandEvaluator::new(
            "sh",
            vec!["-c".into(), script, "sh".into()],
            Duration::from_millis(200),
        );

        assert!(matches!(
            eval.evaluate(Path::new("draft.toml")),
            Err(EvalError::Timeout(_))
        ));
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background process outlived the timeout");
    }

    #[cfg(unix)]
    #[test]
    fn hung_evaluator_is_killed() {
        let eval = CommandEvaluator::new(
            "sh",
            vec!["-c".into(), "exec sleep 30".into(), "sh".into()],
            Duration::from_millis(200),
        );
        let started = Instant::now();
        assert!(matches!(
            eval.evaluate(Path::new("draft.toml")),
            Err(EvalError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
