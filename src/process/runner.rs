//! Worker process launch and supervision.
//!
//! `spawn` starts the worker with piped stdout/stderr and returns a handle
//! for termination plus a single ordered stream of output events. Every line
//! read before the process exits is delivered before the final `Exited`.

use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::WorkerCommand;
use crate::error::SpawnError;
use crate::instances::model::{InstanceStatus, LogKind};

/// How long to wait for the output readers after the process has exited.
/// Grandchildren can keep a pipe open; their output is abandoned after this.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Default classification for lines on this stream.
    pub fn log_kind(self) -> LogKind {
        match self {
            Self::Stdout => LogKind::Info,
            Self::Stderr => LogKind::Error,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code.
    Code(i32),
    /// Killed by a signal, or the exit status could not be collected.
    Abnormal(String),
}

impl ExitOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Code(code) => InstanceStatus::from_exit_code(*code),
            Self::Abnormal(_) => InstanceStatus::Error,
        }
    }
}

/// One item of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A complete line with the terminator removed. Invalid UTF-8 is replaced.
    Line { stream: StreamKind, line: String },
    /// Reading a pipe failed; no more lines will come from that stream.
    ReadError { stream: StreamKind, message: String },
    /// The process is gone. Always the last event.
    Exited(ExitOutcome),
}

/// Ordered output of one worker process.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

/// Termination handle for a spawned worker.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the supervising task to kill the process. Returns `false` if the
    /// handle was already used or the process has already been reaped.
    pub fn terminate(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Launch `command` with `artifact` appended as its final argument.
pub fn spawn(
    command: &WorkerCommand,
    artifact: &Path,
) -> Result<(ProcessHandle, OutputStream), SpawnError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .arg(artifact)
        .envs(command.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
        program: command.program.clone(),
        source,
    })?;

    let pid = child.id();
    let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingPipe {
        program: command.program.clone(),
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or_else(|| SpawnError::MissingPipe {
        program: command.program.clone(),
        stream: "stderr",
    })?;

    info!(program = %command.program, pid = ?pid, "Worker process started");

    let (tx, rx) = mpsc::unbounded_channel();
    let readers = vec![
        read_lines(stdout, StreamKind::Stdout, tx.clone()),
        read_lines(stderr, StreamKind::Stderr, tx.clone()),
    ];

    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            // A dropped handle counts as a kill request.
            _ = kill_rx => {
                debug!(pid = ?pid, "Killing worker process");
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to signal worker process");
                }
                child.wait().await
            }
        };

        let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(READER_DRAIN, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pid = ?pid, "Worker output still open after exit; abandoning readers");
            for abort in aborts {
                abort.abort();
            }
        }

        let outcome = exit_outcome(status);
        debug!(pid = ?pid, outcome = ?outcome, "Worker process exited");
        let _ = tx.send(OutputEvent::Exited(outcome));
    });

    let handle = ProcessHandle {
        pid,
        kill_tx: Some(kill_tx),
    };
    Ok((handle, Box::pin(UnboundedReceiverStream::new(rx))))
}

fn read_lines<R>(
    reader: R,
    stream: StreamKind,
    tx: mpsc::UnboundedSender<OutputEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputEvent::Line { stream, line }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = stream.name(), error = %e, "Failed to read worker output");
                    let _ = tx.send(OutputEvent::ReadError {
                        stream,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    })
}

fn exit_outcome(status: std::io::Result<ExitStatus>) -> ExitOutcome {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ExitOutcome::Code(code),
            None => ExitOutcome::Abnormal(describe_abnormal(status)),
        },
        Err(e) => ExitOutcome::Abnormal(format!("failed to collect exit status: {e}")),
    }
}

#[cfg(unix)]
fn describe_abnormal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => status.to_string(),
    }
}

#[cfg(not(unix))]
fn describe_abnormal(status: ExitStatus) -> String {
    status.to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").with_args(["-c", script, "worker"])
    }

    async fn collect(mut output: OutputStream) -> Vec<OutputEvent> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let mut events = Vec::new();
            while let Some(event) = output.next().await {
                events.push(event);
            }
            events
        })
        .await
        .expect("worker output did not finish")
    }

    fn lines(events: &[OutputEvent], want: StreamKind) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Line { stream, line } if *stream == want => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn delivers_lines_then_exit() {
        let cmd = sh("echo one; echo two >&2; printf 'three\\r\\n'; exit 3");
        let (_handle, output) = spawn(&cmd, Path::new("/dev/null")).unwrap();
        let events = collect(output).await;

        assert_eq!(lines(&events, StreamKind::Stdout), vec!["one", "three"]);
        assert_eq!(lines(&events, StreamKind::Stderr), vec!["two"]);
        assert_eq!(events.last(), Some(&OutputEvent::Exited(ExitOutcome::Code(3))));
    }

    #[tokio::test]
    async fn passes_artifact_path_as_last_argument() {
        let cmd = sh("echo \"$1\"");
        let (_handle, output) = spawn(&cmd, Path::new("/tmp/config_42")).unwrap();
        let events = collect(output).await;
        assert_eq!(lines(&events, StreamKind::Stdout), vec!["/tmp/config_42"]);
    }

    #[tokio::test]
    async fn applies_environment() {
        let cmd = sh("echo \"$GREETING\"").with_env("GREETING", "hello");
        let (_handle, output) = spawn(&cmd, Path::new("/dev/null")).unwrap();
        let events = collect(output).await;
        assert_eq!(lines(&events, StreamKind::Stdout), vec!["hello"]);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_delivered() {
        let cmd = sh("printf 'partial'");
        let (_handle, output) = spawn(&cmd, Path::new("/dev/null")).unwrap();
        let events = collect(output).await;
        assert_eq!(lines(&events, StreamKind::Stdout), vec!["partial"]);
        assert_eq!(events.last(), Some(&OutputEvent::Exited(ExitOutcome::Code(0))));
    }

    #[tokio::test]
    async fn terminate_kills_a_long_running_worker() {
        let cmd = sh("echo ready; exec sleep 30");
        let (mut handle, mut output) = spawn(&cmd, Path::new("/dev/null")).unwrap();

        let first = tokio::time::timeout(TEST_TIMEOUT, output.next()).await.unwrap();
        assert!(matches!(first, Some(OutputEvent::Line { .. })));

        assert!(handle.terminate());
        assert!(!handle.terminate());

        let events = collect(output).await;
        match events.last() {
            Some(OutputEvent::Exited(ExitOutcome::Abnormal(reason))) => {
                assert!(reason.contains("signal"), "{reason}");
            }
            other => panic!("expected abnormal exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let cmd = WorkerCommand::new("/definitely/not/a/worker");
        let Err(err) = spawn(&cmd, Path::new("/dev/null")) else {
            panic!("expected a launch error");
        };
        assert!(matches!(err, SpawnError::Launch { .. }));
    }

    #[test]
    fn exit_outcome_maps_to_status() {
        assert_eq!(ExitOutcome::Code(0).status(), InstanceStatus::Completed);
        assert_eq!(ExitOutcome::Code(2).status(), InstanceStatus::Error);
        assert_eq!(ExitOutcome::Abnormal("x".into()).status(), InstanceStatus::Error);
    }
}
