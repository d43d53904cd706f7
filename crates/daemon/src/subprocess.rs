//! Launching and supervising one external process.
//!
//! The child gets a single OS pipe as both stdout and stderr, so its output
//! reaches the reader in exactly the order it was written. Termination is
//! delivered to the OS pid (SIGTERM, then a hard kill after a grace period)
//! rather than relying on pipe closure, and `kill_on_drop` covers actors that
//! exit without cleaning up.

use std::io::{BufRead, BufReader, ErrorKind, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const LINE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("process {0} has no pid")]
    NoPid(String),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line(String),
    Exited(ProcessExit),
}

/// Spawns one binary with varying arguments.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    binary: PathBuf,
    leading_args: Vec<String>,
    kill_grace: Duration,
}

impl SubprocessRunner {
    pub fn new(binary: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            leading_args: Vec::new(),
            kill_grace,
        }
    }

    /// Arguments placed before every invocation's own, e.g. a script path
    /// when `binary` is an interpreter.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn spawn(&self, args: &[String]) -> Result<RunningProcess, SubprocessError> {
        debug!(binary = %self.binary.display(), args = ?args, "spawning process");
        let launch_error = |source| SubprocessError::Launch {
            binary: self.binary.clone(),
            source,
        };

        let (output, stdout) = std::io::pipe().map_err(launch_error)?;
        let stderr = stdout.try_clone().map_err(launch_error)?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        let spawned = cmd.spawn();
        // The command holds the parent's write ends; the reader only sees EOF once they close.
        drop(cmd);

        let child = spawned.map_err(launch_error)?;
        let pid = child
            .id()
            .ok_or_else(|| SubprocessError::NoPid(self.binary.display().to_string()))?;

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        tokio::task::spawn_blocking(move || forward_lines(output, tx));

        Ok(RunningProcess {
            pid,
            child,
            lines,
            exit: None,
            kill_grace: self.kill_grace,
        })
    }
}

/// Read the merged output pipe until EOF, one line at a time.
fn forward_lines(output: PipeReader, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "process output closed");
                break;
            }
        }
    }
}

/// Handle to a live child process.
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    child: Child,
    lines: mpsc::Receiver<String>,
    exit: Option<ProcessExit>,
    kill_grace: Duration,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next output line, or the exit once all output is drained.
    ///
    /// Cancel safe, so it can sit in a `select!` next to a mailbox.
    pub async fn next_event(&mut self) -> ProcessEvent {
        if let Some(exit) = self.exit {
            return ProcessEvent::Exited(exit);
        }
        if let Some(line) = self.lines.recv().await {
            return ProcessEvent::Line(line);
        }
        let exit = match self.child.wait().await {
            Ok(status) => ProcessExit::from(status),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to wait for process");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };
        self.exit = Some(exit);
        ProcessEvent::Exited(exit)
    }

    fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM by pid, then SIGKILL if the process outlives the grace period.
    pub async fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }

        if !signal_pid(self.pid, Signal::Term) {
            debug!(pid = self.pid, "SIGTERM unavailable, killing directly");
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, status = %ProcessExit::from(status), "process terminated");
                self.exit = Some(ProcessExit::from(status));
            }
            Ok(Err(e)) => warn!(pid = self.pid, error = %e, "failed to reap process"),
            Err(_) => {
                warn!(pid = self.pid, grace_ms = self.kill_grace.as_millis() as u64, "process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid = self.pid, error = %e, "failed to kill process");
                }
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.exit = Some(ProcessExit::from(status));
                }
            }
        }
    }
}

/// Deliver `signal` to `pid`; false if the process is gone or the platform lacks the signal.
pub fn signal_pid(pid: u32, signal: Signal) -> bool {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    sys.process(Pid::from_u32(pid))
        .and_then(|process| process.kill_with(signal))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn runner() -> SubprocessRunner {
        SubprocessRunner::new("/bin/sh", Duration::from_millis(500))
    }

    async fn drain(process: &mut RunningProcess) -> (Vec<String>, ProcessExit) {
        let mut lines = Vec::new();
        loop {
            match process.next_event().await {
                ProcessEvent::Line(line) => lines.push(line),
                ProcessEvent::Exited(exit) => return (lines, exit),
            }
        }
    }

    #[tokio::test]
    async fn test_streams_stdout_in_order_and_reports_exit() {
        let mut process = runner().spawn(&sh("echo one; echo two; echo three")).unwrap();
        assert!(process.pid() > 0);

        let (lines, exit) = drain(&mut process).await;
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_stderr_is_merged() {
        let mut process = runner().spawn(&sh("echo out; echo err >&2; exit 3")).unwrap();

        let (lines, exit) = drain(&mut process).await;
        assert_eq!(lines, vec!["out", "err"]);
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interleaved_streams_keep_emission_order() {
        let script = "i=0; while [ $i -lt 200 ]; do echo \"err $i\" >&2; echo \"out $i\"; i=$((i+1)); done";
        let mut process = runner().spawn(&sh(script)).unwrap();

        let (lines, exit) = drain(&mut process).await;

        let expected: Vec<String> = (0..200)
            .flat_map(|i| [format!("err {}", i), format!("out {}", i)])
            .collect();
        assert_eq!(lines, expected);
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_invalid_utf8_and_crlf_are_tolerated() {
        let mut process = runner()
            .spawn(&sh("printf 'a\\377b\\r\\nnext\\n'"))
            .unwrap();

        let (lines, _) = drain(&mut process).await;
        assert_eq!(lines, vec!["a\u{FFFD}b", "next"]);
    }

    #[tokio::test]
    async fn test_exit_is_sticky() {
        let mut process = runner().spawn(&sh("exit 0")).unwrap();
        let (_, first) = drain(&mut process).await;
        assert_eq!(process.next_event().await, ProcessEvent::Exited(first));
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let runner = SubprocessRunner::new("/nonexistent/crf-tool", Duration::from_millis(100));
        let result = runner.spawn(&[]);
        assert!(matches!(result, Err(SubprocessError::Launch { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_long_running_process() {
        let mut process = runner().spawn(&sh("echo started; exec sleep 30")).unwrap();
        assert_eq!(
            process.next_event().await,
            ProcessEvent::Line("started".to_string())
        );

        tokio::time::timeout(Duration::from_secs(5), process.terminate())
            .await
            .expect("terminate finishes within the grace period");

        let (_, exit) = tokio::time::timeout(Duration::from_secs(5), drain(&mut process))
            .await
            .unwrap();
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        let runner = SubprocessRunner::new("/bin/sh", Duration::from_millis(200));
        let mut process = runner
            .spawn(&sh("trap '' TERM; echo ready; exec sleep 30"))
            .unwrap();
        assert_eq!(
            process.next_event().await,
            ProcessEvent::Line("ready".to_string())
        );

        tokio::time::timeout(Duration::from_secs(5), process.terminate())
            .await
            .expect("hard kill after grace period");
        assert!(!process.is_running());
    }
}
