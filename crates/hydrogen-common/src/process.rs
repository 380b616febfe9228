//! Child process supervision.
//!
//! A [`ChildProcess`] owns one spawned program. Two background tasks are
//! attached to it:
//!
//! - a supervisor that waits for the exit (or a kill request) and reports an
//!   [`ExitOutcome`] exactly once
//! - a stderr pump that re-emits every line as a `tracing` event with target
//!   `hydrogen::driver`
//!
//! stdin and stdout are supplied by the caller, typically one end of a Unix
//! socket pair.
//!
//! # Example
//!
//! ```ignore
//! use hydrogen_common::process::{ChildProcess, ProcessSpec};
//! use std::process::Stdio;
//!
//! let spec = ProcessSpec::new("ccd", "/usr/bin/indi_simulator_ccd")
//!     .env("INDIDEV", "CCD Simulator");
//! let mut child = ChildProcess::spawn(&spec, Stdio::null(), Stdio::null())?;
//! child.kill()?;
//! let outcome = child.wait().await?;
//! assert!(outcome.killed);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CommonError, CommonResult};

/// Target used for re-emitted child stderr lines.
pub const DRIVER_LOG_TARGET: &str = "hydrogen::driver";

/// Description of a program to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Human readable label used in logs.
    pub label: String,
    /// Program path.
    pub program: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Creates a spec with no arguments and no extra environment.
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// True if the exit was caused by [`ChildProcess::kill`].
    pub killed: bool,
}

impl ExitOutcome {
    fn from_status(status: std::io::Result<ExitStatus>, killed: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
                killed,
            },
            Err(e) => {
                warn!(error = %e, "Failed to reap child process");
                Self {
                    code: None,
                    signal: None,
                    killed,
                }
            }
        }
    }

    /// Returns true if the process exited with status 0.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => write!(f, "unknown status")?,
        }
        if self.killed {
            write!(f, " (killed)")?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// A spawned, supervised child process.
///
/// Dropping the handle kills the child.
#[derive(Debug)]
pub struct ChildProcess {
    label: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<oneshot::Receiver<ExitOutcome>>,
}

impl ChildProcess {
    /// Spawns the program described by `spec`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(spec: &ProcessSpec, stdin: Stdio, stdout: Stdio) -> CommonResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CommonError::spawn(&spec.program, e))?;
        let pid = child.id();

        debug!(
            label = %spec.label,
            program = %spec.program.display(),
            pid = ?pid,
            "Spawned child process"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(spec.label.clone(), stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let label = spec.label.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => ExitOutcome::from_status(status, false),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(label = %label, error = %e, "Kill request on exited child");
                    }
                    ExitOutcome::from_status(child.wait().await, true)
                }
            };
            debug!(label = %label, outcome = %outcome, "Child process exited");
            // Nobody listening is fine: the owner may already be gone.
            let _ = exit_tx.send(outcome);
        });

        Ok(Self {
            label: spec.label.clone(),
            pid,
            kill_tx: Some(kill_tx),
            exit_rx: Some(exit_rx),
        })
    }

    /// Returns the label given at spawn time.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests termination. The exit is still reported through
    /// [`ChildProcess::wait`] or [`ChildProcess::take_exit`].
    pub fn kill(&mut self) -> CommonResult<()> {
        let tx = self.kill_tx.take().ok_or_else(|| CommonError::AlreadyExited {
            label: self.label.clone(),
        })?;
        tx.send(()).map_err(|_| CommonError::AlreadyExited {
            label: self.label.clone(),
        })
    }

    /// Takes the exit notification so it can be awaited elsewhere.
    ///
    /// Returns `None` if it was already taken.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitOutcome>> {
        self.exit_rx.take()
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> CommonResult<ExitOutcome> {
        let rx = self.exit_rx.take().ok_or_else(|| CommonError::AlreadyExited {
            label: self.label.clone(),
        })?;
        rx.await.map_err(|_| CommonError::AlreadyExited {
            label: self.label.clone(),
        })
    }
}

async fn pump_stderr(label: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: DRIVER_LOG_TARGET, driver = %label, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(label = %label, error = %e, "stderr capture ended");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("test", "/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let mut child = ChildProcess::spawn(&sh("exit 3"), Stdio::null(), Stdio::null()).unwrap();
        assert!(child.pid().is_some());

        let outcome = child.wait().await.unwrap();
        assert_eq!(
            outcome,
            ExitOutcome {
                code: Some(3),
                signal: None,
                killed: false
            }
        );
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_kill_marks_outcome() {
        let mut child = ChildProcess::spawn(&sh("sleep 30"), Stdio::null(), Stdio::null()).unwrap();
        child.kill().unwrap();

        let outcome = child.wait().await.unwrap();
        assert!(outcome.killed);
        assert_eq!(outcome.code, None);
        assert_eq!(outcome.signal, Some(9));
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let spec = sh(r#"test "$INDIDEV" = "Cam""#).env("INDIDEV", "Cam");
        let mut child = ChildProcess::spawn(&spec, Stdio::null(), Stdio::null()).unwrap();
        assert!(child.wait().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_wait_twice_fails() {
        let mut child = ChildProcess::spawn(&sh("exit 0"), Stdio::null(), Stdio::null()).unwrap();
        child.wait().await.unwrap();
        assert!(matches!(
            child.wait().await,
            Err(CommonError::AlreadyExited { .. })
        ));
    }

    #[tokio::test]
    async fn test_take_exit() {
        let mut child = ChildProcess::spawn(&sh("exit 0"), Stdio::null(), Stdio::null()).unwrap();
        let rx = child.take_exit().unwrap();
        assert!(child.take_exit().is_none());
        assert!(rx.await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let spec = ProcessSpec::new("ghost", "/nonexistent/indi_ghost");
        let err = ChildProcess::spawn(&spec, Stdio::null(), Stdio::null()).unwrap_err();
        assert!(matches!(err, CommonError::Spawn { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_outcome_display() {
        let outcome = ExitOutcome {
            code: None,
            signal: Some(9),
            killed: true,
        };
        assert_eq!(outcome.to_string(), "signal 9 (killed)");
        assert_eq!(
            ExitOutcome {
                code: Some(1),
                ..Default::default()
            }
            .to_string(),
            "exit code 1"
        );
    }
}
