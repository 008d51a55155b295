//! External command invocation with timeouts and cancellation.
//!
//! Every toolchain, VCS, container and package-manager call goes through a
//! [`CommandRunner`] so stages never block indefinitely and so tests can
//! script command behaviour.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelToken;

/// Program invocation: argv, working directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Build from an argv vector; `None` when it is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last lines of combined output, for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let combined = format!("{}{}", self.stdout, self.stderr);
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Why a command produced no output.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },
    #[error("'{command}' was cancelled")]
    Cancelled { command: String },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, killing the child on timeout or cancellation.
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ProcessError>;
}

/// Runs real host processes through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        debug!(command = %spec, cwd = ?spec.cwd, "spawning command");
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let group = child.id();

        // Dropping the output future drops the child, which kills it.
        // Whatever it started is in its process group and is killed here.
        let result = tokio::select! {
            output = tokio::time::timeout(timeout, child.wait_with_output()) => match output {
                Ok(Ok(output)) => Ok(CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }),
                Ok(Err(source)) => Err(ProcessError::Spawn {
                    program: spec.program.clone(),
                    source,
                }),
                Err(_) => Err(ProcessError::TimedOut {
                    command: spec.display(),
                    seconds: timeout.as_secs(),
                }),
            },
            _ = cancel.cancelled() => Err(ProcessError::Cancelled {
                command: spec.display(),
            }),
        };
        if let (Err(ProcessError::TimedOut { .. } | ProcessError::Cancelled { .. }), Some(pgid)) =
            (&result, group)
        {
            kill_group(pgid);
        }
        result
    }
}

fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group already gone");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_argv_splits_program() {
        let spec = CommandSpec::from_argv(&["make".to_string(), "-j4".to_string()]).unwrap();
        assert_eq!(spec.program, "make");
        assert_eq!(spec.args, vec!["-j4".to_string()]);
        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "one\ntwo\n".into(),
            stderr: "three\n".into(),
        };
        assert_eq!(output.tail(2), "two\nthree");
        assert_eq!(output.status_text(), "exit status 1");
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = SystemRunner
            .run(&spec, Duration::from_secs(10), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let spec = CommandSpec::new("sleep").arg("5");
        let err = SystemRunner
            .run(&spec, Duration::from_millis(100), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }), "got {err}");
    }

    #[tokio::test]
    async fn system_runner_observes_cancellation() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let spec = CommandSpec::new("sleep").arg("5");
        let err = SystemRunner
            .run(&spec, Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled { .. }), "got {err}");
    }

    #[tokio::test]
    async fn timeout_kills_background_children_too() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("marker");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let spec = CommandSpec::new("sh").args(["-c", script.as_str()]);

        let err = SystemRunner
            .run(&spec, Duration::from_millis(200), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }), "got {err}");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    #[tokio::test]
    async fn system_runner_reports_missing_program() {
        let spec = CommandSpec::new("definitely_not_a_real_command_12345");
        let err = SystemRunner
            .run(&spec, Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
