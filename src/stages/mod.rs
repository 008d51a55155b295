//! Pipeline stages.
//!
//! Producers ([`fetch`], [`compile`], [`extract`]) fill private staging
//! directories; consumers ([`merge`], [`rewrite`], [`install`], [`labels`])
//! work on the target filesystem tree.

pub mod compile;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod labels;
pub mod merge;
pub mod rewrite;

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::AssemblyError;
use crate::process::{CommandOutput, ProcessError};

/// Lines of command output kept in error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// Outputs of a finished producer.
///
/// Owns the producer's staging directory; dropping the artifacts removes it.
#[derive(Debug)]
pub struct StageArtifacts {
    pub stage: String,
    /// Directory the declared outputs are relative to.
    pub root: PathBuf,
    _staging: Option<TempDir>,
}

impl StageArtifacts {
    pub fn owned(stage: impl Into<String>, root: PathBuf, staging: TempDir) -> Self {
        Self {
            stage: stage.into(),
            root,
            _staging: Some(staging),
        }
    }

    /// Artifacts living in a directory the caller keeps alive.
    pub fn borrowed(stage: impl Into<String>, root: PathBuf) -> Self {
        Self {
            stage: stage.into(),
            root,
            _staging: None,
        }
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

/// Map a command runner failure to a stage error, keeping timeouts and
/// cancellation distinct from the stage's own failure kind.
pub(crate) fn process_failure(
    stage: &str,
    err: ProcessError,
    wrap: impl FnOnce(String) -> AssemblyError,
) -> AssemblyError {
    match err {
        ProcessError::TimedOut { command, seconds } => AssemblyError::Timeout {
            stage: stage.to_string(),
            command,
            seconds,
        },
        ProcessError::Cancelled { .. } => AssemblyError::Cancelled {
            stage: stage.to_string(),
        },
        spawn @ ProcessError::Spawn { .. } => wrap(spawn.to_string()),
    }
}

pub(crate) fn failure_detail(command: &str, output: &CommandOutput) -> String {
    let tail = output.tail(OUTPUT_TAIL_LINES);
    if tail.is_empty() {
        format!("'{command}' failed with {}", output.status_text())
    } else {
        format!("'{command}' failed with {}:\n{tail}", output.status_text())
    }
}

/// Run blocking filesystem work off the async runtime.
pub(crate) async fn blocking<T, F>(stage: &str, work: F) -> crate::error::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        AssemblyError::Internal(format!("blocking task for stage '{stage}' failed: {err}"))
    })?
}

/// Convert a copy error, recognizing cooperative cancellation.
pub(crate) fn copy_failure(
    stage: &str,
    err: anyhow::Error,
    wrap: impl FnOnce(String) -> AssemblyError,
) -> AssemblyError {
    if err
        .downcast_ref::<crate::artifact::filesystem::CopyCancelled>()
        .is_some()
    {
        AssemblyError::Cancelled {
            stage: stage.to_string(),
        }
    } else {
        wrap(format!("{err:#}"))
    }
}
