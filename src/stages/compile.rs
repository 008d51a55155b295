//! Stage compiler: runs build commands inside a fetched source tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::stages::{failure_detail, process_failure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileSpec {
    pub stage: String,
    /// Each command is an argv vector; no shell is involved.
    pub commands: Vec<Vec<String>>,
    /// Paths relative to the source tree that must exist afterwards.
    pub outputs: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Run every command in order, stopping at the first failure, then check
/// that each declared output was produced.
pub async fn compile(
    runner: &dyn CommandRunner,
    spec: &CompileSpec,
    source_dir: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let fail = |reason: String| AssemblyError::Build {
        stage: spec.stage.clone(),
        reason,
    };

    for argv in &spec.commands {
        let Some(mut command) = CommandSpec::from_argv(argv) else {
            return Err(fail("empty build command".to_string()));
        };
        command = command.current_dir(source_dir);
        for (key, value) in &spec.env {
            command = command.env(key.as_str(), value.as_str());
        }

        info!(stage = %spec.stage, command = %command, "running build command");
        let output = runner
            .run(&command, timeout, cancel)
            .await
            .map_err(|err| process_failure(&spec.stage, err, fail))?;
        if !output.success() {
            return Err(fail(failure_detail(&command.display(), &output)));
        }
    }

    let missing: Vec<String> = spec
        .outputs
        .iter()
        .filter(|output| std::fs::symlink_metadata(source_dir.join(output)).is_err())
        .map(|output| output.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(fail(format!(
            "declared outputs were not produced: {}",
            missing.join(", ")
        )));
    }

    info!(stage = %spec.stage, outputs = spec.outputs.len(), "build finished");
    Ok(())
}
