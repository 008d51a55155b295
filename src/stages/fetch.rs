//! Source fetcher: shallow clone of one tagged revision.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::artifact::filesystem::{remove_existing, tree_digest};
use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::stages::{blocking, failure_detail, process_failure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub stage: String,
    pub repository: String,
    pub tag: String,
    pub submodules: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub dir: PathBuf,
    /// Content digest of the checkout, excluding VCS metadata.
    pub digest: String,
}

/// Clone `spec.repository` at `spec.tag` into `dest`.
///
/// `dest` is replaced if it exists so every build starts from a clean tree.
pub async fn fetch_source(
    runner: &dyn CommandRunner,
    spec: &FetchSpec,
    dest: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<FetchedSource> {
    let fail = |reason: String| AssemblyError::Fetch {
        stage: spec.stage.clone(),
        reason,
    };

    if spec.tag.trim().is_empty() {
        return Err(fail("no tag given".to_string()));
    }
    if spec.repository.trim().is_empty() {
        return Err(fail("no repository given".to_string()));
    }

    remove_existing(dest).map_err(|err| fail(format!("{err:#}")))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut command = CommandSpec::new("git")
        .args(["-c", "advice.detachedHead=false", "clone", "--depth", "1"])
        .args(["--branch", spec.tag.as_str()]);
    if spec.submodules {
        command = command.args(["--recurse-submodules", "--shallow-submodules"]);
    }
    let command = command
        .arg("--")
        .arg(spec.repository.as_str())
        .arg(dest.display().to_string())
        .env("GIT_TERMINAL_PROMPT", "0");

    info!(stage = %spec.stage, repository = %spec.repository, tag = %spec.tag, "fetching source");
    let output = runner
        .run(&command, timeout, cancel)
        .await
        .map_err(|err| process_failure(&spec.stage, err, fail))?;
    if !output.success() {
        return Err(fail(failure_detail(&command.display(), &output)));
    }
    if !dest.is_dir() {
        return Err(fail(format!(
            "clone reported success but '{}' was not created",
            dest.display()
        )));
    }

    let dir = dest.to_path_buf();
    let stage = spec.stage.clone();
    let digest = blocking(&spec.stage, move || {
        tree_digest(&dir, &[".git"]).map_err(|err| AssemblyError::Fetch {
            stage,
            reason: format!("{err:#}"),
        })
    })
    .await?;

    info!(stage = %spec.stage, digest = %digest, "source fetched");
    Ok(FetchedSource {
        dir: dest.to_path_buf(),
        digest,
    })
}
