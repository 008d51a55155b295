//! Dependency installer: runs a package-manager against the target tree.
//!
//! Remote packages are installed before local package files. Package-manager
//! cache directories inside the target are removed afterwards whether or not
//! the installation succeeded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::filesystem::remove_existing;
use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::params::TARGET_ROOT_PARAM;
use crate::process::{CommandRunner, CommandSpec};
use crate::stages::{failure_detail, process_failure};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePackage {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl RemotePackage {
    pub fn requirement(&self, separator: &str) -> String {
        match &self.version {
            Some(version) if !version.is_empty() => format!("{}{separator}{version}", self.name),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    /// Installer argv prefix; the package is appended as the last argument.
    pub program: Vec<String>,
    pub index_url: Option<String>,
    pub index_flag: String,
    pub version_separator: String,
    pub remote: Vec<RemotePackage>,
    /// Host paths of local package files.
    pub local: Vec<PathBuf>,
    /// Target-relative cache directories removed after installation.
    pub cache_dirs: Vec<PathBuf>,
    /// Target-relative directories prepended to `PATH`.
    pub path_dirs: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl InstallSpec {
    pub fn new(program: Vec<String>) -> Self {
        Self {
            program,
            index_url: None,
            index_flag: "--index-url".to_string(),
            version_separator: "==".to_string(),
            remote: Vec::new(),
            local: Vec::new(),
            cache_dirs: Vec::new(),
            path_dirs: Vec::new(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub caches_removed: Vec<PathBuf>,
}

/// Removes cache directories on drop, so cleanup also happens when the
/// installing future is dropped mid-flight.
struct CacheCleanup {
    dirs: Vec<PathBuf>,
    removed: Vec<PathBuf>,
}

impl CacheCleanup {
    fn new(target: &Path, dirs: &[PathBuf]) -> Self {
        Self {
            dirs: dirs.iter().map(|dir| target.join(dir)).collect(),
            removed: Vec::new(),
        }
    }

    fn run(&mut self) -> Vec<PathBuf> {
        for dir in self.dirs.drain(..) {
            if std::fs::symlink_metadata(&dir).is_err() {
                continue;
            }
            match remove_existing(&dir) {
                Ok(()) => {
                    info!(path = %dir.display(), "removed package cache");
                    self.removed.push(dir);
                }
                Err(err) => warn!(path = %dir.display(), error = %format!("{err:#}"), "failed to remove package cache"),
            }
        }
        std::mem::take(&mut self.removed)
    }
}

impl Drop for CacheCleanup {
    fn drop(&mut self) {
        self.run();
    }
}

/// Install every remote package, then every local package file, into the
/// environment rooted at `target`.
pub async fn install_packages(
    runner: &dyn CommandRunner,
    spec: &InstallSpec,
    target: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<InstallReport> {
    let mut cleanup = CacheCleanup::new(target, &spec.cache_dirs);
    let result = install_all(runner, spec, target, timeout, cancel).await;
    let caches_removed = cleanup.run();
    result.map(|installed| InstallReport {
        installed,
        caches_removed,
    })
}

async fn install_all(
    runner: &dyn CommandRunner,
    spec: &InstallSpec,
    target: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Vec<String>> {
    let Some((program, base_args)) = spec.program.split_first() else {
        return Err(AssemblyError::Install {
            package: String::new(),
            reason: "no installer program configured".to_string(),
        });
    };
    let path = search_path(target, &spec.path_dirs);
    let mut installed = Vec::new();

    let remote = spec.remote.iter().map(|package| {
        let mut args: Vec<String> = base_args.to_vec();
        if let Some(url) = &spec.index_url {
            args.push(spec.index_flag.clone());
            args.push(url.clone());
        }
        let requirement = package.requirement(&spec.version_separator);
        args.push(requirement.clone());
        (requirement, args, None::<&Path>)
    });
    let local = spec.local.iter().map(|file| {
        let mut args: Vec<String> = base_args.to_vec();
        args.push(file.display().to_string());
        (file.display().to_string(), args, Some(file.as_path()))
    });

    for (package, args, local_file) in remote.chain(local).collect::<Vec<_>>() {
        let fail = |reason: String| AssemblyError::Install {
            package: package.clone(),
            reason,
        };
        if let Some(file) = local_file {
            if !file.is_file() {
                return Err(fail(format!(
                    "local package file '{}' does not exist",
                    file.display()
                )));
            }
        }

        let mut command = CommandSpec::new(program.as_str())
            .args(args)
            .current_dir(target)
            .env("PATH", path.as_str())
            .env(TARGET_ROOT_PARAM, target.display().to_string());
        for (key, value) in &spec.env {
            command = command.env(key.as_str(), value.as_str());
        }

        info!(package = %package, "installing package");
        let output = runner
            .run(&command, timeout, cancel)
            .await
            .map_err(|err| process_failure("install", err, fail))?;
        if !output.success() {
            return Err(fail(failure_detail(&command.display(), &output)));
        }
        installed.push(package);
    }

    Ok(installed)
}

fn search_path(target: &Path, path_dirs: &[PathBuf]) -> String {
    let mut parts: Vec<String> = path_dirs
        .iter()
        .map(|dir| target.join(dir).display().to_string())
        .collect();
    if let Ok(host) = std::env::var("PATH") {
        if !host.is_empty() {
            parts.push(host);
        }
    }
    parts.join(":")
}
