//! Assembly merger: layers producer artifacts into the target tree.
//!
//! Entries are applied sequentially in declaration order. When two entries
//! write the same target path the later one wins and the collision is
//! recorded in the [`MergeReport`].

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::filesystem::{copy_dir_recursive, copy_entry, ensure_no_symlink_parents};
use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::stages::{copy_failure, StageArtifacts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEntry {
    pub stage: String,
    /// Path relative to the producer's output root; empty means the root.
    pub source: PathBuf,
    /// Path relative to the target root.
    pub destination: PathBuf,
    /// Place the source inside `destination` under its own name.
    pub into_dir: bool,
    pub mode: Option<u32>,
}

impl MergeEntry {
    /// Target-relative path the entry writes.
    pub fn target_path(&self) -> PathBuf {
        match (self.into_dir, self.source.file_name()) {
            (true, Some(name)) => self.destination.join(name),
            _ => self.destination.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedArtifact {
    pub stage: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overwrite {
    pub path: PathBuf,
    pub previous_stage: String,
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub applied: Vec<AppliedArtifact>,
    pub overwritten: Vec<Overwrite>,
}

/// Apply `entries` onto `target` using the artifacts of finished producers.
pub fn merge_artifacts(
    target: &Path,
    entries: &[MergeEntry],
    producers: &BTreeMap<String, StageArtifacts>,
    cancel: &CancelToken,
) -> Result<MergeReport> {
    fs::create_dir_all(target)?;
    let mut written: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut report = MergeReport::default();

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(AssemblyError::Cancelled {
                stage: entry.stage.clone(),
            });
        }
        let fail = |reason: String| AssemblyError::Merge {
            stage: entry.stage.clone(),
            reason,
        };

        let producer = producers
            .get(&entry.stage)
            .ok_or_else(|| fail("stage produced no artifacts".to_string()))?;
        let src = producer.resolve(&entry.source);
        let meta = fs::symlink_metadata(&src).map_err(|err| {
            fail(format!(
                "source '{}' is missing from the stage output: {err}",
                entry.source.display()
            ))
        })?;

        let dest_rel = entry.target_path();
        let dst = if dest_rel.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(&dest_rel)
        };

        // Earlier entries may have left symlinks that point off the target.
        ensure_no_symlink_parents(target, &dest_rel).map_err(|err| fail(format!("{err:#}")))?;

        let mut touched = Vec::new();
        if meta.is_dir() {
            copy_dir_recursive(&src, &dst, cancel, &mut |rel: &Path| {
                touched.push(dest_rel.join(rel))
            })
            .map_err(|err| copy_failure(&entry.stage, err, fail))?;
        } else {
            copy_entry(&src, &dst).map_err(|err| copy_failure(&entry.stage, err, fail))?;
            touched.push(dest_rel.clone());
        }

        if let Some(mode) = entry.mode {
            if !meta.file_type().is_symlink() {
                fs::set_permissions(&dst, fs::Permissions::from_mode(mode))
                    .map_err(|err| fail(format!("setting mode {mode:o} on '{}': {err}", dst.display())))?;
            }
        }

        let count = touched.len();
        for path in touched {
            if let Some(previous_stage) = written.insert(path.clone(), entry.stage.clone()) {
                info!(
                    path = %path.display(),
                    previous_stage = %previous_stage,
                    stage = %entry.stage,
                    "artifact overwrote an earlier artifact"
                );
                report.overwritten.push(Overwrite {
                    path,
                    previous_stage,
                    stage: entry.stage.clone(),
                });
            }
        }

        debug!(stage = %entry.stage, destination = %dest_rel.display(), entries = count, "artifact merged");
        report.applied.push(AppliedArtifact {
            stage: entry.stage.clone(),
            source: entry.source.clone(),
            destination: dest_rel,
            entries: count,
        });
    }

    info!(
        artifacts = report.applied.len(),
        collisions = report.overwritten.len(),
        "merge finished"
    );
    Ok(report)
}
