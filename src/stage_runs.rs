//! Run records kept under `<workspace>/runs/<run-id>/`.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::RewriteWarning;
use crate::pipeline::plan::Phase;
use crate::stages::merge::Overwrite;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
pub const LABELS_FILENAME: &str = "labels.json";

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    #[serde(default)]
    pub finished_at_utc: Option<String>,
    pub target: PathBuf,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub failed_phase: Option<Phase>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceRecord>,
    #[serde(default)]
    pub overwritten: Vec<Overwrite>,
    #[serde(default)]
    pub rewritten: usize,
    #[serde(default)]
    pub warnings: Vec<RewriteWarning>,
    #[serde(default)]
    pub installed: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub target_digest: Option<String>,
}

impl RunManifest {
    pub fn new(run_id: &str, pipeline: &str, target: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            target: target.to_path_buf(),
            states: Vec::new(),
            failed_phase: None,
            error: None,
            sources: BTreeMap::new(),
            overwritten: Vec::new(),
            rewritten: 0,
            warnings: Vec::new(),
            installed: Vec::new(),
            labels: BTreeMap::new(),
            target_digest: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at_utc = Some(now_utc_compact());
    }
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Sortable, collision-resistant run identifier.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 22 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// Create the directory for `run_id`; an existing directory is an error.
pub fn create_run_dir(runs_dir: &Path, run_id: &str) -> Result<PathBuf> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("creating runs directory '{}'", runs_dir.display()))?;
    let run_dir = runs_dir.join(run_id);
    fs::create_dir(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
    Ok(run_dir)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing JSON record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_runs(runs_dir: &Path) -> Result<Vec<RunManifest>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(runs_dir: &Path) -> Result<Option<String>> {
    Ok(load_runs(runs_dir)?
        .into_iter()
        .find(|run| run.status == RunStatus::Success)
        .map(|run| run.run_id))
}

/// Remove all but the newest `keep` finished runs. Runs still marked
/// running are left alone.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for run in load_runs(runs_dir)?
        .into_iter()
        .filter(|run| run.status != RunStatus::Running)
        .skip(keep)
    {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed.push(run.run_id);
    }
    Ok(removed)
}

fn run_sort_key(run: &RunManifest) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(runs: &Path, id: &str, status: RunStatus, finished: &str) {
        let mut manifest = RunManifest::new(id, "sandbox", Path::new("/out/rootfs"));
        manifest.status = status;
        manifest.finished_at_utc = Some(finished.to_string());
        write_manifest(&runs.join(id), &manifest).unwrap();
    }

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let first = generate_run_id().unwrap();
        let second = generate_run_id().unwrap();
        assert_ne!(first, second);
        assert!(first.len() <= second.len());
    }

    #[test]
    fn manifest_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let run_id = generate_run_id().unwrap();
        let run_dir = create_run_dir(temp.path(), &run_id).unwrap();
        assert!(create_run_dir(temp.path(), &run_id).is_err());
        let mut manifest = RunManifest::new(&run_id, "sandbox", Path::new("/out/rootfs"));
        manifest.failed_phase = Some(Phase::Installing);
        manifest.finish(RunStatus::Failed);
        write_manifest(&run_dir, &manifest).unwrap();

        let loaded = load_runs(temp.path()).unwrap();
        assert_eq!(loaded, vec![manifest]);
    }

    #[test]
    fn latest_successful_skips_failures() {
        let temp = TempDir::new().unwrap();
        record(temp.path(), "a", RunStatus::Success, "20260101T000000Z");
        record(temp.path(), "b", RunStatus::Failed, "20260102T000000Z");
        assert_eq!(
            latest_successful_run_id(temp.path()).unwrap(),
            Some("a".to_string())
        );
    }

    #[test]
    fn prune_keeps_newest_and_running() {
        let temp = TempDir::new().unwrap();
        record(temp.path(), "old", RunStatus::Success, "20260101T000000Z");
        record(temp.path(), "mid", RunStatus::Failed, "20260102T000000Z");
        record(temp.path(), "new", RunStatus::Success, "20260103T000000Z");
        record(temp.path(), "live", RunStatus::Running, "20260100T000000Z");

        let removed = prune_old_runs(temp.path(), 2).unwrap();

        assert_eq!(removed, vec!["old".to_string()]);
        assert!(temp.path().join("live").exists());
        assert!(temp.path().join("new").exists());
    }

    #[test]
    fn missing_runs_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(load_runs(&temp.path().join("none")).unwrap().is_empty());
    }
}
