//! Pipeline orchestration.
//!
//! Producers (fetch+compile per build, extraction per runtime) run
//! concurrently, each in its own staging directory. The first producer
//! failure cancels the rest; every task is joined and its staging directory
//! removed before the failure is reported. Consumers then run sequentially
//! on a `<target>.partial-<run-id>` tree that is renamed onto the target only
//! when every phase succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifact::filesystem::{remove_existing, replace_dir, tree_digest};
use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::params::{BuildParams, TARGET_ROOT_PARAM};
use crate::pipeline::config::PipelineDefinition;
use crate::pipeline::plan::{BuildStage, Phase, RuntimeStage, StagePlan};
use crate::pipeline::state::{PipelineState, PipelineTracker};
use crate::preflight;
use crate::process::CommandRunner;
use crate::stage_runs::{
    create_run_dir, generate_run_id, prune_old_runs, write_json_atomic, write_manifest, RunManifest, RunStatus,
    SourceRecord, LABELS_FILENAME,
};
use crate::stages::compile::compile;
use crate::stages::extract::extract_runtime;
use crate::stages::fetch::fetch_source;
use crate::stages::install::{install_packages, InstallReport};
use crate::stages::labels::image_labels;
use crate::stages::merge::{merge_artifacts, MergeReport};
use crate::stages::rewrite::{PathRewriter, RewriteReport};
use crate::stages::{blocking, StageArtifacts};
use crate::workspace::Workspace;

pub const DEFAULT_KEEP_RUNS: usize = 10;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workspace: PathBuf,
    /// Final tree location; defaults to `<workspace>/out/<pipeline>/rootfs`.
    pub target: Option<PathBuf>,
    /// Finished runs kept after a successful build.
    pub keep_runs: usize,
    /// Check host tools before starting.
    pub preflight: bool,
}

impl PipelineOptions {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            target: None,
            keep_runs: DEFAULT_KEEP_RUNS,
            preflight: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub target: PathBuf,
    pub target_digest: String,
    pub labels: BTreeMap<String, String>,
    pub sources: BTreeMap<String, SourceRecord>,
    pub merge: MergeReport,
    pub rewrite: RewriteReport,
    pub install: InstallReport,
    pub states: Vec<PipelineState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerEvent {
    Fetched,
    Compiled,
}

struct ProducerOutput {
    artifacts: StageArtifacts,
    source: Option<SourceRecord>,
}

/// Everything a single run needs besides the plan.
struct RunContext<'a> {
    plan: &'a StagePlan,
    params: &'a BuildParams,
    workspace: &'a Workspace,
    run_dir: &'a Path,
    partial: &'a Path,
    target: &'a Path,
    cancel: CancelToken,
}

pub struct Pipeline {
    definition: PipelineDefinition,
    params: BuildParams,
    runner: Arc<dyn CommandRunner>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        definition: PipelineDefinition,
        params: BuildParams,
        runner: Arc<dyn CommandRunner>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            definition,
            params,
            runner,
            options,
        }
    }

    pub async fn run(&self) -> Result<BuildOutcome> {
        let workspace = Workspace::open(&self.options.workspace)?;
        let pipeline_name = self.params.expand(self.definition.name());
        let target = match &self.options.target {
            Some(target) => target.clone(),
            None => workspace.default_target(&pipeline_name),
        };
        let run_id = generate_run_id().map_err(internal)?;
        let partial = partial_path(&target, &run_id)?;

        let mut params = self.params.clone();
        params.set(TARGET_ROOT_PARAM, partial.display().to_string());
        let plan = self.definition.resolve(&params)?;
        if self.options.preflight {
            preflight::check_plan(&plan)?;
        }

        let _lock = workspace.lock()?;
        let run_dir = create_run_dir(&workspace.runs_dir(), &run_id).map_err(internal)?;
        let mut manifest = RunManifest::new(&run_id, &plan.name, &target);
        write_manifest(&run_dir, &manifest).map_err(internal)?;

        info!(pipeline = %plan.name, run_id = %run_id, target = %target.display(), "starting build");
        let mut tracker = PipelineTracker::new();
        let ctx = RunContext {
            plan: &plan,
            params: &params,
            workspace: &workspace,
            run_dir: &run_dir,
            partial: &partial,
            target: &target,
            cancel: CancelToken::new(),
        };

        let result = self.execute(&ctx, &mut tracker, &mut manifest).await;
        match result {
            Ok(mut outcome) => {
                tracker
                    .finish()
                    .map_err(|err| AssemblyError::Internal(err.to_string()))?;
                outcome.run_id = run_id;
                outcome.run_dir = run_dir.clone();
                outcome.states = tracker.history().to_vec();

                manifest.states = state_names(&tracker);
                manifest.finish(RunStatus::Success);
                write_manifest(&run_dir, &manifest).map_err(internal)?;
                match prune_old_runs(&workspace.runs_dir(), self.options.keep_runs) {
                    Ok(removed) if !removed.is_empty() => info!(count = removed.len(), "pruned old runs"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %format!("{err:#}"), "failed to prune old runs"),
                }
                info!(pipeline = %plan.name, target = %target.display(), "build finished");
                Ok(outcome)
            }
            Err(err) => {
                let phase = err
                    .phase()
                    .or_else(|| tracker.state().phase())
                    .unwrap_or(Phase::Fetching);
                let err = err.in_phase(phase);
                let cause = err.to_string();
                if let Err(transition) = tracker.fail(Some(phase), cause.clone()) {
                    warn!(error = %transition, "state tracker rejected failure");
                }
                if let Err(cleanup) = remove_existing(&partial) {
                    warn!(path = %partial.display(), error = %format!("{cleanup:#}"), "failed to remove partial target");
                }

                manifest.states = state_names(&tracker);
                manifest.failed_phase = Some(phase);
                manifest.error = Some(cause);
                manifest.finish(RunStatus::Failed);
                if let Err(write_err) = write_manifest(&run_dir, &manifest) {
                    warn!(error = %format!("{write_err:#}"), "failed to persist run manifest");
                }
                error!(pipeline = %plan.name, phase = %phase, error = %err, "build failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext<'_>,
        tracker: &mut PipelineTracker,
        manifest: &mut RunManifest,
    ) -> Result<BuildOutcome> {
        remove_existing(ctx.partial).map_err(internal)?;
        std::fs::create_dir_all(ctx.partial)?;

        let (producers, sources) = self.run_producers(ctx, tracker).await?;
        manifest.sources = sources.clone();

        advance(tracker, Phase::Merging)?;
        let merge = {
            let (partial, merges, cancel) = (
                ctx.partial.to_path_buf(),
                ctx.plan.merges.clone(),
                ctx.cancel.clone(),
            );
            // Producer staging directories are dropped with `producers`
            // as soon as the merge finishes.
            blocking("merge", move || {
                merge_artifacts(&partial, &merges, &producers, &cancel)
            })
            .await
            .map_err(|err| err.in_phase(Phase::Merging))?
        };
        manifest.overwritten = merge.overwritten.clone();

        advance(tracker, Phase::Rewriting)?;
        let rewrite = match &ctx.plan.rewrite {
            Some(plan) => {
                let rewriter = PathRewriter::new(plan.rules.clone())
                    .map_err(|err| err.in_phase(Phase::Rewriting))?;
                let (partial, roots) = (ctx.partial.to_path_buf(), plan.roots.clone());
                blocking("rewrite", move || Ok(rewriter.rewrite_roots(&partial, &roots)))
                    .await
                    .map_err(|err| err.in_phase(Phase::Rewriting))?
            }
            None => RewriteReport::default(),
        };
        manifest.rewritten = rewrite.rewritten.len();
        manifest.warnings = rewrite.warnings.clone();

        advance(tracker, Phase::Installing)?;
        let install = match &ctx.plan.install {
            Some(spec) => install_packages(
                self.runner.as_ref(),
                spec,
                ctx.partial,
                ctx.plan.command_timeout,
                &ctx.cancel,
            )
            .await
            .map_err(|err| err.in_phase(Phase::Installing))?,
            None => InstallReport::default(),
        };
        manifest.installed = install.installed.clone();

        advance(tracker, Phase::Labeling)?;
        let labels = image_labels(ctx.params);
        write_json_atomic(&ctx.run_dir.join(LABELS_FILENAME), &labels)
            .map_err(|err| internal(err).in_phase(Phase::Labeling))?;
        manifest.labels = labels.clone();

        let (partial, target) = (ctx.partial.to_path_buf(), ctx.target.to_path_buf());
        let target_digest = blocking("publish", move || {
            replace_dir(&partial, &target).map_err(internal)?;
            tree_digest(&target, &[]).map_err(internal)
        })
        .await
        .map_err(|err| err.in_phase(Phase::Labeling))?;
        manifest.target_digest = Some(target_digest.clone());
        info!(target = %ctx.target.display(), digest = %target_digest, workspace = %ctx.workspace.root().display(), "target published");

        Ok(BuildOutcome {
            run_id: String::new(),
            run_dir: PathBuf::new(),
            target: ctx.target.to_path_buf(),
            target_digest,
            labels,
            sources,
            merge,
            rewrite,
            install,
            states: Vec::new(),
        })
    }

    async fn run_producers(
        &self,
        ctx: &RunContext<'_>,
        tracker: &mut PipelineTracker,
    ) -> Result<(BTreeMap<String, StageArtifacts>, BTreeMap<String, SourceRecord>)> {
        let staging_root = ctx.workspace.staging_dir();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<Result<ProducerOutput>> = JoinSet::new();

        for build in &ctx.plan.builds {
            tasks.spawn(build_task(
                self.runner.clone(),
                build.clone(),
                staging_root.clone(),
                ctx.plan.fetch_timeout,
                ctx.plan.command_timeout,
                ctx.cancel.clone(),
                events_tx.clone(),
            ));
        }
        for runtime in &ctx.plan.runtimes {
            tasks.spawn(runtime_task(
                self.runner.clone(),
                runtime.clone(),
                staging_root.clone(),
                ctx.plan.command_timeout,
                ctx.cancel.clone(),
            ));
        }
        drop(events_tx);

        let builds = ctx.plan.builds.len();
        advance(tracker, Phase::Fetching)?;
        if builds == 0 {
            advance(tracker, Phase::Extracting)?;
        }

        let (mut fetched, mut compiled) = (0usize, 0usize);
        let mut artifacts = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut first_error: Option<AssemblyError> = None;

        loop {
            tokio::select! {
                Some(event) = events.recv() => match event {
                    ProducerEvent::Fetched => {
                        fetched += 1;
                        if fetched == builds && first_error.is_none() {
                            advance(tracker, Phase::Compiling)?;
                        }
                    }
                    ProducerEvent::Compiled => {
                        compiled += 1;
                        if compiled == builds && first_error.is_none() {
                            advance(tracker, Phase::Extracting)?;
                        }
                    }
                },
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let result = joined.unwrap_or_else(|err| {
                        Err(AssemblyError::Internal(format!("producer task failed: {err}")))
                    });
                    match result {
                        Ok(output) => {
                            if let Some(source) = output.source {
                                sources.insert(output.artifacts.stage.clone(), source);
                            }
                            artifacts.insert(output.artifacts.stage.clone(), output.artifacts);
                        }
                        Err(err) => record_failure(&mut first_error, err, &ctx.cancel),
                    }
                }
            }
        }

        if let Some(err) = first_error {
            drop(artifacts);
            return Err(err);
        }
        advance(tracker, Phase::Extracting)?;
        Ok((artifacts, sources))
    }
}

async fn build_task(
    runner: Arc<dyn CommandRunner>,
    build: BuildStage,
    staging_root: PathBuf,
    fetch_timeout: Duration,
    command_timeout: Duration,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<ProducerEvent>,
) -> Result<ProducerOutput> {
    let staging = staging_dir(&staging_root, build.name())
        .map_err(|err| err.in_phase(Phase::Fetching))?;
    let source_dir = staging.path().join("src");

    let fetched = fetch_source(
        runner.as_ref(),
        &build.fetch,
        &source_dir,
        fetch_timeout,
        &cancel,
    )
    .await
    .map_err(|err| err.in_phase(Phase::Fetching))?;
    let _ = events.send(ProducerEvent::Fetched);

    compile(
        runner.as_ref(),
        &build.compile,
        &source_dir,
        command_timeout,
        &cancel,
    )
    .await
    .map_err(|err| err.in_phase(Phase::Compiling))?;
    let _ = events.send(ProducerEvent::Compiled);

    Ok(ProducerOutput {
        artifacts: StageArtifacts::owned(build.name(), source_dir, staging),
        source: Some(SourceRecord {
            repository: build.fetch.repository.clone(),
            tag: build.fetch.tag.clone(),
            digest: fetched.digest,
        }),
    })
}

async fn runtime_task(
    runner: Arc<dyn CommandRunner>,
    runtime: RuntimeStage,
    staging_root: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
) -> Result<ProducerOutput> {
    let staging = staging_dir(&staging_root, runtime.name())
        .map_err(|err| err.in_phase(Phase::Extracting))?;
    let tree = extract_runtime(
        runner.as_ref(),
        &runtime.extract,
        staging.path(),
        timeout,
        &cancel,
    )
    .await
    .map_err(|err| err.in_phase(Phase::Extracting))?;

    Ok(ProducerOutput {
        artifacts: StageArtifacts::owned(runtime.name(), tree, staging),
        source: None,
    })
}

fn staging_dir(staging_root: &Path, stage: &str) -> Result<tempfile::TempDir> {
    std::fs::create_dir_all(staging_root)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("{stage}-"))
        .tempdir_in(staging_root)?)
}

/// Keep the first real failure; cancellations caused by it are secondary.
fn record_failure(first: &mut Option<AssemblyError>, err: AssemblyError, cancel: &CancelToken) {
    let replace = match first {
        None => true,
        Some(existing) => existing.is_cancelled() && !err.is_cancelled(),
    };
    if replace {
        warn!(error = %err, "producer failed; cancelling remaining stages");
        *first = Some(err);
    }
    cancel.cancel();
}

fn advance(tracker: &mut PipelineTracker, phase: Phase) -> Result<()> {
    tracker
        .advance_to(phase)
        .map_err(|err| AssemblyError::Internal(err.to_string()))
}

fn state_names(tracker: &PipelineTracker) -> Vec<String> {
    tracker.history().iter().map(ToString::to_string).collect()
}

fn partial_path(target: &Path, run_id: &str) -> Result<PathBuf> {
    let name = target.file_name().ok_or_else(|| {
        AssemblyError::Config(format!(
            "target '{}' must name a directory",
            target.display()
        ))
    })?;
    Ok(target.with_file_name(format!("{}.partial-{run_id}", name.to_string_lossy())))
}

fn internal(err: anyhow::Error) -> AssemblyError {
    AssemblyError::Internal(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ok, ScriptedRunner};
    use crate::process::{CommandOutput, CommandSpec, ProcessError};
    use crate::stage_runs::load_runs;
    use async_trait::async_trait;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        image: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            let image = root.join("image");
            let bin = image.join("root/toolsuite/bin");
            fs::create_dir_all(&bin).unwrap();
            fs::write(bin.join("python3"), "elf").unwrap();
            fs::write(bin.join("pip"), "#!/root/toolsuite/bin/python3\nimport pip\n").unwrap();
            fs::set_permissions(bin.join("pip"), fs::Permissions::from_mode(0o755)).unwrap();
            Self {
                _temp: temp,
                root,
                image,
            }
        }

        fn definition(&self, extra: &str) -> PipelineDefinition {
            let text = format!(
                r#"
[pipeline]
name = "sandbox"

[params]
SANDBOX_TAG = "3.4"
IMAGE_VERSION = "1.0.0"

[[build]]
name = "nsjail"
repository = "https://github.com/google/nsjail.git"
tag = "${{SANDBOX_TAG}}"
commands = [["make"]]
outputs = ["nsjail"]

[[runtime]]
name = "toolsuite"
image = "{image}"
path = "/root/toolsuite"

[[copy]]
from = "toolsuite"
source = "."
destination = "/usr/local"

[[copy]]
from = "nsjail"
source = "nsjail"
destination = "/usr/local/bin/"
mode = 0o755

[rewrite]
roots = ["/usr/local/bin"]

[[rewrite.rules]]
match_prefix = "/root/toolsuite/bin"
replace_prefix = "/usr/local/bin"
{extra}
"#,
                image = self.image.display()
            );
            PipelineDefinition::parse(&text, &self.root).unwrap()
        }

        fn options(&self) -> PipelineOptions {
            PipelineOptions {
                workspace: self.root.join("ws"),
                target: Some(self.root.join("out/rootfs")),
                keep_runs: 5,
                preflight: false,
            }
        }

        fn pipeline(&self, extra: &str, runner: Arc<dyn CommandRunner>) -> Pipeline {
            let definition = self.definition(extra);
            let params = definition.default_params();
            Pipeline::new(definition, params, runner, self.options())
        }

        fn staging_is_empty(&self) -> bool {
            fs::read_dir(self.root.join("ws/staging")).unwrap().count() == 0
        }

        fn no_partials(&self) -> bool {
            fs::read_dir(self.root.join("out"))
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .all(|entry| !entry.file_name().to_string_lossy().contains(".partial-"))
                })
                .unwrap_or(true)
        }
    }

    fn fake_clone(cmd: &CommandSpec) -> std::result::Result<CommandOutput, ProcessError> {
        let dest = PathBuf::from(cmd.args.last().unwrap());
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("Makefile"), "all:\n").unwrap();
        ok()
    }

    fn working_toolchain() -> ScriptedRunner {
        ScriptedRunner::new().on("git", fake_clone).on("make", |cmd| {
            let cwd = cmd.cwd.clone().unwrap();
            fs::write(cwd.join("nsjail"), "nsjail-binary").unwrap();
            ok()
        })
    }

    #[tokio::test]
    async fn successful_build_publishes_rewritten_tree() {
        let fixture = Fixture::new();
        let runner = working_toolchain();
        let install = r#"
[install]
program = ["pip", "install"]
remote = [{ name = "numpy", version = "1.19.5" }]
path_dirs = ["/usr/local/bin"]
"#;
        let outcome = fixture
            .pipeline(install, Arc::new(runner.clone()))
            .run()
            .await
            .unwrap();

        let target = fixture.root.join("out/rootfs");
        assert_eq!(outcome.target, target);
        assert_eq!(
            fs::read_to_string(target.join("usr/local/bin/nsjail")).unwrap(),
            "nsjail-binary"
        );
        assert_eq!(
            fs::read_to_string(target.join("usr/local/bin/pip")).unwrap(),
            "#!/usr/local/bin/python3\nimport pip\n"
        );
        assert_eq!(outcome.install.installed, vec!["numpy==1.19.5".to_string()]);
        assert_eq!(outcome.labels["org.opencontainers.image.version"], "1.0.0");
        assert_eq!(outcome.labels["org.opencontainers.image.title"], "");
        assert_eq!(outcome.states.last(), Some(&PipelineState::Done));
        assert_eq!(outcome.sources["nsjail"].tag, "3.4");

        let pip = runner
            .calls()
            .into_iter()
            .find(|cmd| cmd.program == "pip")
            .unwrap();
        let target_root = &pip.env.iter().find(|(k, _)| k == TARGET_ROOT_PARAM).unwrap().1;
        assert!(target_root.contains(".partial-"), "{target_root}");

        assert!(fixture.staging_is_empty());
        assert!(fixture.no_partials());
        assert!(outcome.run_dir.join(LABELS_FILENAME).is_file());
        let runs = load_runs(&fixture.root.join("ws/runs")).unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].target_digest.as_deref(), Some(outcome.target_digest.as_str()));
    }

    #[tokio::test]
    async fn compile_failure_leaves_no_target_behind() {
        let fixture = Fixture::new();
        let runner = ScriptedRunner::new()
            .on("git", fake_clone)
            .on("make", |_| exit(2, "nsjail.cc:1: error"));

        let err = fixture
            .pipeline("", Arc::new(runner))
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Compiling), "{err}");
        assert!(err.to_string().contains("nsjail.cc:1: error"), "{err}");
        assert!(!fixture.root.join("out/rootfs").exists());
        assert!(fixture.no_partials());
        assert!(fixture.staging_is_empty());

        let runs = load_runs(&fixture.root.join("ws/runs")).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].failed_phase, Some(Phase::Compiling));
    }

    /// Git blocks until cancelled, like a clone of a very large repository.
    struct HangingGit;

    #[async_trait]
    impl CommandRunner for HangingGit {
        async fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
            cancel: &CancelToken,
        ) -> std::result::Result<CommandOutput, ProcessError> {
            if spec.program == "git" {
                cancel.cancelled().await;
                return Err(ProcessError::Cancelled {
                    command: spec.display(),
                });
            }
            ok()
        }
    }

    #[tokio::test]
    async fn failing_extraction_cancels_running_fetch() {
        let fixture = Fixture::new();
        fs::remove_dir_all(fixture.image.join("root/toolsuite")).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            fixture.pipeline("", Arc::new(HangingGit)).run(),
        )
        .await
        .expect("cancellation must unblock the fetch")
        .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Extracting), "{err}");
        assert!(!err.is_cancelled());
        assert!(fixture.staging_is_empty());
        assert!(!fixture.root.join("out/rootfs").exists());
    }

    #[tokio::test]
    async fn install_failure_is_reported_in_installing_phase() {
        let fixture = Fixture::new();
        let runner = working_toolchain().on("pip", |_| exit(1, "No matching distribution"));
        let install = r#"
[install]
program = ["pip", "install"]
remote = [{ name = "torch" }]
"#;
        let err = fixture
            .pipeline(install, Arc::new(runner))
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Installing), "{err}");
        assert!(!fixture.root.join("out/rootfs").exists());
        assert!(fixture.no_partials());
    }

    #[tokio::test]
    async fn invalid_pipeline_fails_before_any_run_is_recorded() {
        let fixture = Fixture::new();
        let extra = r#"
[install]
program = []
"#;
        let err = fixture
            .pipeline(extra, Arc::new(working_toolchain()))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, AssemblyError::Validation(_)), "{err}");
        assert!(load_runs(&fixture.root.join("ws/runs")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_workspace_is_rejected() {
        let fixture = Fixture::new();
        let workspace = Workspace::open(&fixture.root.join("ws")).unwrap();
        let _held = workspace.lock().unwrap();

        let err = fixture
            .pipeline("", Arc::new(working_toolchain()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Locked { .. }), "{err}");
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_target() {
        let fixture = Fixture::new();
        let target = fixture.root.join("out/rootfs");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), "old").unwrap();

        fixture
            .pipeline("", Arc::new(working_toolchain()))
            .run()
            .await
            .unwrap();

        assert!(!target.join("stale").exists());
        assert!(target.join("usr/local/bin/nsjail").exists());
    }

    #[test]
    fn partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("/out/rootfs"), "abc").unwrap(),
            PathBuf::from("/out/rootfs.partial-abc")
        );
        assert!(partial_path(Path::new("/"), "abc").is_err());
    }
}
