//! Resolved pipeline plan: the stage graph the orchestrator executes.
//!
//! A [`StagePlan`] is produced from a pipeline definition after parameter
//! expansion. Validation happens here, before any stage has side effects.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AssemblyError, Result};
use crate::pipeline::paths::{is_within, validate_stage_id};
use crate::stages::compile::CompileSpec;
use crate::stages::extract::{BaseImage, ExtractSpec};
use crate::stages::fetch::FetchSpec;
use crate::stages::install::InstallSpec;
use crate::stages::merge::MergeEntry;
use crate::stages::rewrite::{check_rule_chain, RewriteRule};

/// Pipeline phases in execution order.
///
/// Producer phases (fetch, compile, extract) overlap at runtime; the order
/// here is the progress watermark used for state reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Fetching = 1,
    Compiling = 2,
    Extracting = 3,
    Merging = 4,
    Rewriting = 5,
    Installing = 6,
    Labeling = 7,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Fetching,
        Phase::Compiling,
        Phase::Extracting,
        Phase::Merging,
        Phase::Rewriting,
        Phase::Installing,
        Phase::Labeling,
    ];

    pub fn next(self) -> Option<Phase> {
        Self::ALL.iter().copied().find(|phase| *phase > self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fetching => "Fetching",
            Phase::Compiling => "Compiling",
            Phase::Extracting => "Extracting",
            Phase::Merging => "Merging",
            Phase::Rewriting => "Rewriting",
            Phase::Installing => "Installing",
            Phase::Labeling => "Labeling",
        };
        f.write_str(name)
    }
}

/// One node of the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub id: String,
    pub phase: Phase,
    /// Commands as they will be shown in logs.
    pub commands: Vec<String>,
    /// Paths the stage declares as outputs, relative to its working tree.
    pub outputs: BTreeSet<PathBuf>,
    /// Ids of stages whose outputs this stage consumes.
    pub inputs: BTreeSet<String>,
}

impl Stage {
    fn new(id: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            phase,
            commands: Vec::new(),
            outputs: BTreeSet::new(),
            inputs: BTreeSet::new(),
        }
    }
}

/// Fetch-then-compile producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    pub fetch: FetchSpec,
    pub compile: CompileSpec,
}

impl BuildStage {
    pub fn name(&self) -> &str {
        &self.fetch.stage
    }
}

/// Producer that takes a subtree from a prebuilt base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStage {
    pub extract: ExtractSpec,
}

impl RuntimeStage {
    pub fn name(&self) -> &str {
        &self.extract.stage
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RewritePlan {
    pub rules: Vec<RewriteRule>,
    /// Target-relative roots to scan; empty means the whole target.
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub command_timeout: Duration,
    pub fetch_timeout: Duration,
    pub builds: Vec<BuildStage>,
    pub runtimes: Vec<RuntimeStage>,
    /// Merge entries in declaration order; later entries win on collision.
    pub merges: Vec<MergeEntry>,
    pub rewrite: Option<RewritePlan>,
    pub install: Option<InstallSpec>,
}

impl StagePlan {
    pub fn producer_names(&self) -> impl Iterator<Item = &str> {
        self.builds
            .iter()
            .map(BuildStage::name)
            .chain(self.runtimes.iter().map(RuntimeStage::name))
    }

    pub fn needs_git(&self) -> bool {
        !self.builds.is_empty()
    }

    pub fn needs_docker(&self) -> bool {
        self.runtimes
            .iter()
            .any(|runtime| matches!(runtime.extract.image, BaseImage::Docker(_)))
    }

    /// The stage graph: one node per fetch, compile and extract, plus the
    /// single-instance consumer phases that are configured.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();

        for build in &self.builds {
            let mut fetch = Stage::new(fetch_stage_id(build.name()), Phase::Fetching);
            fetch.commands.push(format!(
                "git clone --depth 1 --branch {} {}",
                build.fetch.tag, build.fetch.repository
            ));
            stages.push(fetch);

            let mut compile = Stage::new(build.name(), Phase::Compiling);
            compile.commands = build
                .compile
                .commands
                .iter()
                .map(|argv| argv.join(" "))
                .collect();
            compile.outputs = build.compile.outputs.iter().cloned().collect();
            compile.inputs.insert(fetch_stage_id(build.name()));
            stages.push(compile);
        }

        for runtime in &self.runtimes {
            let mut extract = Stage::new(runtime.name(), Phase::Extracting);
            extract.outputs.insert(PathBuf::new());
            stages.push(extract);
        }

        let mut merge = Stage::new("merge", Phase::Merging);
        merge.inputs = self.merges.iter().map(|entry| entry.stage.clone()).collect();
        stages.push(merge);

        if self.rewrite.is_some() {
            let mut rewrite = Stage::new("rewrite", Phase::Rewriting);
            rewrite.inputs.insert("merge".to_string());
            stages.push(rewrite);
        }

        let mut last = if self.rewrite.is_some() { "rewrite" } else { "merge" };
        if let Some(install) = &self.install {
            let mut stage = Stage::new("install", Phase::Installing);
            stage.commands = install
                .remote
                .iter()
                .map(|package| package.requirement(&install.version_separator))
                .chain(install.local.iter().map(|path| path.display().to_string()))
                .collect();
            stage.inputs.insert(last.to_string());
            stages.push(stage);
            last = "install";
        }

        let mut labels = Stage::new("labels", Phase::Labeling);
        labels.inputs.insert(last.to_string());
        stages.push(labels);

        stages
    }

    /// Stages sorted by phase, declaration order preserved within a phase.
    pub fn execution_order(&self) -> Vec<Stage> {
        let mut stages = self.stages();
        stages.sort_by_key(|stage| stage.phase);
        stages
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("pipeline name must not be empty"));
        }
        if self.command_timeout.is_zero() || self.fetch_timeout.is_zero() {
            return Err(invalid("timeouts must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for name in self.producer_names() {
            validate_stage_id(name)?;
            if matches!(name, "merge" | "rewrite" | "install" | "labels") {
                return Err(invalid(format!("stage name '{name}' is reserved")));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate stage name '{name}'")));
            }
        }

        for build in &self.builds {
            self.validate_build(build)?;
        }

        let outputs: BTreeMap<&str, &[PathBuf]> = self
            .builds
            .iter()
            .map(|build| (build.name(), build.compile.outputs.as_slice()))
            .collect();
        let runtimes: HashSet<&str> = self.runtimes.iter().map(RuntimeStage::name).collect();

        if self.merges.is_empty() {
            return Err(invalid("at least one [[copy]] entry is required"));
        }
        for entry in &self.merges {
            match outputs.get(entry.stage.as_str()) {
                Some(declared) => {
                    if !declared.iter().any(|out| is_within(&entry.source, out)) {
                        return Err(invalid(format!(
                            "copy source '{}' is not a declared output of stage '{}'",
                            entry.source.display(),
                            entry.stage
                        )));
                    }
                }
                None if runtimes.contains(entry.stage.as_str()) => {}
                None => {
                    return Err(invalid(format!(
                        "copy entry references unknown stage '{}'",
                        entry.stage
                    )))
                }
            }
        }

        if let Some(rewrite) = &self.rewrite {
            if rewrite.rules.is_empty() {
                return Err(invalid("[rewrite] needs at least one rule"));
            }
            check_rule_chain(&rewrite.rules)?;
        }

        if let Some(install) = &self.install {
            if install.program.is_empty() || install.program[0].trim().is_empty() {
                return Err(invalid("[install] program must not be empty"));
            }
            if let Some(package) = install.remote.iter().find(|p| p.name.trim().is_empty()) {
                return Err(invalid(format!(
                    "remote package with version {:?} has an empty name",
                    package.version
                )));
            }
        }

        self.validate_graph()
    }

    fn validate_build(&self, build: &BuildStage) -> Result<()> {
        let name = build.name();
        if build.fetch.repository.trim().is_empty() {
            return Err(invalid(format!("build '{name}' has an empty repository")));
        }
        if build.fetch.tag.trim().is_empty() {
            return Err(invalid(format!(
                "build '{name}' has an empty tag (is its parameter set?)"
            )));
        }
        if build.compile.commands.is_empty() {
            return Err(invalid(format!("build '{name}' declares no commands")));
        }
        if build
            .compile
            .commands
            .iter()
            .any(|argv| argv.first().map_or(true, |program| program.trim().is_empty()))
        {
            return Err(invalid(format!("build '{name}' has an empty command")));
        }
        if build.compile.outputs.is_empty() {
            return Err(invalid(format!("build '{name}' declares no outputs")));
        }
        Ok(())
    }

    /// Every input must name an existing stage from a strictly earlier phase.
    fn validate_graph(&self) -> Result<()> {
        let stages = self.stages();
        let phases: BTreeMap<&str, Phase> = stages
            .iter()
            .map(|stage| (stage.id.as_str(), stage.phase))
            .collect();
        for stage in &stages {
            for input in &stage.inputs {
                match phases.get(input.as_str()) {
                    Some(phase) if *phase < stage.phase => {}
                    Some(phase) => {
                        return Err(invalid(format!(
                            "stage '{}' ({}) cannot consume '{}' ({})",
                            stage.id, stage.phase, input, phase
                        )))
                    }
                    None => {
                        return Err(invalid(format!(
                            "stage '{}' consumes unknown stage '{}'",
                            stage.id, input
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn fetch_stage_id(build: &str) -> String {
    format!("fetch-{build}")
}

fn invalid(message: impl Into<String>) -> AssemblyError {
    AssemblyError::Validation(message.into())
}
