use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{AssemblyError, Result};
use crate::params::BuildParams;
use crate::pipeline::paths::{normalize_inside, parse_relative_path, resolve_against};
use crate::pipeline::plan::{BuildStage, RewritePlan, RuntimeStage, StagePlan};
use crate::stages::compile::CompileSpec;
use crate::stages::extract::{BaseImage, ExtractSpec};
use crate::stages::fetch::FetchSpec;
use crate::stages::install::{InstallSpec, RemotePackage};
use crate::stages::merge::MergeEntry;
use crate::stages::rewrite::RewriteRule;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineToml {
    pipeline: PipelineSectionToml,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    build: Vec<BuildToml>,
    #[serde(default)]
    runtime: Vec<RuntimeToml>,
    #[serde(default)]
    copy: Vec<CopyToml>,
    rewrite: Option<RewriteToml>,
    install: Option<InstallToml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSectionToml {
    name: String,
    command_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    name: String,
    repository: String,
    tag: String,
    #[serde(default)]
    submodules: bool,
    commands: Vec<Vec<String>>,
    outputs: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    name: String,
    image: String,
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyToml {
    from: String,
    #[serde(default)]
    source: String,
    destination: String,
    mode: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RewriteToml {
    #[serde(default)]
    roots: Vec<String>,
    rules: Vec<RewriteRuleToml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RewriteRuleToml {
    match_prefix: String,
    replace_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallToml {
    program: Vec<String>,
    index_url: Option<String>,
    index_flag: Option<String>,
    version_separator: Option<String>,
    #[serde(default)]
    remote: Vec<RemotePackage>,
    #[serde(default)]
    local: Vec<String>,
    #[serde(default)]
    cache_dirs: Vec<String>,
    #[serde(default)]
    path_dirs: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// A parsed pipeline file, not yet parameter-expanded.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Directory relative paths in the file resolve against.
    base_dir: PathBuf,
    raw: PipelineToml,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            AssemblyError::Config(format!("reading pipeline '{}': {err}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Self::parse(&text, &base_dir)
            .map_err(|err| AssemblyError::Config(format!("{}: {err}", path.display())))
    }

    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let raw: PipelineToml = toml::from_str(text)
            .map_err(|err| AssemblyError::Config(format!("parsing pipeline: {err}")))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            raw,
        })
    }

    pub fn name(&self) -> &str {
        &self.raw.pipeline.name
    }

    /// Parameter defaults declared in the file's `[params]` table.
    pub fn default_params(&self) -> BuildParams {
        BuildParams::from_defaults(self.raw.params.clone())
    }

    /// Expand parameters, normalize paths and validate the stage graph.
    pub fn resolve(&self, params: &BuildParams) -> Result<StagePlan> {
        let raw = &self.raw;
        let expand = |value: &str| params.expand(value);

        let builds = raw
            .build
            .iter()
            .map(|build| -> Result<BuildStage> {
                let outputs = build
                    .outputs
                    .iter()
                    .map(|out| parse_relative_path(&expand(out), "build output"))
                    .collect::<Result<Vec<_>>>()?;
                Ok(BuildStage {
                    fetch: FetchSpec {
                        stage: build.name.clone(),
                        repository: expand(&build.repository),
                        tag: expand(&build.tag),
                        submodules: build.submodules,
                    },
                    compile: CompileSpec {
                        stage: build.name.clone(),
                        commands: build
                            .commands
                            .iter()
                            .map(|argv| params.expand_all(argv))
                            .collect(),
                        outputs,
                        env: build
                            .env
                            .iter()
                            .map(|(key, value)| (key.clone(), expand(value)))
                            .collect(),
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let runtimes = raw
            .runtime
            .iter()
            .map(|runtime| -> Result<RuntimeStage> {
                Ok(RuntimeStage {
                    extract: ExtractSpec {
                        stage: runtime.name.clone(),
                        image: BaseImage::parse(&expand(&runtime.image), &self.base_dir),
                        path: normalize_inside(&expand(&runtime.path), "runtime path")?,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let merges = raw
            .copy
            .iter()
            .map(|copy| -> Result<MergeEntry> {
                let destination = expand(&copy.destination);
                Ok(MergeEntry {
                    stage: copy.from.clone(),
                    source: parse_relative_path(&expand(&copy.source), "copy source")?,
                    into_dir: destination.ends_with('/'),
                    destination: normalize_inside(&destination, "copy destination")?,
                    mode: copy.mode,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rewrite = raw
            .rewrite
            .as_ref()
            .map(|rewrite| -> Result<RewritePlan> {
                Ok(RewritePlan {
                    rules: rewrite
                        .rules
                        .iter()
                        .map(|rule| {
                            RewriteRule::new(expand(&rule.match_prefix), expand(&rule.replace_prefix))
                        })
                        .collect::<Result<Vec<_>>>()?,
                    roots: rewrite
                        .roots
                        .iter()
                        .map(|root| normalize_inside(&expand(root), "rewrite root"))
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .transpose()?;

        let install = raw
            .install
            .as_ref()
            .map(|install| self.resolve_install(install, params))
            .transpose()?;

        let plan = StagePlan {
            name: expand(&raw.pipeline.name),
            command_timeout: Duration::from_secs(
                raw.pipeline
                    .command_timeout_secs
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
            fetch_timeout: Duration::from_secs(
                raw.pipeline
                    .fetch_timeout_secs
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            builds,
            runtimes,
            merges,
            rewrite,
            install,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn resolve_install(&self, install: &InstallToml, params: &BuildParams) -> Result<InstallSpec> {
        let mut spec = InstallSpec::new(params.expand_all(&install.program));
        spec.index_url = install
            .index_url
            .as_deref()
            .map(|url| params.expand(url))
            .filter(|url| !url.is_empty());
        if let Some(flag) = &install.index_flag {
            spec.index_flag = flag.clone();
        }
        if let Some(separator) = &install.version_separator {
            spec.version_separator = separator.clone();
        }
        spec.remote = install
            .remote
            .iter()
            .map(|package| RemotePackage {
                name: params.expand(&package.name),
                version: package.version.as_deref().map(|v| params.expand(v)),
            })
            .collect();
        spec.local = install
            .local
            .iter()
            .filter_map(|file| {
                let expanded = params.expand(file);
                if expanded.trim().is_empty() {
                    debug!(entry = %file, "local package entry expanded to nothing; skipping");
                    None
                } else {
                    Some(resolve_against(&self.base_dir, &expanded))
                }
            })
            .collect();
        spec.cache_dirs = install
            .cache_dirs
            .iter()
            .map(|dir| normalize_inside(&params.expand(dir), "cache dir"))
            .collect::<Result<Vec<_>>>()?;
        spec.path_dirs = install
            .path_dirs
            .iter()
            .map(|dir| normalize_inside(&params.expand(dir), "path dir"))
            .collect::<Result<Vec<_>>>()?;
        spec.env = install
            .env
            .iter()
            .map(|(key, value)| (key.clone(), params.expand(value)))
            .collect();
        Ok(spec)
    }
}
