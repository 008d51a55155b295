use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub(crate) const WORKSPACE_ENV: &str = "SANDBOX_ASSEMBLER_WORKSPACE";

#[derive(Parser, Debug)]
#[clap(name = "sandbox-assembler")]
#[clap(version, about = "Assemble sandboxed runtime root filesystems from multi-stage pipelines")]
#[clap(propagate_version = true)]
pub(crate) struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub(crate) struct GlobalOpts {
    /// Verbosity level (-v, -vv, -vvv); RUST_LOG takes precedence
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log line format on stderr
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub log_format: LogFormat,

    /// Result format on stdout
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run a pipeline and publish the assembled tree
    Build(BuildArgs),

    /// Resolve and check a pipeline without running it
    Validate(ValidateArgs),

    /// Rewrite interpreter lines under a directory
    Rewrite(RewriteArgs),

    /// Pack a tree into a reproducible .tar.zst layer with image config
    Export(ExportArgs),

    /// List recorded runs of a workspace
    Runs(RunsArgs),
}

#[derive(Args, Debug)]
pub(crate) struct BuildArgs {
    /// Pipeline file (TOML)
    pub pipeline: PathBuf,

    /// Override a build parameter (NAME=VALUE)
    #[clap(long = "param", short = 'p')]
    pub params: Vec<String>,

    /// Workspace directory
    #[clap(long, env = WORKSPACE_ENV)]
    pub workspace: Option<PathBuf>,

    /// Where to publish the assembled tree
    #[clap(long)]
    pub target: Option<PathBuf>,

    /// Finished runs to keep in the workspace
    #[clap(long, default_value_t = sandbox_assembler::pipeline::run::DEFAULT_KEEP_RUNS)]
    pub keep_runs: usize,

    /// Do not check for host tools before building
    #[clap(long)]
    pub skip_preflight: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ValidateArgs {
    /// Pipeline file (TOML)
    pub pipeline: PathBuf,

    /// Override a build parameter (NAME=VALUE)
    #[clap(long = "param", short = 'p')]
    pub params: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct RewriteArgs {
    /// Directory to rewrite in place
    pub dir: PathBuf,

    /// Prefix rule (MATCH=REPLACE); the first matching rule wins
    #[clap(long = "rule", short = 'r', required = true, value_parser = parse_rule)]
    pub rules: Vec<(String, String)>,

    /// Restrict scanning to these paths inside DIR
    #[clap(long = "root")]
    pub roots: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct ExportArgs {
    /// Assembled tree to pack
    pub dir: PathBuf,

    /// Output directory for the layer and its config
    #[clap(long, short = 'o')]
    pub out: PathBuf,

    /// Base name of the written files
    #[clap(long, default_value = "layer")]
    pub name: String,

    /// Label parameter (IMAGE_VERSION=1.0, ...)
    #[clap(long = "param", short = 'p')]
    pub params: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct RunsArgs {
    /// Workspace directory
    #[clap(long, env = WORKSPACE_ENV)]
    pub workspace: Option<PathBuf>,
}

fn parse_rule(raw: &str) -> Result<(String, String), String> {
    let (matched, replace) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MATCH=REPLACE, got '{raw}'"))?;
    if matched.is_empty() {
        return Err("rule match prefix must not be empty".to_string());
    }
    Ok((matched.to_string(), replace.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rules_split_on_first_equals() {
        assert_eq!(
            parse_rule("/root/toolsuite/bin=/usr/local").unwrap(),
            ("/root/toolsuite/bin".to_string(), "/usr/local".to_string())
        );
        assert!(parse_rule("no-separator").is_err());
        assert!(parse_rule("=/usr").is_err());
    }

    #[test]
    fn build_collects_repeated_params() {
        let cli = Cli::try_parse_from([
            "sandbox-assembler",
            "build",
            "sandbox.toml",
            "-p",
            "SANDBOX_TAG=3.4",
            "--param",
            "IMAGE_VERSION=1.0",
            "--skip-preflight",
        ])
        .unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.params, vec!["SANDBOX_TAG=3.4", "IMAGE_VERSION=1.0"]);
        assert!(args.skip_preflight);
        assert_eq!(args.keep_runs, 10);
    }
}
