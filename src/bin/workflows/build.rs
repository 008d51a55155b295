use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sandbox_assembler::pipeline::{Pipeline, PipelineDefinition, PipelineOptions};
use sandbox_assembler::{SystemRunner, Workspace};

use super::args::{BuildArgs, OutputFormat, ValidateArgs};
use super::apply_overrides;

pub(crate) async fn build(args: BuildArgs, format: OutputFormat) -> Result<()> {
    let definition = PipelineDefinition::load(&args.pipeline)
        .with_context(|| format!("loading pipeline '{}'", args.pipeline.display()))?;
    let params = apply_overrides(definition.default_params(), &args.params)?;
    let options = PipelineOptions {
        workspace: args.workspace.unwrap_or_else(Workspace::default_root),
        target: args.target,
        keep_runs: args.keep_runs,
        preflight: !args.skip_preflight,
    };

    let outcome = Pipeline::new(definition, params, Arc::new(SystemRunner), options)
        .run()
        .await
        .with_context(|| format!("building pipeline '{}'", args.pipeline.display()))?;

    match format {
        OutputFormat::Text => {
            println!("run:     {}", outcome.run_id);
            println!("target:  {}", outcome.target.display());
            println!("digest:  sha256:{}", outcome.target_digest);
            for (stage, source) in &outcome.sources {
                println!("source:  {stage} {}@{} ({})", source.repository, source.tag, source.digest);
            }
            for overwrite in &outcome.merge.overwritten {
                println!(
                    "overwrote: {} ({} -> {})",
                    overwrite.path.display(),
                    overwrite.previous_stage,
                    overwrite.stage
                );
            }
            println!("rewritten: {} file(s)", outcome.rewrite.rewritten.len());
            for warning in &outcome.rewrite.warnings {
                println!("warning: {warning}");
            }
            for package in &outcome.install.installed {
                println!("installed: {package}");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "run_id": outcome.run_id,
                    "run_dir": outcome.run_dir,
                    "target": outcome.target,
                    "target_digest": outcome.target_digest,
                    "sources": outcome.sources,
                    "merge": outcome.merge,
                    "rewrite": outcome.rewrite,
                    "install": outcome.install,
                    "labels": outcome.labels,
                })
            );
        }
    }
    Ok(())
}

pub(crate) fn validate(args: ValidateArgs, format: OutputFormat) -> Result<()> {
    let definition = PipelineDefinition::load(&args.pipeline)
        .with_context(|| format!("loading pipeline '{}'", args.pipeline.display()))?;
    let params = apply_overrides(definition.default_params(), &args.params)?;
    let plan = definition
        .resolve(&params)
        .with_context(|| format!("validating pipeline '{}'", args.pipeline.display()))?;
    let order = plan.execution_order();

    match format {
        OutputFormat::Text => {
            println!("pipeline '{}' is valid", plan.name);
            for stage in &order {
                let inputs: Vec<&str> = stage.inputs.iter().map(String::as_str).collect();
                if inputs.is_empty() {
                    println!("  {:<11} {}", stage.phase.to_string(), stage.id);
                } else {
                    println!(
                        "  {:<11} {} <- {}",
                        stage.phase.to_string(),
                        stage.id,
                        inputs.join(", ")
                    );
                }
            }
        }
        OutputFormat::Json => {
            let outputs: Vec<PathBuf> = plan.merges.iter().map(|entry| entry.target_path()).collect();
            println!(
                "{}",
                serde_json::json!({
                    "pipeline": plan.name,
                    "stages": order,
                    "target_paths": outputs,
                })
            );
        }
    }
    Ok(())
}
