use anyhow::{Context, Result};
use sandbox_assembler::stage_runs::{latest_successful_run_id, load_runs};
use sandbox_assembler::Workspace;

use super::args::{OutputFormat, RunsArgs};

pub(crate) fn list_runs(args: RunsArgs, format: OutputFormat) -> Result<()> {
    let root = args.workspace.unwrap_or_else(Workspace::default_root);
    let runs_dir = root.join("runs");
    let runs = load_runs(&runs_dir)
        .with_context(|| format!("reading runs under '{}'", runs_dir.display()))?;
    let latest = latest_successful_run_id(&runs_dir)?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("no runs recorded in '{}'", root.display());
        return Ok(());
    }
    for run in &runs {
        let marker = if latest.as_deref() == Some(run.run_id.as_str()) {
            "*"
        } else {
            " "
        };
        let status = match &run.failed_phase {
            Some(phase) => format!("{} during {phase}", run.status),
            None => run.status.to_string(),
        };
        println!(
            "{marker} {:<24} {:<20} {:<18} {}",
            run.run_id,
            run.pipeline,
            run.finished_at_utc.as_deref().unwrap_or(&run.created_at_utc),
            status
        );
    }
    Ok(())
}
