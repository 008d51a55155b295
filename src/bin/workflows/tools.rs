use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sandbox_assembler::artifact::layer::export_layer;
use sandbox_assembler::pipeline::paths::normalize_inside;
use sandbox_assembler::stages::labels::image_labels;
use sandbox_assembler::stages::rewrite::{PathRewriter, RewriteRule};
use sandbox_assembler::BuildParams;

use super::args::{ExportArgs, OutputFormat, RewriteArgs};
use super::apply_overrides;

pub(crate) fn rewrite(args: RewriteArgs, format: OutputFormat) -> Result<()> {
    if !args.dir.is_dir() {
        bail!("'{}' is not a directory", args.dir.display());
    }
    let rules = args
        .rules
        .iter()
        .map(|(matched, replace)| {
            RewriteRule::new(matched.as_str(), replace.as_str())
                .with_context(|| format!("invalid rule '{matched}={replace}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    let roots = args
        .roots
        .iter()
        .map(|root| inside(root))
        .collect::<Result<Vec<_>>>()?;

    let report = PathRewriter::new(rules)?.rewrite_roots(&args.dir, &roots);
    match format {
        OutputFormat::Text => {
            for path in &report.rewritten {
                println!("rewrote {}", path.display());
            }
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            println!(
                "{} file(s) scanned, {} rewritten, {} warning(s)",
                report.scanned,
                report.rewritten.len(),
                report.warnings.len()
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
    }
    Ok(())
}

pub(crate) fn export(args: ExportArgs, format: OutputFormat) -> Result<()> {
    let params = apply_overrides(BuildParams::new(), &args.params)?;
    let labels = image_labels(&params);
    let summary = export_layer(&args.dir, &args.out, &args.name, &labels).with_context(|| {
        format!(
            "exporting '{}' to '{}'",
            args.dir.display(),
            args.out.display()
        )
    })?;

    match format {
        OutputFormat::Text => {
            println!("layer:   {}", summary.archive.display());
            println!("config:  {}", summary.config.display());
            println!("diff_id: {}", summary.diff_id);
            println!("digest:  {} ({} bytes, {} entries)", summary.digest, summary.size, summary.entries);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
    }
    Ok(())
}

/// Scan roots are given as paths inside the tree; a leading `/` is allowed
/// but `..` is not.
fn inside(root: &Path) -> Result<PathBuf> {
    Ok(normalize_inside(&root.to_string_lossy(), "rewrite root")?)
}
