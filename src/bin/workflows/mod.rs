pub(crate) mod args;
mod build;
mod runs;
mod tools;

pub(crate) use build::{build, validate};
pub(crate) use runs::list_runs;
pub(crate) use tools::{export, rewrite};

use anyhow::{Context, Result};
use sandbox_assembler::BuildParams;

use args::LogFormat;

pub(crate) fn init_logging(verbosity: u8, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

/// Apply `NAME=VALUE` overrides on top of `params`.
pub(crate) fn apply_overrides(mut params: BuildParams, overrides: &[String]) -> Result<BuildParams> {
    for raw in overrides {
        params
            .apply_override(raw)
            .with_context(|| format!("applying parameter override '{raw}'"))?;
    }
    Ok(params)
}
