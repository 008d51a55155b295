use anyhow::Result;
use clap::Parser;

mod workflows;

use workflows::args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    workflows::init_logging(cli.global_opts.verbose, cli.global_opts.log_format);
    let format = cli.global_opts.format;

    match cli.command {
        Commands::Build(args) => workflows::build(args, format).await,
        Commands::Validate(args) => workflows::validate(args, format),
        Commands::Rewrite(args) => workflows::rewrite(args, format),
        Commands::Export(args) => workflows::export(args, format),
        Commands::Runs(args) => workflows::list_runs(args, format),
    }
}
