use anyhow::Result;
use clap::Parser;
use dsvae_loss::cli::{decompose, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Decompose(args) => {
            decompose::run(args)?;
        }
    }

    Ok(())
}
