pub mod decompose;

use clap::{Parser, Subcommand};

pub use decompose::DecomposeArgs;

#[derive(Parser)]
#[command(name = "dsvae-loss")]
#[command(about = "KL decomposition losses for disentangled sequential VAEs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate every regulariser on a synthetic latent batch
    Decompose(DecomposeArgs),
}
