pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::{FitArgs, GuideType, InitLoc};

#[derive(Parser)]
#[command(name = "candle-autoguide")]
#[command(about = "Automatic variational guides for probabilistic models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a guide to a simulated hierarchical model
    Fit(FitArgs),
}
