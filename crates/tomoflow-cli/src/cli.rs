use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tomoflow", about = "Real-time tomographic reconstruction pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Reconstruct live from the scanner's UDP stream.
    Run {
        /// Path to the JSON configuration file.
        #[arg(required = true)]
        config: PathBuf,
        /// Address the detector modules send to.
        #[arg(long, default_value = "10.0.0.10")]
        address: String,
        /// Output directory for reconstructed slices.
        #[arg(long, default_value = "Reco")]
        output: PathBuf,
        /// Filename prefix for saved slices.
        #[arg(long, default_value = "IMG")]
        prefix: String,
    },
    /// Reconstruct a recorded scan from a directory of HIS files.
    Offline {
        /// Path to the JSON configuration file.
        #[arg(required = true)]
        config: PathBuf,
        /// Directory of HIS sinogram files.
        #[arg(required = true)]
        input: PathBuf,
        /// Output directory for reconstructed slices.
        #[arg(long, default_value = "Reco")]
        output: PathBuf,
        /// Filename prefix for saved slices.
        #[arg(long, default_value = "IMG")]
        prefix: String,
    },
}
