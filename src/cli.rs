use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Working directory holding the pending, staging and finished folders
    #[arg(short, long, default_value = ".")]
    pub workdir: PathBuf,

    /// Defaults to `run` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcribe every file in the pending directory across all GPUs
    Run {
        /// Do not draw a progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Restore unfinished jobs to the pending directory
    Sweep {
        /// Also remove the finished directory (moving its inputs back first)
        #[arg(long)]
        error: bool,
    },

    /// Show free and total memory of every GPU
    Devices,

    /// Convert a transcript JSON file to SRT
    Convert {
        /// Input transcript file
        #[arg(short, long)]
        input: PathBuf,

        /// Output SRT file (defaults to the input with .srt extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output configuration file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}
