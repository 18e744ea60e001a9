//! Subdispatch - Multi-GPU Batch Transcription
//!
//! Entry point. With no subcommand it processes everything in the pending
//! directory and exits non-zero only when the batch itself could not run.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use subdispatch::cli::{Args, Commands};
use subdispatch::config::Config;
use subdispatch::device::DeviceMonitorFactory;
use subdispatch::recovery::SweepMode;
use subdispatch::subtitle::convert_transcript;
use subdispatch::workflow::BatchWorkflow;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logging to both console and file
    let _log_guard = setup_logging(&args.workdir, args.verbose)?;
    info!("Starting Subdispatch - Multi-GPU Batch Transcription");

    let config = load_config(args.config.as_deref(), &args.workdir)?;

    match args.command.unwrap_or(Commands::Run { no_progress: false }) {
        Commands::Run { no_progress } => {
            let show_progress = !no_progress && std::io::stderr().is_terminal();
            let workflow = BatchWorkflow::new(config, &args.workdir)?.with_progress(show_progress);
            let summary = workflow.run().await?;
            println!("{}", summary);
        }
        Commands::Sweep { error } => {
            let mode = if error { SweepMode::Error } else { SweepMode::Normal };
            let workflow = BatchWorkflow::new(config, &args.workdir)?;
            let report = workflow.sweep(mode).await?;
            println!(
                "Restored {} inputs, removed {} artifacts and {} directories{}",
                report.restored.len(),
                report.removed_artifacts.len(),
                report.removed_dirs.len(),
                if report.finished_root_removed {
                    ", cleared finished directory"
                } else {
                    ""
                }
            );
        }
        Commands::Devices => {
            let monitor = DeviceMonitorFactory::create_monitor(config.devices.clone());
            let snapshot = monitor.snapshot().await?;
            let required = config.dispatch.required_memory_bytes;

            println!("\n{:<8} {:<12} {:<12} {:<10}", "GPU", "Free (GiB)", "Total (GiB)", "Status");
            println!("{}", "-".repeat(45));
            for (id, memory) in &snapshot {
                let status = if memory.free_bytes >= required { "Ready" } else { "Busy" };
                println!(
                    "{:<8} {:<12.1} {:<12.1} {:<10}",
                    id,
                    memory.free_bytes as f64 / GIB,
                    memory.total_bytes as f64 / GIB,
                    status
                );
            }
            if snapshot.is_empty() {
                println!("No GPU devices found.");
            }
        }
        Commands::Convert { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("srt"));
            let entries = convert_transcript(&input, &output).await?;
            println!("Wrote {} subtitle entries to {}", entries, output.display());
        }
        Commands::InitConfig { output } => {
            Config::default().save_to_file(&output)?;
            println!("Default configuration written to {}", output.display());
        }
    }

    Ok(())
}

fn load_config(explicit: Option<&Path>, workdir: &Path) -> Result<Config> {
    let config = match explicit {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            // Try config.toml in the working directory first
            let candidate: PathBuf = workdir.join("config.toml");
            if candidate.exists() {
                info!("Found {}, loading...", candidate.display());
                Config::from_file(&candidate)?
            } else {
                Config::default()
            }
        }
    };
    Ok(config)
}

fn setup_logging(workdir: &Path, verbose: bool) -> Result<WorkerGuard> {
    // Create log directory
    let log_dir = workdir.join(".subdispatch").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "subdispatch.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    // Determine log level
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Create console layer
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true);

    // Create file layer
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    // Setup layered subscriber
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
