//! Epochwise CLI: start, resume and inspect training runs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Epochwise: resumable supervised training
#[derive(Parser, Debug)]
#[command(name = "epochwise", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a run, resuming it if a checkpoint exists
    Train {
        /// Run to create or resume (generated when omitted)
        #[arg(short, long)]
        run_name: Option<String>,
        /// Epochs to run in this invocation
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Seed for a fresh run's random streams
        #[arg(long)]
        seed: Option<u64>,
        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,
        /// Do not write the scalar log
        #[arg(long)]
        no_scalars: bool,
    },
    /// Show the state stored in a run's checkpoint
    Inspect {
        /// Run name
        run_name: String,
        /// Read the best slot instead of the latest
        #[arg(long)]
        best: bool,
        /// Print the raw metric snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List runs under the checkpoint directory
    Runs,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "epochwise", "epochwise")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "epochwise.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = epochwise_core::config::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.resolve_paths(&workspace);

    match cli.command {
        Commands::Train {
            run_name,
            epochs,
            seed,
            lr,
            no_scalars,
        } => {
            let overrides = commands::TrainOverrides {
                run_name,
                epochs,
                seed,
                lr,
                no_scalars,
            };
            commands::apply_train_overrides(&mut config, &overrides);
            commands::handle_train(config)
        }
        Commands::Inspect {
            run_name,
            best,
            json,
        } => commands::handle_inspect(&config, &run_name, best, json),
        Commands::Runs => commands::handle_runs(&config),
    }
}
