use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facecap_core::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod gui;

#[derive(Parser)]
#[command(name = "facecap", about = "Collect labeled face images from a webcam")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the capture window (default)
    Gui,
    /// Capture a full session without a window
    Capture {
        /// Directory name under the save root (e.g., "people/alice")
        #[arg(short, long)]
        dir: String,
        /// Delay between captures in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Run one external stage and wait for it
    Stage {
        /// Stage name from the config (e.g., "encode")
        name: String,
    },
    /// List V4L2 capture devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Gui) {
        Commands::Gui => gui::run(config),
        Commands::Capture { dir, interval_ms } => commands::capture(&config, &dir, interval_ms),
        Commands::Stage { name } => commands::stage(&config, &name),
        Commands::Devices { json } => commands::devices(json),
        Commands::Config => commands::print_config(&config),
    }
}
