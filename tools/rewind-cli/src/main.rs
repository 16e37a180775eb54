//! Rewind CLI: run the clip capture engine from a terminal.
//!
//! Usage:
//!   rewind run [OPTIONS]       Buffer the screen and save clips on command
//!   rewind check               Check that the capture elements are installed
//!   rewind config [--init]     Show or create the config file

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use rewind_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "rewind",
    about = "Retrospective screen clips: save what just happened",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the standard location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start buffering and read control commands from stdin
    Run {
        /// Clip directory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Default pre-roll (milliseconds)
        #[arg(long)]
        pre_ms: Option<u64>,

        /// Default post-roll (milliseconds)
        #[arg(long)]
        post_ms: Option<u64>,

        /// Disable audio capture
        #[arg(long)]
        no_audio: bool,

        /// X11 display to capture
        #[arg(long)]
        display: Option<String>,

        /// PipeWire screencast node to capture
        #[arg(long, conflicts_with = "display")]
        pipewire_node: Option<u32>,

        /// Use synthetic test sources instead of real devices
        #[arg(long)]
        test_sources: bool,
    },

    /// Check that the required GStreamer elements are installed
    Check {
        /// Check for the synthetic test sources as well
        #[arg(long)]
        test_sources: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file if it does not exist
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    // Initialize logging
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    rewind_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            root,
            pre_ms,
            post_ms,
            no_audio,
            display,
            pipewire_node,
            test_sources,
        } => {
            if let Some(root) = root {
                config.clips_dir = root;
            }
            if let Some(pre_ms) = pre_ms {
                config.capture.pre_roll_ms = pre_ms;
            }
            if let Some(post_ms) = post_ms {
                config.capture.post_roll_ms = post_ms;
            }
            if no_audio {
                config.audio.enabled = false;
            }
            let sources = commands::run::Sources {
                display,
                pipewire_node,
                test: test_sources,
            };
            commands::run::run(config, sources).await
        }
        Commands::Check { test_sources } => commands::check::run(&config, test_sources),
        Commands::Config { init } => commands::config::run(&config, cli.config.as_deref(), init),
    }
}
