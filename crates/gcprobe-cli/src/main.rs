//! gcprobe command line.
//!
//! Drives GC safety rounds: inject locks, run GC at a safe point while more
//! locks keep arriving, then check nothing GC should have resolved survived.
//!
//! # Quick Start
//!
//! ```bash
//! # Three rounds with small partitions and a JSON report
//! gcprobe run --rounds 3 --regions 5 --locks-per-region 3 --report report.json
//!
//! # Show the effective configuration
//! gcprobe config
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// gcprobe - GC safety verification for transactional key-value stores.
#[derive(Parser)]
#[command(name = "gcprobe")]
#[command(author, version, long_about = None)]
#[command(about = "gcprobe - GC safety verification for transactional key-value stores")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run verification rounds until stopped or a round fails.
    Run(commands::run::RunArgs),

    /// Show the effective configuration.
    Config {
        /// Project directory holding gcprobe.toml.
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Output format (toml, json).
        #[arg(short, long, default_value = "toml")]
        format: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Run(args) => commands::run::run(&args),
        Commands::Config { project, format } => commands::config::show(&project, &format),
    }
}
