//! PebbleFS Command Line Interface
//!
//! Works on filesystem images without mounting them in the host.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// PebbleFS - power-loss resilient filesystem for flash images
#[derive(Parser)]
#[command(
    name = "pebblefs",
    about = "PebbleFS command-line interface",
    version = env!("CARGO_PKG_VERSION"),
    author = "PebbleFS Contributors"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format an image with PebbleFS
    Format(commands::format::FormatArgs),

    /// List a directory
    Ls(commands::files::LsArgs),

    /// Print a file
    Cat(commands::files::CatArgs),

    /// Copy a host file into the image
    Put(commands::files::PutArgs),

    /// Copy a file out of the image
    Get(commands::files::GetArgs),

    /// Create directories
    Mkdir(commands::files::MkdirArgs),

    /// Remove files or empty directories
    Rm(commands::files::RmArgs),

    /// Rename or move an entry
    Mv(commands::files::MvArgs),

    /// Show an entry
    Stat(commands::info::StatArgs),

    /// Show space usage
    Df(commands::info::DfArgs),

    /// Compact metadata and finish interrupted operations
    Gc(commands::info::GcArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("PebbleFS CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Format(args) => commands::format::run(args),
        Commands::Ls(args) => commands::files::ls(args),
        Commands::Cat(args) => commands::files::cat(args),
        Commands::Put(args) => commands::files::put(args),
        Commands::Get(args) => commands::files::get(args),
        Commands::Mkdir(args) => commands::files::mkdir(args),
        Commands::Rm(args) => commands::files::rm(args),
        Commands::Mv(args) => commands::files::mv(args),
        Commands::Stat(args) => commands::info::stat(args),
        Commands::Df(args) => commands::info::df(args),
        Commands::Gc(args) => commands::info::gc(args),
    }
}
