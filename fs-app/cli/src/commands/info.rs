//! Inspection and housekeeping: stat, df, gc

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use super::{finish, ImageArgs};

/// Show one entry
#[derive(Parser, Debug)]
pub struct StatArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    pub path: String,
}

pub fn stat(args: StatArgs) -> Result<()> {
    let fs = args.target.mount(true)?;
    let entry = fs
        .stat(&args.path)
        .with_context(|| format!("Failed to stat {}", args.path))?;

    println!("  Name:  {}", entry.name);
    println!("  Type:  {}", if entry.is_dir() { "directory" } else { "file" });
    println!("  Size:  {}", entry.size);
    println!("  Mode:  {:o}", entry.mode());
    Ok(())
}

/// Show space usage
#[derive(Parser, Debug)]
pub struct DfArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn df(args: DfArgs) -> Result<()> {
    let fs = args.target.mount(true)?;
    let usage = fs.statvfs().context("Failed to walk the filesystem")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
        return Ok(());
    }

    let percent = if usage.block_count > 0 {
        usage.blocks_used as f64 * 100.0 / usage.block_count as f64
    } else {
        0.0
    };
    println!("Filesystem Statistics:");
    println!("  Block size:   {}", usage.block_size);
    println!("  Blocks:       {}", usage.block_count);
    println!("  Used:         {} ({:.1}%)", usage.blocks_used, percent);
    println!("  Free:         {}", usage.blocks_free);
    println!("  Name max:     {}", usage.name_max);
    println!("  File max:     {}", usage.file_max);
    Ok(())
}

/// Finish pending recovery and compact metadata
#[derive(Parser, Debug)]
pub struct GcArgs {
    #[command(flatten)]
    pub target: ImageArgs,
}

pub fn gc(args: GcArgs) -> Result<()> {
    let fs = args.target.mount(false)?;
    fs.gc().context("Garbage collection failed")?;
    info!("Garbage collection complete");
    finish(fs)
}
