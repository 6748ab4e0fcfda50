//! File and directory commands: ls, cat, put, get, mkdir, rm, mv

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use super::{finish, ImageArgs};

/// List a directory
#[derive(Parser, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    /// Directory inside the image
    #[arg(default_value = "/")]
    pub path: String,

    /// Show `.` and `..`
    #[arg(short, long)]
    pub all: bool,
}

pub fn ls(args: LsArgs) -> Result<()> {
    let fs = args.target.mount(true)?;
    let dir = fs
        .open_dir(&args.path)
        .with_context(|| format!("Failed to open directory {}", args.path))?;

    for entry in dir {
        let entry = entry.with_context(|| format!("Failed to read {}", args.path))?;
        if !args.all && (entry.name == "." || entry.name == "..") {
            continue;
        }
        let kind = if entry.is_dir() { 'd' } else { '-' };
        let name = if entry.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name
        };
        println!("{} {:>10}  {}", kind, entry.size, name);
    }
    Ok(())
}

/// Print a file to stdout
#[derive(Parser, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    pub path: String,
}

pub fn cat(args: CatArgs) -> Result<()> {
    let fs = args.target.mount(true)?;
    let data = fs
        .read_to_vec(&args.path)
        .with_context(|| format!("Failed to read {}", args.path))?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

/// Copy a host file into the image
#[derive(Parser, Debug)]
pub struct PutArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    /// Host file to copy
    pub source: PathBuf,

    /// Destination inside the image
    pub dest: String,
}

pub fn put(args: PutArgs) -> Result<()> {
    let data = std::fs::read(&args.source)
        .with_context(|| format!("Failed to read {}", args.source.display()))?;

    let fs = args.target.mount(false)?;
    fs.write_file(&args.dest, &data)
        .with_context(|| format!("Failed to write {}", args.dest))?;
    info!("Copied {} bytes to {}", data.len(), args.dest);
    finish(fs)
}

/// Copy a file out of the image
#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    /// File inside the image
    pub source: String,

    /// Host destination
    pub dest: PathBuf,
}

pub fn get(args: GetArgs) -> Result<()> {
    let fs = args.target.mount(true)?;
    let data = fs
        .read_to_vec(&args.source)
        .with_context(|| format!("Failed to read {}", args.source))?;
    std::fs::write(&args.dest, &data)
        .with_context(|| format!("Failed to write {}", args.dest.display()))?;
    debug!("Copied {} bytes from {}", data.len(), args.source);
    Ok(())
}

/// Create directories
#[derive(Parser, Debug)]
pub struct MkdirArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    #[arg(required = true)]
    pub paths: Vec<String>,
}

pub fn mkdir(args: MkdirArgs) -> Result<()> {
    let fs = args.target.mount(false)?;
    for path in &args.paths {
        fs.mkdir(path)
            .with_context(|| format!("Failed to create directory {}", path))?;
    }
    finish(fs)
}

/// Remove files or empty directories
#[derive(Parser, Debug)]
pub struct RmArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    #[arg(required = true)]
    pub paths: Vec<String>,
}

pub fn rm(args: RmArgs) -> Result<()> {
    let fs = args.target.mount(false)?;
    for path in &args.paths {
        fs.remove(path)
            .with_context(|| format!("Failed to remove {}", path))?;
    }
    finish(fs)
}

/// Rename or move an entry
#[derive(Parser, Debug)]
pub struct MvArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    pub from: String,
    pub to: String,
}

pub fn mv(args: MvArgs) -> Result<()> {
    let fs = args.target.mount(false)?;
    fs.rename(&args.from, &args.to)
        .with_context(|| format!("Failed to rename {} to {}", args.from, args.to))?;
    finish(fs)
}
