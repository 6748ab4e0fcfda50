//! Format command for creating PebbleFS images

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

use pebblefs::{FileBackedBlockDevice, Filesystem};

use super::{open_device, ImageArgs};

/// Format an image with PebbleFS
#[derive(Parser, Debug)]
#[command(about = "Format an image or device with PebbleFS")]
pub struct FormatArgs {
    #[command(flatten)]
    pub target: ImageArgs,

    /// Create a fresh image of this many KiB instead of formatting an
    /// existing one
    #[arg(long)]
    pub create: Option<u64>,

    /// Force formatting without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub fn run(args: FormatArgs) -> Result<()> {
    let config = args.target.load_config()?;
    let path = &args.target.image;
    let erase_size = config.block_size as u64;

    let mut dev = match args.create {
        Some(kib) => {
            let size = kib
                .checked_mul(1024)
                .ok_or_else(|| anyhow!("Requested size is too large"))?;
            if size < 2 * erase_size {
                return Err(anyhow!(
                    "{} KiB holds fewer than two {}-byte blocks",
                    kib,
                    erase_size
                ));
            }
            info!("Creating {} ({} bytes)", path.display(), size);
            FileBackedBlockDevice::create(path, size, erase_size)
                .with_context(|| format!("Failed to create image {}", path.display()))?
        }
        None => {
            if !path.exists() {
                return Err(anyhow!(
                    "{} does not exist, use --create to make a new image",
                    path.display()
                ));
            }
            if !args.force && !confirm(path.display())? {
                println!("Operation cancelled.");
                return Ok(());
            }
            open_device(path, false, &config)?
        }
    };

    Filesystem::format(&mut dev, &config)
        .with_context(|| format!("Failed to format {}", path.display()))?;

    info!("Successfully formatted {} as PebbleFS", path.display());
    Ok(())
}

fn confirm(target: impl std::fmt::Display) -> Result<bool> {
    println!("WARNING: This will format {} as PebbleFS.", target);
    println!("This operation will DESTROY ALL DATA on the device!");
    print!("Are you sure you want to continue? [y/N] ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
