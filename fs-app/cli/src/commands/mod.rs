//! Subcommands and the image plumbing they share

pub mod files;
pub mod format;
pub mod info;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use log::{debug, info};

use pebblefs::{Config, FileBackedBlockDevice, Filesystem};

/// Image file plus optional configuration, common to every command
#[derive(Args, Debug, Clone)]
pub struct ImageArgs {
    /// Image file or block device
    pub image: PathBuf,

    /// JSON configuration file (block_size, cache_size, ...)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the block size
    #[arg(long)]
    pub block_size: Option<u32>,

    /// Override commits per metadata pair before relocation
    #[arg(long, allow_negative_numbers = true)]
    pub block_cycles: Option<i32>,

    /// Override the cache size
    #[arg(long)]
    pub cache_size: Option<u32>,

    /// Override the lookahead size
    #[arg(long)]
    pub lookahead_size: Option<u32>,
}

impl ImageArgs {
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(v) = self.block_size {
            config.block_size = v;
        }
        if let Some(v) = self.block_cycles {
            config.block_cycles = v;
        }
        if let Some(v) = self.cache_size {
            config.cache_size = v;
        }
        if let Some(v) = self.lookahead_size {
            config.lookahead_size = v;
        }
        debug!("Using {:?}", config);
        Ok(config)
    }

    /// Mount the image, read-only when nothing will be written
    pub fn mount(&self, read_only: bool) -> Result<Filesystem<FileBackedBlockDevice>> {
        let config = self.load_config()?;
        let dev = open_device(&self.image, read_only, &config)?;
        let fs = Filesystem::mount(dev, config)
            .with_context(|| format!("Failed to mount {}", self.image.display()))?;
        info!("Mounted {}", self.image.display());
        Ok(fs)
    }
}

pub fn open_device(path: &Path, read_only: bool, config: &Config) -> Result<FileBackedBlockDevice> {
    FileBackedBlockDevice::open(path, read_only, config.block_size as u64)
        .with_context(|| format!("Failed to open {}", path.display()))
}

/// Unmount, flushing the image
pub fn finish(fs: Filesystem<FileBackedBlockDevice>) -> Result<()> {
    fs.unmount().context("Failed to unmount")?;
    Ok(())
}
