//! Filesystem configuration and the geometry derived from it at mount time

use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::blockdev::BlockDevice;
use crate::error::{Error, Result};

/// Largest inline payload the tag length field can describe
pub const INLINE_LIMIT: u32 = 0x3fe;
/// Largest file size the format can describe
pub const FILE_MAX: u32 = 0x7fff_ffff;
/// Largest name the format can describe
pub const NAME_MAX: u32 = 0xff;
/// Largest attribute payload the format can describe
pub const ATTR_MAX: u32 = 0x3fe;

/// User facing knobs.
///
/// Values are requests; [`Geometry::derive`] clamps them against what the
/// block device reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logical block size; raised to the device erase size if smaller
    pub block_size: u32,
    /// Commits to a metadata pair before it is moved; negative disables
    pub block_cycles: i32,
    /// Size of the read, program and per-file caches
    pub cache_size: u32,
    /// Lookahead bitmap size in bytes, tracking 8 blocks per byte
    pub lookahead_size: u32,
    pub name_max: u32,
    pub file_max: u32,
    /// Upper bound for inline files; 0 picks the largest allowed
    pub inline_max: u32,
    /// Used bytes above which `gc` compacts a metadata pair; 0 means
    /// `block_size - block_size / 8`
    pub compact_thresh: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 512,
            block_cycles: 1024,
            cache_size: 64,
            lookahead_size: 64,
            name_max: NAME_MAX,
            file_max: FILE_MAX,
            inline_max: 0,
            compact_thresh: 0,
        }
    }
}

impl Config {
    /// Parse a configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            debug!("Config::from_json: {}", e);
            Error::InvalidArgument
        })
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(crate::blockdev::BlockDeviceError::Io(e)))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        // Plain integer fields always serialize
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Effective geometry of a mounted (or formatting) filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub read_size: u32,
    pub prog_size: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub block_cycles: i32,
    pub cache_size: u32,
    pub lookahead_size: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    pub inline_max: u32,
    pub compact_thresh: u32,
}

impl Geometry {
    /// Clamp `config` against the device and validate the result
    pub fn derive<D: BlockDevice + ?Sized>(dev: &D, config: &Config) -> Result<Self> {
        let read_size = dev.read_size() as u32;
        let prog_size = dev.program_size() as u32;
        let block_size = config.block_size.max(dev.erase_size() as u32);
        if block_size == 0 {
            return Err(Error::InvalidArgument);
        }
        let block_count = (dev.size() / block_size as u64) as u32;
        let cache_size = config.cache_size.max(prog_size);
        let lookahead_size = config
            .lookahead_size
            .min(8 * ((block_count + 63) / 64))
            .max(8)
            / 8
            * 8;

        let attr_max = ATTR_MAX;
        let mut inline_max = INLINE_LIMIT.min(cache_size).min(attr_max).min(block_size / 8);
        if config.inline_max != 0 {
            inline_max = inline_max.min(config.inline_max);
        }
        let compact_thresh = match config.compact_thresh {
            0 => block_size - block_size / 8,
            t => t.min(block_size),
        };

        let geometry = Self {
            read_size,
            prog_size,
            block_size,
            block_count,
            block_cycles: config.block_cycles,
            cache_size,
            lookahead_size,
            name_max: config.name_max,
            file_max: config.file_max,
            attr_max,
            inline_max,
            compact_thresh,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        let aligned = self.read_size > 0
            && self.prog_size > 0
            && self.cache_size % self.read_size == 0
            && self.cache_size % self.prog_size == 0
            && self.block_size % self.cache_size == 0;
        if !aligned {
            debug!("Geometry::validate: misaligned caches {:?}", self);
            return Err(Error::InvalidArgument);
        }

        // The largest CTZ pointer list must fit in a block
        let pointers = 32 - (u32::MAX / (self.block_size.saturating_sub(8)).max(1)).leading_zeros();
        if self.block_size < 128 || 4 * pointers > self.block_size {
            debug!("Geometry::validate: block size {} too small", self.block_size);
            return Err(Error::InvalidArgument);
        }

        if self.block_count < 6 {
            debug!("Geometry::validate: only {} blocks", self.block_count);
            return Err(Error::InvalidArgument);
        }

        if self.name_max == 0
            || self.name_max > NAME_MAX
            || self.file_max == 0
            || self.file_max > FILE_MAX
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Bytes of a metadata block usable by commits, leaving room for the
    /// trailing CRC record
    pub fn metadata_max(&self) -> u32 {
        self.block_size - 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;

    #[test]
    fn test_defaults_from_partial_json() {
        let config = Config::from_json(r#"{ "block_size": 4096, "block_cycles": -1 }"#).unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.block_cycles, -1);
        assert_eq!(config.cache_size, 64);
        assert_eq!(config.name_max, 255);

        assert!(matches!(
            Config::from_json("{ not json"),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(Config::from_json(&config.to_json()).unwrap(), config);
    }

    #[test]
    fn test_clamping() {
        let dev = RamBlockDevice::new(16, 128, 1024, 64);
        let config = Config {
            block_size: 512,
            cache_size: 64,
            lookahead_size: 512,
            ..Config::default()
        };
        let geometry = Geometry::derive(&dev, &config).unwrap();
        assert_eq!(geometry.block_size, 1024);
        assert_eq!(geometry.block_count, 64);
        assert_eq!(geometry.cache_size, 128);
        assert_eq!(geometry.lookahead_size, 8);
        assert_eq!(geometry.inline_max, 128);
        assert_eq!(geometry.compact_thresh, 1024 - 128);
    }

    #[test]
    fn test_inline_max_override() {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        let config = Config {
            inline_max: 16,
            ..Config::default()
        };
        assert_eq!(Geometry::derive(&dev, &config).unwrap().inline_max, 16);
        let geometry = Geometry::derive(&dev, &Config::default()).unwrap();
        assert_eq!(geometry.inline_max, 64);
    }

    #[test]
    fn test_rejects_misaligned_cache() {
        let dev = RamBlockDevice::new(1, 48, 512, 64);
        // cache 64 is not a multiple of the 48 byte program unit
        let config = Config::default();
        assert!(matches!(
            Geometry::derive(&dev, &config),
            Err(Error::InvalidArgument)
        ));
    }
}
