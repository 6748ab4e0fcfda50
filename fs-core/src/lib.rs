//! PebbleFS Core - a power-loss resilient filesystem for raw flash and
//! block storage
//!
//! The on-disk format is littlefs v2.0: directories are logs in pairs of
//! metadata blocks, file data lives in copy-on-write skip-lists, and free
//! space is found by scanning rather than stored. Any operation can be cut
//! short by power loss and the next mount sees either the old or the new
//! state.
//!
//! ```no_run
//! use pebblefs::{Config, Filesystem, OpenFlags, RamBlockDevice};
//!
//! let mut dev = RamBlockDevice::new(1, 1, 512, 64);
//! let config = Config::default();
//! Filesystem::format(&mut dev, &config)?;
//!
//! let fs = Filesystem::mount(dev, config)?;
//! fs.mkdir("/logs")?;
//! let mut file = fs.open("/logs/boot", OpenFlags::WRONLY | OpenFlags::CREAT)?;
//! file.write(b"hello")?;
//! file.sync()?;
//! # Ok::<(), pebblefs::Error>(())
//! ```

#![warn(rust_2018_idioms)]

pub mod blockdev;
pub mod config;
pub mod crc;
pub mod error;
pub mod layout;

mod alloc;
mod cache;
mod ctz;
mod dir;
mod engine;
mod file;
mod fs;
mod metadata;

pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, RamBlockDevice};
pub use config::{Config, Geometry};
pub use crc::{Crc32, Integrity};
pub use dir::{EntryInfo, FileType};
pub use error::{Error, Result};
pub use file::OpenFlags;
pub use fs::{Dir, File, Filesystem, StatVfs};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::BlockDevice;
    pub use crate::error::Result;
    pub use crate::{Config, Filesystem, OpenFlags};
}
