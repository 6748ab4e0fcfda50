//! Block device trait definitions for PebbleFS

use std::io;
use thiserror::Error;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid address: {addr:#x} (+{len}) exceeds device size {size:#x}")]
    InvalidAddress { addr: u64, len: u64, size: u64 },
    #[error("Misaligned access: {addr:#x} (+{len}) is not a multiple of {unit}")]
    Misaligned { addr: u64, len: u64, unit: u64 },
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is not open")]
    DeviceNotOpen,
    #[error("Power lost during operation")]
    PowerLoss,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Synchronous byte-addressed storage with flash-like program/erase rules.
///
/// Addresses passed to `read`, `program` and `erase` must be multiples of
/// the matching geometry unit, and so must the lengths.
pub trait BlockDevice {
    /// Prepare the device for use
    fn init(&mut self) -> Result<()>;

    /// Release the device; the filesystem calls this on unmount
    fn deinit(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at `addr`
    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()>;

    /// Program previously erased bytes starting at `addr`
    fn program(&mut self, data: &[u8], addr: u64) -> Result<()>;

    /// Erase `size` bytes starting at `addr`, leaving them at 0xff
    fn erase(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Flush any pending writes to the backing store
    fn sync(&mut self) -> Result<()>;

    /// Minimum read unit in bytes
    fn read_size(&self) -> u64;

    /// Minimum program unit in bytes
    fn program_size(&self) -> u64;

    /// Minimum erase unit in bytes
    fn erase_size(&self) -> u64;

    /// Total device size in bytes
    fn size(&self) -> u64;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn deinit(&mut self) -> Result<()> {
        (**self).deinit()
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        (**self).read(buf, addr)
    }

    fn program(&mut self, data: &[u8], addr: u64) -> Result<()> {
        (**self).program(data, addr)
    }

    fn erase(&mut self, addr: u64, size: u64) -> Result<()> {
        (**self).erase(addr, size)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn read_size(&self) -> u64 {
        (**self).read_size()
    }

    fn program_size(&self) -> u64 {
        (**self).program_size()
    }

    fn erase_size(&self) -> u64 {
        (**self).erase_size()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Bounds and alignment check shared by the reference devices.
pub(crate) fn check_range(addr: u64, len: u64, unit: u64, size: u64) -> Result<()> {
    if addr.checked_add(len).map_or(true, |end| end > size) {
        return Err(BlockDeviceError::InvalidAddress { addr, len, size });
    }
    if unit > 1 && (addr % unit != 0 || len % unit != 0) {
        return Err(BlockDeviceError::Misaligned { addr, len, unit });
    }
    Ok(())
}
