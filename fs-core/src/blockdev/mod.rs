//! Block device adapters for PebbleFS

mod blockdev_trait;
mod ram;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result};
pub(crate) use self::blockdev_trait::check_range;
pub use self::ram::RamBlockDevice;

/// Default erase unit for image files
pub const DEFAULT_ERASE_SIZE: u64 = 512;

/// A block device that is backed by an image file or a raw block node
///
/// Reads and programs are byte granular. Erases write 0xff over whole
/// erase units.
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Option<File>,
    path: PathBuf,
    size: u64,
    erase_size: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new image of `size` bytes, filled as if freshly erased
    pub fn create(path: impl AsRef<Path>, size: u64, erase_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let size = size - size % erase_size;
        let erased = vec![0xffu8; erase_size as usize];
        for _ in 0..size / erase_size {
            file.write_all(&erased)?;
        }
        file.flush()?;

        Ok(Self {
            file: None,
            path,
            size,
            erase_size,
            read_only: false,
        })
    }

    /// Get the size of a block device using platform-specific methods
    fn get_block_device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::get_block_device_size_unix(path)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    /// Unix-specific block device size detection
    #[cfg(unix)]
    fn get_block_device_size_unix(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        // Regular image files report their length directly
        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = File::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };

        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    /// Open an existing image or block node
    pub fn open(path: impl AsRef<Path>, read_only: bool, erase_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = Self::get_block_device_size(&path)?;

        Ok(Self {
            file: None,
            path,
            size: size - size % erase_size,
            erase_size,
            read_only,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(BlockDeviceError::DeviceNotOpen)
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn init(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            if !self.read_only {
                file.flush()?;
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        check_range(addr, buf.len() as u64, 1, self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(addr))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn program(&mut self, data: &[u8], addr: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_range(addr, data.len() as u64, 1, self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self, addr: u64, size: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_range(addr, size, self.erase_size, self.size)?;
        let erased = vec![0xffu8; size as usize];
        let file = self.file()?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(&erased)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file()?.sync_all()?;
        Ok(())
    }

    fn read_size(&self) -> u64 {
        1
    }

    fn program_size(&self) -> u64 {
        1
    }

    fn erase_size(&self) -> u64 {
        self.erase_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_block_device_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_device.bin");

        let mut device = FileBackedBlockDevice::create(&file_path, 512 * 8, 512).unwrap();
        device.init().unwrap();
        assert_eq!(device.size(), 4096);

        // Fresh images read back as erased
        let mut read_buf = [0u8; 512];
        device.read(&mut read_buf, 512).unwrap();
        assert!(read_buf.iter().all(|&b| b == 0xff));

        let test_data = [0xAAu8; 100];
        device.program(&test_data, 1024 + 7).unwrap();
        let mut small = [0u8; 100];
        device.read(&mut small, 1024 + 7).unwrap();
        assert_eq!(test_data, small);

        device.erase(1024, 512).unwrap();
        device.read(&mut small, 1024 + 7).unwrap();
        assert!(small.iter().all(|&b| b == 0xff));

        // Erase must cover whole units
        assert!(matches!(
            device.erase(1000, 512),
            Err(BlockDeviceError::Misaligned { .. })
        ));
        assert!(matches!(
            device.read(&mut read_buf, 4096),
            Err(BlockDeviceError::InvalidAddress { .. })
        ));
        device.deinit().unwrap();
    }

    #[test]
    fn test_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let mut device = FileBackedBlockDevice::create(&file_path, 4096, 512).unwrap();
        device.init().unwrap();
        device.program(&[0x55u8; 16], 0).unwrap();
        device.sync().unwrap();
        device.deinit().unwrap();

        let mut read_only_device = FileBackedBlockDevice::open(&file_path, true, 512).unwrap();
        read_only_device.init().unwrap();

        let mut read_buf = [0u8; 16];
        read_only_device.read(&mut read_buf, 0).unwrap();
        assert_eq!([0x55u8; 16], read_buf);

        let write_result = read_only_device.program(&[0u8; 16], 0);
        assert!(matches!(write_result, Err(BlockDeviceError::ReadOnly)));
    }

    #[test]
    fn test_requires_init() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("closed.bin");
        let mut device = FileBackedBlockDevice::create(&file_path, 4096, 512).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            device.read(&mut buf, 0),
            Err(BlockDeviceError::DeviceNotOpen)
        ));
    }
}
