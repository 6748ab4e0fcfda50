//! Public filesystem API
//!
//! [`Filesystem`] owns the block device and serializes every operation
//! behind one lock. Open files and directories are [`File`] and [`Dir`]
//! handles that borrow the filesystem and release their slot on drop.

use std::io::{self, SeekFrom};

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::blockdev::BlockDevice;
use crate::config::{Config, Geometry};
use crate::crc::{Crc32, Integrity};
use crate::dir::EntryInfo;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::file::OpenFlags;

/// Log an operation's outcome as `op -> errno`, 0 on success
fn traced<T>(op: &str, res: Result<T>) -> Result<T> {
    match &res {
        Ok(_) => info!("{} -> 0", op),
        Err(e) => info!("{} -> {} ({})", op, e.errno(), e),
    }
    res
}

/// Usage figures in the shape of `statvfs(3)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatVfs {
    pub block_size: u32,
    pub block_count: u32,
    pub blocks_used: u32,
    pub blocks_free: u32,
    pub name_max: u32,
    pub file_max: u32,
}

/// A mounted filesystem
pub struct Filesystem<D: BlockDevice> {
    inner: Mutex<Engine<D>>,
    config: Config,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Write an empty filesystem to `dev`, destroying its contents
    pub fn format(dev: &mut D, config: &Config) -> Result<()> {
        Self::format_with(dev, config, Crc32)
    }

    /// `format` with a custom commit checksum
    pub fn format_with(
        dev: &mut D,
        config: &Config,
        integrity: impl Integrity + Send + Sync + 'static,
    ) -> Result<()> {
        info!("format({:?})", config);
        dev.init()?;
        let res = Geometry::derive(&*dev, config).and_then(|geo| {
            let mut engine = Engine::new(&mut *dev, geo, Box::new(integrity));
            engine.format()
        });
        let closed = dev.deinit().map_err(Error::from);
        traced("format", res.and(closed))
    }

    /// Mount the filesystem on `dev`
    ///
    /// A failed mount deinitializes and drops `dev`. To keep the device
    /// around, for instance to format it after `Error::Corrupt`, mount a
    /// `&mut` borrow of it instead:
    ///
    /// ```no_run
    /// # use pebblefs::{Config, Error, FileBackedBlockDevice, Filesystem};
    /// # fn main() -> pebblefs::Result<()> {
    /// let config = Config::default();
    /// let mut dev = FileBackedBlockDevice::open("pebble.img", false, 512)?;
    /// if let Err(Error::Corrupt) = Filesystem::mount(&mut dev, config.clone()) {
    ///     Filesystem::format(&mut dev, &config)?;
    /// }
    /// let fs = Filesystem::mount(&mut dev, config)?;
    /// # drop(fs);
    /// # Ok(())
    /// # }
    /// ```
    pub fn mount(dev: D, config: Config) -> Result<Self> {
        Self::mount_with(dev, config, Crc32)
    }

    /// `mount` with a custom commit checksum, which must match the one the
    /// filesystem was formatted with
    pub fn mount_with(
        mut dev: D,
        config: Config,
        integrity: impl Integrity + Send + Sync + 'static,
    ) -> Result<Self> {
        info!("mount({:?})", config);
        dev.init()?;
        let geo = match Geometry::derive(&dev, &config) {
            Ok(geo) => geo,
            Err(e) => {
                let _ = dev.deinit();
                return traced("mount", Err(e));
            }
        };

        let mut engine = Engine::new(dev, geo, Box::new(integrity));
        if let Err(e) = engine.mount() {
            let _ = engine.into_device().deinit();
            return traced("mount", Err(e));
        }
        info!(
            "Mounted {} blocks of {} bytes, root {{{:#x}, {:#x}}}",
            geo.block_count, geo.block_size, engine.root[0], engine.root[1]
        );

        Ok(Self {
            inner: Mutex::new(engine),
            config,
        })
    }

    /// Release the device. Unsynced file data is lost.
    pub fn unmount(self) -> Result<D> {
        info!("unmount()");
        let mut dev = self.inner.into_inner().into_device();
        let synced = dev.sync();
        let closed = dev.deinit();
        synced.and(closed)?;
        Ok(dev)
    }

    /// Unmount, format and mount again with the same configuration
    pub fn reformat(self) -> Result<Self> {
        let config = self.config.clone();
        let mut dev = self.unmount()?;
        Self::format(&mut dev, &config)?;
        Self::mount(dev, config)
    }

    fn lock(&self) -> MutexGuard<'_, Engine<D>> {
        self.inner.lock()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Geometry in effect, after clamping and superblock limits
    pub fn geometry(&self) -> Geometry {
        self.lock().bd.geo
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        info!("stat({:?})", path);
        traced("stat", self.lock().stat(path))
    }

    /// Blocks in use. This walks the whole filesystem.
    pub fn fs_size(&self) -> Result<u32> {
        info!("fs_size()");
        traced("fs_size", self.lock().fs_size())
    }

    pub fn statvfs(&self) -> Result<StatVfs> {
        info!("statvfs()");
        let mut engine = self.lock();
        let used = traced("statvfs", engine.fs_size())?;
        let geo = engine.bd.geo;
        Ok(StatVfs {
            block_size: geo.block_size,
            block_count: geo.block_count,
            blocks_used: used,
            blocks_free: geo.block_count.saturating_sub(used),
            name_max: geo.name_max,
            file_max: geo.file_max,
        })
    }

    /// Call `cb` on every block in use. A block may be reported more than
    /// once.
    pub fn traverse(&self, mut cb: impl FnMut(u32)) -> Result<()> {
        info!("traverse()");
        traced(
            "traverse",
            self.lock().traverse_blocks(false, &mut |block| {
                cb(block);
                Ok(())
            }),
        )
    }

    /// Do housekeeping now rather than during a later write: compact
    /// metadata past the configured threshold and refill the allocator
    pub fn gc(&self) -> Result<()> {
        info!("gc()");
        traced("gc", self.lock().gc())
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        info!("mkdir({:?})", path);
        traced("mkdir", self.lock().mkdir(path))
    }

    /// Remove a file or an empty directory
    pub fn remove(&self, path: &str) -> Result<()> {
        info!("remove({:?})", path);
        traced("remove", self.lock().remove(path))
    }

    /// Atomically move `oldpath` to `newpath`, replacing a file or empty
    /// directory of the same kind
    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        info!("rename({:?}, {:?})", oldpath, newpath);
        traced("rename", self.lock().rename(oldpath, newpath))
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<File<'_, D>> {
        info!("open({:?}, {:?})", path, flags);
        let slot = traced("open", self.lock().file_open(path, flags))?;
        Ok(File { fs: self, slot })
    }

    pub fn open_dir(&self, path: &str) -> Result<Dir<'_, D>> {
        info!("open_dir({:?})", path);
        let slot = traced("open_dir", self.lock().dir_open(path))?;
        Ok(Dir { fs: self, slot })
    }

    /// Read a whole file
    pub fn read_to_vec(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, OpenFlags::RDONLY)?;
        let mut data = vec![0u8; file.size()? as usize];
        let mut done = 0;
        while done < data.len() {
            match file.read(&mut data[done..])? {
                0 => break,
                n => done += n,
            }
        }
        data.truncate(done);
        Ok(data)
    }

    /// Create or replace a file with `data` and sync it
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self.open(path, OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC)?;
        file.write(data)?;
        file.sync()?;
        file.close()
    }
}

/// An open file.
///
/// Writes are staged in the handle and reach the disk atomically on
/// [`sync`](File::sync). Closing or dropping the handle discards whatever
/// was written since.
pub struct File<'fs, D: BlockDevice> {
    fs: &'fs Filesystem<D>,
    slot: usize,
}

impl<D: BlockDevice> File<'_, D> {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        traced("read", self.fs.lock().file_read(self.slot, buf))
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        traced("write", self.fs.lock().file_write(self.slot, data))
    }

    /// Commit everything written so far
    pub fn sync(&mut self) -> Result<()> {
        debug!("sync(#{})", self.slot);
        traced("sync", self.fs.lock().file_sync(self.slot))
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u32> {
        traced("seek", self.fs.lock().file_seek(self.slot, pos))
    }

    pub fn tell(&self) -> Result<u32> {
        self.fs.lock().file_tell(self.slot)
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }

    pub fn size(&self) -> Result<u32> {
        self.fs.lock().file_size(self.slot)
    }

    /// Cut or zero-extend to `size` bytes; the position is kept
    pub fn truncate(&mut self, size: u32) -> Result<()> {
        traced("truncate", self.fs.lock().file_truncate(self.slot, size))
    }

    /// Release the handle. Writes since the last sync are dropped.
    pub fn close(self) -> Result<()> {
        let closed = self.fs.lock().file_close(self.slot);
        std::mem::forget(self);
        traced("close", closed)
    }
}

impl<D: BlockDevice> Drop for File<'_, D> {
    fn drop(&mut self) {
        let _ = self.fs.lock().file_close(self.slot);
    }
}

impl<D: BlockDevice> io::Read for File<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(File::read(self, buf)?)
    }
}

impl<D: BlockDevice> io::Write for File<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(File::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.sync()?)
    }
}

impl<D: BlockDevice> io::Seek for File<'_, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(File::seek(self, pos)? as u64)
    }
}

/// An open directory
pub struct Dir<'fs, D: BlockDevice> {
    fs: &'fs Filesystem<D>,
    slot: usize,
}

impl<D: BlockDevice> Dir<'_, D> {
    /// Next entry, starting with `.` and `..`; `None` once exhausted
    pub fn read(&mut self) -> Result<Option<EntryInfo>> {
        traced("dir_read", self.fs.lock().dir_read(self.slot))
    }

    /// Jump to a position returned by [`tell`](Dir::tell)
    pub fn seek(&mut self, off: u32) -> Result<()> {
        traced("dir_seek", self.fs.lock().dir_seek(self.slot, off))
    }

    pub fn tell(&self) -> Result<u32> {
        self.fs.lock().dir_tell(self.slot)
    }

    pub fn rewind(&mut self) -> Result<()> {
        traced("dir_rewind", self.fs.lock().dir_rewind(self.slot))
    }

    pub fn close(self) {}
}

impl<D: BlockDevice> Iterator for Dir<'_, D> {
    type Item = Result<EntryInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

impl<D: BlockDevice> Drop for Dir<'_, D> {
    fn drop(&mut self) {
        self.fs.lock().close_handle(self.slot);
    }
}
