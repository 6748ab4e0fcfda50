//! Read and program caches between the engine and the block device
//!
//! The engine never talks to the device directly. Reads go through a single
//! read cache (and, when given, a program cache whose pending bytes take
//! priority), and programs are staged in a program cache that is flushed in
//! `prog_size` units. Each cache holds at most one `cache_size` window of one
//! block, so RAM use does not depend on the size of the filesystem.

use std::cmp::Ordering;

use log::trace;

use crate::blockdev::BlockDevice;
use crate::config::Geometry;
use crate::crc::Integrity;
use crate::error::{Error, Result};
use crate::layout::{BLOCK_INLINE, BLOCK_NULL};

/// A window of one block held in RAM
#[derive(Debug, Clone)]
pub(crate) struct Cache {
    pub block: u32,
    pub off: u32,
    pub size: u32,
    pub buffer: Vec<u8>,
}

impl Cache {
    pub fn new(size: u32) -> Self {
        Self {
            block: BLOCK_NULL,
            off: 0,
            size: 0,
            buffer: vec![0xff; size as usize],
        }
    }

    /// Forget the cached window without touching its contents
    pub fn invalidate(&mut self) {
        self.block = BLOCK_NULL;
    }

    /// Reset to an empty window of erased bytes
    pub fn zero(&mut self) {
        self.buffer.fill(0xff);
        self.block = BLOCK_NULL;
    }
}

fn align_down(a: u32, unit: u32) -> u32 {
    a - a % unit
}

fn align_up(a: u32, unit: u32) -> u32 {
    align_down(a + unit - 1, unit)
}

fn addr(geo: &Geometry, block: u32, off: u32) -> u64 {
    block as u64 * geo.block_size as u64 + off as u64
}

/// The device, its geometry and the shared read cache
pub(crate) struct Storage<D> {
    pub dev: D,
    pub geo: Geometry,
    pub rcache: Cache,
    pub integrity: Box<dyn Integrity + Send + Sync>,
}

impl<D: BlockDevice> Storage<D> {
    pub fn new(dev: D, geo: Geometry, integrity: Box<dyn Integrity + Send + Sync>) -> Self {
        Self {
            dev,
            geo,
            rcache: Cache::new(geo.cache_size),
            integrity,
        }
    }

    pub fn crc(&self, seed: u32, data: &[u8]) -> u32 {
        self.integrity.crc(seed, data)
    }

    /// Read `buf.len()` bytes at `block:off`.
    ///
    /// `hint` is how many bytes the caller is likely to read next from this
    /// location; it sizes the read cache fill.
    pub fn read(
        &mut self,
        pcache: Option<&Cache>,
        hint: u32,
        block: u32,
        off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        self.read_cached(pcache, None, hint, block, off, buf)
    }

    /// `read` filling `rcache` instead of the shared read cache. Open files
    /// read through their own cache this way.
    pub fn read_cached(
        &mut self,
        pcache: Option<&Cache>,
        rcache: Option<&mut Cache>,
        hint: u32,
        block: u32,
        mut off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let Storage {
            dev,
            geo,
            rcache: shared,
            ..
        } = self;
        let geo = *geo;
        let rcache = match rcache {
            Some(cache) => cache,
            None => shared,
        };
        if block >= geo.block_count || off as u64 + buf.len() as u64 > geo.block_size as u64 {
            return Err(Error::Corrupt);
        }

        let mut data = buf;
        while !data.is_empty() {
            let size = data.len() as u32;
            let mut diff = size;

            if let Some(pcache) = pcache {
                if block == pcache.block && off < pcache.off + pcache.size {
                    if off >= pcache.off {
                        diff = diff.min(pcache.size - (off - pcache.off));
                        let start = (off - pcache.off) as usize;
                        data[..diff as usize]
                            .copy_from_slice(&pcache.buffer[start..start + diff as usize]);
                        data = &mut std::mem::take(&mut data)[diff as usize..];
                        off += diff;
                        continue;
                    }
                    // pending program data takes priority
                    diff = diff.min(pcache.off - off);
                }
            }

            if block == rcache.block && off < rcache.off + rcache.size {
                if off >= rcache.off {
                    diff = diff.min(rcache.size - (off - rcache.off));
                    let start = (off - rcache.off) as usize;
                    data[..diff as usize]
                        .copy_from_slice(&rcache.buffer[start..start + diff as usize]);
                    data = &mut std::mem::take(&mut data)[diff as usize..];
                    off += diff;
                    continue;
                }
                diff = diff.min(rcache.off - off);
            }

            if size >= hint && off % geo.read_size == 0 && size >= geo.read_size {
                // large aligned reads bypass the cache
                diff = align_down(diff, geo.read_size);
                dev.read(&mut data[..diff as usize], addr(&geo, block, off))?;
                data = &mut std::mem::take(&mut data)[diff as usize..];
                off += diff;
                continue;
            }

            let coff = align_down(off, geo.read_size);
            let csize = (align_up(off + hint.max(1), geo.read_size).min(geo.block_size) - coff)
                .min(geo.cache_size);
            rcache.block = BLOCK_NULL;
            dev.read(&mut rcache.buffer[..csize as usize], addr(&geo, block, coff))?;
            rcache.block = block;
            rcache.off = coff;
            rcache.size = csize;
        }
        Ok(())
    }

    /// Compare on-disk bytes at `block:off` against `expected`
    pub fn cmp(
        &mut self,
        pcache: Option<&Cache>,
        hint: u32,
        block: u32,
        off: u32,
        expected: &[u8],
    ) -> Result<Ordering> {
        let mut chunk = [0u8; 32];
        let mut i = 0usize;
        while i < expected.len() {
            let n = (expected.len() - i).min(chunk.len());
            self.read(
                pcache,
                hint.saturating_sub(i as u32),
                block,
                off + i as u32,
                &mut chunk[..n],
            )?;
            match chunk[..n].cmp(&expected[i..i + n]) {
                Ordering::Equal => {}
                other => return Ok(other),
            }
            i += n;
        }
        Ok(Ordering::Equal)
    }

    /// Fold `size` on-disk bytes at `block:off` into `crc`
    pub fn crc_range(
        &mut self,
        pcache: Option<&Cache>,
        block: u32,
        off: u32,
        size: u32,
        crc: u32,
    ) -> Result<u32> {
        let mut crc = crc;
        let mut chunk = [0u8; 32];
        let mut i = 0;
        while i < size {
            let n = (size - i).min(chunk.len() as u32);
            self.read(pcache, size - i, block, off + i, &mut chunk[..n as usize])?;
            crc = self.integrity.crc(crc, &chunk[..n as usize]);
            i += n;
        }
        Ok(crc)
    }

    /// Program out whatever is staged in `pcache`.
    ///
    /// With `validate` the bytes are read back; a mismatch is reported as
    /// `Corrupt` so the caller can move to another block.
    pub fn flush(&mut self, pcache: &mut Cache, validate: bool) -> Result<()> {
        if pcache.block != BLOCK_NULL && pcache.block != BLOCK_INLINE {
            if pcache.block >= self.geo.block_count {
                return Err(Error::Corrupt);
            }
            let diff = align_up(pcache.size, self.geo.prog_size);
            let at = addr(&self.geo, pcache.block, pcache.off);
            trace!("Storage::flush: block {} off {} size {}", pcache.block, pcache.off, diff);
            self.dev.program(&pcache.buffer[..diff as usize], at)?;

            if validate {
                self.rcache.invalidate();
                let (block, off) = (pcache.block, pcache.off);
                let expected = &pcache.buffer[..diff as usize];
                if self.cmp(None, diff, block, off, expected)? != Ordering::Equal {
                    return Err(Error::Corrupt);
                }
            }

            pcache.zero();
        }
        Ok(())
    }

    /// Flush `pcache` and ask the device to make everything durable
    pub fn sync(&mut self, pcache: &mut Cache, validate: bool) -> Result<()> {
        self.rcache.invalidate();
        self.flush(pcache, validate)?;
        self.dev.sync()?;
        Ok(())
    }

    /// Stage `data` for programming at `block:off`
    pub fn prog(
        &mut self,
        pcache: &mut Cache,
        validate: bool,
        block: u32,
        mut off: u32,
        data: &[u8],
    ) -> Result<()> {
        let geo = self.geo;
        if (block != BLOCK_INLINE && block >= geo.block_count)
            || off as u64 + data.len() as u64 > geo.block_size as u64
        {
            return Err(Error::InvalidArgument);
        }

        let mut data = data;
        while !data.is_empty() {
            if block == pcache.block && off >= pcache.off && off < pcache.off + geo.cache_size {
                let diff = (data.len() as u32).min(geo.cache_size - (off - pcache.off));
                let start = (off - pcache.off) as usize;
                pcache.buffer[start..start + diff as usize].copy_from_slice(&data[..diff as usize]);
                data = &data[diff as usize..];
                off += diff;

                pcache.size = pcache.size.max(off - pcache.off);
                if pcache.size == geo.cache_size {
                    // eagerly write out a full window
                    self.flush(pcache, validate)?;
                }
                continue;
            }

            // a window for another location must have been flushed already
            if pcache.block != BLOCK_NULL {
                return Err(Error::InvalidArgument);
            }

            pcache.block = block;
            pcache.off = align_down(off, geo.prog_size);
            pcache.size = 0;
        }
        Ok(())
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        if block >= self.geo.block_count {
            return Err(Error::InvalidArgument);
        }
        if self.rcache.block == block {
            self.rcache.invalidate();
        }
        self.dev
            .erase(addr(&self.geo, block, 0), self.geo.block_size as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;
    use crate::config::Config;
    use crate::crc::Crc32;

    fn storage() -> (RamBlockDevice, Storage<RamBlockDevice>) {
        let dev = RamBlockDevice::new(16, 16, 512, 16);
        let geo = Geometry::derive(&dev, &Config::default()).unwrap();
        (dev.clone(), Storage::new(dev, geo, Box::new(Crc32)))
    }

    #[test]
    fn test_prog_is_staged_until_flush() {
        let (probe, mut storage) = storage();
        let mut pcache = Cache::new(storage.geo.cache_size);

        storage.erase(3).unwrap();
        storage.prog(&mut pcache, true, 3, 0, b"hello").unwrap();

        // nothing reached the device yet, but reads see the staged bytes
        assert_eq!(probe.snapshot()[3 * 512], 0xff);
        let mut buf = [0u8; 5];
        storage.read(Some(&pcache), 5, 3, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        storage.flush(&mut pcache, true).unwrap();
        assert_eq!(&probe.snapshot()[3 * 512..3 * 512 + 5], b"hello");
        assert_eq!(pcache.block, BLOCK_NULL);
    }

    #[test]
    fn test_full_window_flushes_eagerly() {
        let (probe, mut storage) = storage();
        let mut pcache = Cache::new(storage.geo.cache_size);
        let data = vec![0x5a; 100];
        storage.prog(&mut pcache, false, 2, 0, &data).unwrap();

        // first 64 bytes were written out, the remainder is pending
        let image = probe.snapshot();
        assert!(image[1024..1024 + 64].iter().all(|&b| b == 0x5a));
        assert_eq!(image[1024 + 64], 0xff);
        assert_eq!(pcache.off, 64);
        assert_eq!(pcache.size, 36);
    }

    #[test]
    fn test_read_out_of_range_is_corrupt() {
        let (_, mut storage) = storage();
        let mut buf = [0u8; 8];
        assert!(matches!(
            storage.read(None, 8, 16, 0, &mut buf),
            Err(Error::Corrupt)
        ));
        assert!(matches!(
            storage.read(None, 8, 0, 508, &mut buf),
            Err(Error::Corrupt)
        ));
    }

    #[test]
    fn test_cmp_and_crc() {
        let (_, mut storage) = storage();
        let mut pcache = Cache::new(storage.geo.cache_size);
        storage.prog(&mut pcache, false, 1, 0, b"abcdefgh").unwrap();
        storage.flush(&mut pcache, false).unwrap();

        assert_eq!(storage.cmp(None, 8, 1, 0, b"abcdefgh").unwrap(), Ordering::Equal);
        assert_eq!(storage.cmp(None, 8, 1, 0, b"abcdefgz").unwrap(), Ordering::Less);
        let crc = storage.crc_range(None, 1, 0, 8, 0xffff_ffff).unwrap();
        assert_eq!(crc, Crc32.crc(0xffff_ffff, b"abcdefgh"));
    }
}
