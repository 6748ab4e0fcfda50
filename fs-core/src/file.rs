//! Open files: inline storage, CTZ lists, and the write-back cache each
//! handle carries

use std::io::SeekFrom;

use bitflags::bitflags;
use log::debug;

use crate::blockdev::BlockDevice;
use crate::cache::{Cache, Storage};
use crate::engine::{file_mut, handle_mut, Engine, Handle, HandleKind};
use crate::error::{Error, Result};
use crate::layout::{
    mask, pair_is_null, types, CtzStruct, Tag, BLOCK_INLINE, BLOCK_NULL, ID_NONE,
};
use crate::metadata::Attr;

bitflags! {
    /// How a file is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x1;
        const WRONLY = 0x2;
        const RDWR = Self::RDONLY.bits() | Self::WRONLY.bits();
        /// Create the file if it does not exist
        const CREAT = 0x100;
        /// With `CREAT`, fail if the file exists
        const EXCL = 0x200;
        /// Start from an empty file
        const TRUNC = 0x400;
        /// Every write goes to the end
        const APPEND = 0x800;
    }
}

impl OpenFlags {
    /// Translate `open(2)` flags
    pub fn from_posix(flags: i32) -> Self {
        let mut out = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WRONLY,
            libc::O_RDWR => OpenFlags::RDWR,
            _ => OpenFlags::RDONLY,
        };
        if flags & libc::O_CREAT != 0 {
            out |= OpenFlags::CREAT;
        }
        if flags & libc::O_EXCL != 0 {
            out |= OpenFlags::EXCL;
        }
        if flags & libc::O_TRUNC != 0 {
            out |= OpenFlags::TRUNC;
        }
        if flags & libc::O_APPEND != 0 {
            out |= OpenFlags::APPEND;
        }
        out
    }

    pub fn readable(self) -> bool {
        self.contains(OpenFlags::RDONLY)
    }

    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRONLY)
    }
}

bitflags! {
    /// Runtime state of an open file
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FileStatus: u32 {
        /// `ctz` differs from the committed entry
        const DIRTY = 0x01;
        /// `block`/`off` point into a list being written
        const WRITING = 0x02;
        /// `cache` holds read data
        const READING = 0x04;
        /// A write failed; nothing may be synced
        const ERRED = 0x08;
        /// Data lives in the metadata pair, mirrored in `cache`
        const INLINE = 0x10;
    }
}

pub(crate) struct FileState {
    pub flags: OpenFlags,
    pub status: FileStatus,
    pub pos: u32,
    pub ctz: CtzStruct,
    pub block: u32,
    pub off: u32,
    pub cache: Cache,
}

impl FileState {
    fn new(flags: OpenFlags, cache_size: u32) -> Self {
        Self {
            flags,
            status: FileStatus::empty(),
            pos: 0,
            ctz: CtzStruct {
                head: BLOCK_NULL,
                size: 0,
            },
            block: BLOCK_NULL,
            off: 0,
            cache: Cache::new(cache_size),
        }
    }

    /// Logical size, including unflushed writes
    pub fn size(&self) -> u32 {
        if self.status.contains(FileStatus::WRITING) {
            self.pos.max(self.ctz.size)
        } else {
            self.ctz.size
        }
    }

    /// Point the cache at the inline payload
    fn cache_inline(&mut self, cache_size: u32) {
        self.cache.block = BLOCK_INLINE;
        self.cache.off = 0;
        self.cache.size = cache_size;
    }
}

/// Read from a CTZ list through the file's own cache
fn ctz_read<D: BlockDevice>(
    bd: &mut Storage<D>,
    file: &mut FileState,
    buf: &mut [u8],
) -> Result<usize> {
    let block_size = bd.geo.block_size;
    if file.pos >= file.ctz.size {
        return Ok(0);
    }

    let size = buf.len().min((file.ctz.size - file.pos) as usize);
    let mut done = 0;
    while done < size {
        if !file.status.contains(FileStatus::READING) || file.off == block_size {
            let (block, off) = bd.ctz_find(
                None,
                Some(&mut file.cache),
                file.ctz.head,
                file.ctz.size,
                file.pos,
            )?;
            file.block = block;
            file.off = off;
            file.status.insert(FileStatus::READING);
        }

        let diff = (size - done).min((block_size - file.off) as usize);
        bd.read_cached(
            None,
            Some(&mut file.cache),
            block_size,
            file.block,
            file.off,
            &mut buf[done..done + diff],
        )?;

        file.pos += diff as u32;
        file.off += diff as u32;
        done += diff;
    }
    Ok(size)
}

impl<D: BlockDevice> Engine<D> {
    fn file(&mut self, slot: usize) -> Result<&mut FileState> {
        file_mut(&mut self.handles, slot)
    }

    /// Open `path`, returning the handle slot
    pub(crate) fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<usize> {
        if !flags.intersects(OpenFlags::RDWR) {
            return Err(Error::InvalidArgument);
        }
        if flags.writable() {
            self.force_consistency()?;
        }

        let lookup = self.dir_find(path)?;
        if lookup.tag.is_none() && lookup.id == ID_NONE {
            return Err(Error::NotFound);
        }

        let cache_size = self.bd.geo.cache_size;
        let slot = self.open_handle(Handle {
            id: lookup.id,
            m: lookup.dir,
            kind: HandleKind::File(FileState::new(flags, cache_size)),
        });

        match self.file_open_entry(slot, lookup.tag, lookup.name, flags) {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.close_handle(slot);
                Err(e)
            }
        }
    }

    fn file_open_entry(
        &mut self,
        slot: usize,
        tag: Option<Tag>,
        name: &str,
        flags: OpenFlags,
    ) -> Result<()> {
        let (id, mut m) = {
            let handle = handle_mut(&mut self.handles, slot)?;
            (handle.id, handle.m)
        };

        let tag = match tag {
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(Error::NotFound);
                }
                if name.len() > self.bd.geo.name_max as usize {
                    return Err(Error::NameTooLong);
                }

                // a new file starts as an empty inline entry
                self.dir_commit(
                    &mut m,
                    &[
                        Attr::new(Tag::new(types::CREATE, id, 0)),
                        Attr::bytes(Tag::new(types::REG, id, name.len() as u16), name.as_bytes()),
                        Attr::bytes(Tag::new(types::INLINESTRUCT, id, 0), &[]),
                    ],
                    Some(slot),
                )?;
                Tag::new(types::INLINESTRUCT, id, 0)
            }
            Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                return Err(Error::AlreadyExists);
            }
            Some(tag) if tag.type3() != types::REG => return Err(Error::IsADirectory),
            Some(_) if flags.contains(OpenFlags::TRUNC) => {
                self.file(slot)?.status.insert(FileStatus::DIRTY);
                Tag::new(types::INLINESTRUCT, id, 0)
            }
            Some(_) => {
                let mut buf = [0u8; CtzStruct::SIZE];
                let tag = self.dir_get(
                    &m,
                    mask(0x700, 0x3ff, 0),
                    Tag::new(types::STRUCT, id, CtzStruct::SIZE as u16),
                    &mut buf,
                )?;
                self.file(slot)?.ctz = CtzStruct::from_bytes(&buf);
                tag
            }
        };

        let cache_size = self.bd.geo.cache_size;
        let file = self.file(slot)?;
        file.cache.zero();
        if tag.type3() == types::INLINESTRUCT {
            file.ctz = CtzStruct {
                head: BLOCK_INLINE,
                size: tag.size(),
            };
            file.status.insert(FileStatus::INLINE);
            file.cache_inline(cache_size);
            if file.ctz.size > 0 {
                self.inline_load(slot)?;
            }
        }
        Ok(())
    }

    /// Copy the committed inline payload into the file cache
    fn inline_load(&mut self, slot: usize) -> Result<()> {
        let cache_size = self.bd.geo.cache_size;
        let (id, m) = {
            let handle = handle_mut(&mut self.handles, slot)?;
            (handle.id, handle.m)
        };

        let mut buffer = std::mem::take(&mut self.file(slot)?.cache.buffer);
        let len = cache_size.min(0x3fe) as usize;
        let res = self.dir_get(
            &m,
            mask(0x700, 0x3ff, 0),
            Tag::new(types::STRUCT, id, len as u16),
            &mut buffer[..len],
        );
        let file = self.file(slot)?;
        file.cache.buffer = buffer;
        file.cache_inline(cache_size);
        res.map(|_| ())
    }

    /// Finish pending reads and writes; afterwards `ctz` describes the
    /// whole file and only a commit is missing
    pub(crate) fn file_flush(&mut self, slot: usize) -> Result<()> {
        let file = self.file(slot)?;
        if file.status.contains(FileStatus::READING) {
            if !file.status.contains(FileStatus::INLINE) {
                file.cache.invalidate();
            }
            file.status.remove(FileStatus::READING);
        }

        if !file.status.contains(FileStatus::WRITING) {
            return Ok(());
        }
        let pos = file.pos;

        if file.status.contains(FileStatus::INLINE) {
            file.pos = file.pos.max(file.ctz.size);
        } else {
            // carry over whatever follows the written range
            let ctz = file.ctz;
            if file.pos < ctz.size {
                let mut orig = FileState::new(OpenFlags::RDONLY, self.bd.geo.cache_size);
                orig.ctz = ctz;
                orig.pos = pos;
                self.bd.rcache.invalidate();

                let mut chunk = [0u8; 32];
                while self.file(slot)?.pos < ctz.size {
                    let n = ctz_read(&mut self.bd, &mut orig, &mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    self.file_flushed_write(slot, &chunk[..n])?;
                }
            }

            self.file_flush_cache(slot)?;
        }

        let file = self.file(slot)?;
        file.ctz = CtzStruct {
            head: file.block,
            size: file.pos,
        };
        if file.status.contains(FileStatus::INLINE) {
            file.ctz.head = BLOCK_INLINE;
        }
        file.status.remove(FileStatus::WRITING);
        file.status.insert(FileStatus::DIRTY);
        file.pos = pos;
        Ok(())
    }

    /// Program out the staged part of the current block, moving to a new
    /// block if it does not read back
    fn file_flush_cache(&mut self, slot: usize) -> Result<()> {
        loop {
            let Engine { bd, handles, .. } = self;
            let file = file_mut(handles, slot)?;
            match bd.flush(&mut file.cache, true) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_corrupt() => {
                    debug!("Bad block at {:#x}", file.block);
                    self.file_relocate(slot)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy the written part of the current block into a fresh one
    fn file_relocate(&mut self, slot: usize) -> Result<()> {
        if self.file(slot)?.status.contains(FileStatus::INLINE)
            && self.file(slot)?.cache.block != BLOCK_INLINE
        {
            self.inline_load(slot)?;
        }

        loop {
            let nblock = self.alloc()?;
            match self.file_relocate_into(slot, nblock) {
                Err(e) if e.is_corrupt() => {
                    debug!("Bad block at {:#x}", nblock);
                    self.pcache.zero();
                }
                res => return res,
            }
        }
    }

    fn file_relocate_into(&mut self, slot: usize, nblock: u32) -> Result<()> {
        self.pcache.zero();
        self.bd.erase(nblock)?;

        let Engine {
            bd, pcache, handles, ..
        } = self;
        let file = file_mut(handles, slot)?;
        let inline = file.status.contains(FileStatus::INLINE);

        let mut chunk = [0u8; 32];
        let mut i = 0;
        while i < file.off {
            let n = (file.off - i).min(chunk.len() as u32) as usize;
            if inline {
                let src = file
                    .cache
                    .buffer
                    .get(i as usize..i as usize + n)
                    .ok_or(Error::Corrupt)?;
                chunk[..n].copy_from_slice(src);
            } else {
                bd.read(Some(&file.cache), file.off - i, file.block, i, &mut chunk[..n])?;
            }
            bd.prog(pcache, true, nblock, i, &chunk[..n])?;
            i += n as u32;
        }

        // the staged block becomes the file's write cache
        std::mem::swap(&mut file.cache, pcache);
        pcache.zero();

        file.block = nblock;
        file.status.insert(FileStatus::WRITING);
        Ok(())
    }

    /// Move an inline file out to its own block
    fn file_outline(&mut self, slot: usize) -> Result<()> {
        let file = self.file(slot)?;
        file.off = file.pos;
        self.free.ack();
        self.file_relocate(slot)?;
        self.file(slot)?.status.remove(FileStatus::INLINE);
        Ok(())
    }

    fn file_flushed_read(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        if self.file(slot)?.status.contains(FileStatus::INLINE) {
            if self.file(slot)?.cache.block != BLOCK_INLINE {
                self.inline_load(slot)?;
            }
            let file = self.file(slot)?;
            if file.pos >= file.ctz.size {
                return Ok(0);
            }
            let size = buf.len().min((file.ctz.size - file.pos) as usize);
            let start = file.pos as usize;
            let src = file
                .cache
                .buffer
                .get(start..start + size)
                .ok_or(Error::Corrupt)?;
            buf[..size].copy_from_slice(src);
            file.block = BLOCK_INLINE;
            file.pos += size as u32;
            file.off = file.pos;
            file.status.insert(FileStatus::READING);
            return Ok(size);
        }

        let Engine { bd, handles, .. } = self;
        ctz_read(bd, file_mut(handles, slot)?, buf)
    }

    pub(crate) fn file_read(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(slot)?;
        if !file.flags.readable() {
            return Err(Error::InvalidArgument);
        }
        if file.status.contains(FileStatus::WRITING) {
            self.file_flush(slot)?;
        }
        self.file_flushed_read(slot, buf)
    }

    fn file_flushed_write(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        let block_size = self.bd.geo.block_size;
        let mut done = 0;
        while done < data.len() {
            let file = self.file(slot)?;
            if !file.status.contains(FileStatus::WRITING) || file.off == block_size {
                if file.status.contains(FileStatus::INLINE) {
                    file.block = BLOCK_INLINE;
                    file.off = file.pos;
                } else {
                    if file.status.contains(FileStatus::WRITING) {
                        // the last window of a full block is not always
                        // flushed eagerly
                        self.file_flush_cache(slot)?;
                    } else if file.pos > 0 {
                        // find the block we are extending from
                        let (head, size, pos) = (file.ctz.head, file.ctz.size, file.pos);
                        let Engine { bd, handles, .. } = self;
                        let file = file_mut(handles, slot)?;
                        let (block, off) =
                            bd.ctz_find(None, Some(&mut file.cache), head, size, pos - 1)?;
                        file.block = block;
                        file.off = off;
                        // the cache may hold read data
                        file.cache.zero();
                    }

                    self.free.ack();
                    let (block, pos) = {
                        let file = self.file(slot)?;
                        (file.block, file.pos)
                    };
                    let (nblock, noff) = self.ctz_extend(slot, block, pos)?;
                    let file = self.file(slot)?;
                    file.block = nblock;
                    file.off = noff;
                }
                self.file(slot)?.status.insert(FileStatus::WRITING);
            }

            let file = self.file(slot)?;
            let diff = (data.len() - done).min((block_size - file.off) as usize);
            loop {
                let Engine { bd, handles, .. } = self;
                let file = file_mut(handles, slot)?;
                match bd.prog(
                    &mut file.cache,
                    true,
                    file.block,
                    file.off,
                    &data[done..done + diff],
                ) {
                    Ok(()) => break,
                    Err(e) if e.is_corrupt() => self.file_relocate(slot)?,
                    Err(e) => return Err(e),
                }
            }

            let file = self.file(slot)?;
            file.pos += diff as u32;
            file.off += diff as u32;
            done += diff;

            self.free.ack();
        }
        Ok(done)
    }

    fn file_write_inner(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        let (file_max, inline_max) = (self.bd.geo.file_max, self.bd.geo.inline_max);
        let file = self.file(slot)?;
        if !file.flags.writable() {
            return Err(Error::InvalidArgument);
        }

        if file.status.contains(FileStatus::READING) {
            self.file_flush(slot)?;
        }

        let file = self.file(slot)?;
        if file.flags.contains(OpenFlags::APPEND) && file.pos < file.ctz.size {
            file.pos = file.ctz.size;
        }

        if file.pos as u64 + data.len() as u64 > file_max as u64 {
            return Err(Error::FileTooLarge);
        }

        // a seek past the end leaves a hole that reads back as zeros
        if !file.status.contains(FileStatus::WRITING) && file.pos > file.ctz.size {
            let target = file.pos;
            file.pos = file.ctz.size;
            let zeros = [0u8; 32];
            while self.file(slot)?.pos < target {
                let n = (target - self.file(slot)?.pos).min(zeros.len() as u32) as usize;
                self.file_write_inner(slot, &zeros[..n])?;
            }
        }

        let file = self.file(slot)?;
        if file.status.contains(FileStatus::INLINE)
            && (file.pos + data.len() as u32).max(file.ctz.size) > inline_max
        {
            self.file_outline(slot)?;
        }

        self.file_flushed_write(slot, data)
    }

    pub(crate) fn file_write(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        match self.file_write_inner(slot, data) {
            Ok(n) => {
                self.file(slot)?.status.remove(FileStatus::ERRED);
                Ok(n)
            }
            Err(e) => {
                if let Ok(file) = self.file(slot) {
                    file.status.insert(FileStatus::ERRED);
                }
                Err(e)
            }
        }
    }

    /// Flush and commit the file's entry so its contents survive power loss
    pub(crate) fn file_sync(&mut self, slot: usize) -> Result<()> {
        if self.file(slot)?.status.contains(FileStatus::ERRED) {
            // partial state must never reach the disk
            return Ok(());
        }

        let res = self.file_sync_inner(slot);
        if res.is_err() {
            if let Ok(file) = self.file(slot) {
                file.status.insert(FileStatus::ERRED);
            }
        }
        res
    }

    fn file_sync_inner(&mut self, slot: usize) -> Result<()> {
        self.file_flush(slot)?;

        let (id, mut m) = {
            let handle = handle_mut(&mut self.handles, slot)?;
            (handle.id, handle.m)
        };
        let file = self.file(slot)?;
        if !file.status.contains(FileStatus::DIRTY) || pair_is_null(m.pair) {
            return Ok(());
        }

        let (ty, payload) = if file.status.contains(FileStatus::INLINE) {
            let size = file.ctz.size as usize;
            let bytes = file.cache.buffer.get(..size).ok_or(Error::Corrupt)?;
            (types::INLINESTRUCT, bytes.to_vec())
        } else {
            (types::CTZSTRUCT, file.ctz.to_bytes().to_vec())
        };

        self.dir_commit(
            &mut m,
            &[Attr::bytes(Tag::new(ty, id, payload.len() as u16), &payload)],
            Some(slot),
        )?;

        self.file(slot)?.status.remove(FileStatus::DIRTY);
        Ok(())
    }

    pub(crate) fn file_seek(&mut self, slot: usize, pos: SeekFrom) -> Result<u32> {
        self.file_flush(slot)?;

        let file_max = self.bd.geo.file_max as i64;
        let file = self.file(slot)?;
        let npos = match pos {
            SeekFrom::Start(off) => i64::try_from(off).unwrap_or(i64::MAX),
            SeekFrom::Current(off) => file.pos as i64 + off,
            SeekFrom::End(off) => file.ctz.size as i64 + off,
        };
        if npos < 0 || npos > file_max {
            return Err(Error::InvalidArgument);
        }

        file.pos = npos as u32;
        Ok(file.pos)
    }

    pub(crate) fn file_tell(&mut self, slot: usize) -> Result<u32> {
        Ok(self.file(slot)?.pos)
    }

    pub(crate) fn file_size(&mut self, slot: usize) -> Result<u32> {
        Ok(self.file(slot)?.size())
    }

    /// Cut or extend the file to `size` bytes, keeping the position
    pub(crate) fn file_truncate(&mut self, slot: usize, size: u32) -> Result<()> {
        let (file_max, inline_max, cache_size) = (
            self.bd.geo.file_max,
            self.bd.geo.inline_max,
            self.bd.geo.cache_size,
        );
        let file = self.file(slot)?;
        if !file.flags.writable() {
            return Err(Error::InvalidArgument);
        }
        if size > file_max {
            return Err(Error::InvalidArgument);
        }

        let pos = file.pos;
        let oldsize = file.size();
        if size < oldsize {
            if size <= inline_max {
                // small enough to go back inline
                self.file_seek(slot, SeekFrom::Start(0))?;
                let mut data = vec![0u8; size as usize];
                let mut read = 0;
                while read < data.len() {
                    match self.file_flushed_read(slot, &mut data[read..])? {
                        0 => break,
                        n => read += n,
                    }
                }

                let file = self.file(slot)?;
                file.ctz = CtzStruct {
                    head: BLOCK_INLINE,
                    size,
                };
                file.status
                    .insert(FileStatus::DIRTY | FileStatus::READING | FileStatus::INLINE);
                file.cache_inline(cache_size);
                file.cache.buffer[..data.len()].copy_from_slice(&data);
            } else {
                self.file_flush(slot)?;

                // the block holding the new last byte becomes the head
                let Engine { bd, handles, .. } = self;
                let file = file_mut(handles, slot)?;
                let (head, ctzsize) = (file.ctz.head, file.ctz.size);
                let (block, _) = bd.ctz_find(None, Some(&mut file.cache), head, ctzsize, size - 1)?;
                file.block = block;
                file.pos = size;
                file.ctz = CtzStruct { head: block, size };
                file.status.insert(FileStatus::DIRTY | FileStatus::READING);
            }
        } else if size > oldsize {
            self.file_seek(slot, SeekFrom::End(0))?;
            let zeros = [0u8; 32];
            while self.file(slot)?.pos < size {
                let n = (size - self.file(slot)?.pos).min(zeros.len() as u32) as usize;
                self.file_write(slot, &zeros[..n])?;
            }
        }

        self.file_seek(slot, SeekFrom::Start(pos as u64))?;
        Ok(())
    }

    /// Drop the handle. Writes that were not synced are discarded.
    pub(crate) fn file_close(&mut self, slot: usize) -> Result<()> {
        match self.close_handle(slot) {
            Some(Handle {
                kind: HandleKind::File(_),
                ..
            }) => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// The pair and id the file's entry currently lives at
    #[cfg(test)]
    pub(crate) fn file_entry(&mut self, slot: usize) -> Result<(crate::metadata::MDir, u16)> {
        let handle = handle_mut(&mut self.handles, slot)?;
        Ok((handle.m, handle.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;
    use crate::config::{Config, Geometry};
    use crate::crc::Crc32;

    fn mounted() -> Engine<RamBlockDevice> {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        let geo = Geometry::derive(&dev, &Config::default()).unwrap();
        let mut fs = Engine::new(dev, geo, Box::new(Crc32));
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    #[test]
    fn test_posix_flags() {
        let flags = OpenFlags::from_posix(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC);
        assert_eq!(flags, OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::TRUNC);
        assert_eq!(OpenFlags::from_posix(libc::O_RDONLY), OpenFlags::RDONLY);
        assert!(OpenFlags::from_posix(libc::O_WRONLY | libc::O_APPEND).contains(OpenFlags::APPEND));
    }

    #[test]
    fn test_new_file_is_inline_until_it_grows() {
        let mut fs = mounted();
        let slot = fs
            .file_open("f", OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(slot, &[7u8; 40]).unwrap();
        assert!(fs.file(slot).unwrap().status.contains(FileStatus::INLINE));

        fs.file_write(slot, &[7u8; 40]).unwrap();
        let file = fs.file(slot).unwrap();
        assert!(!file.status.contains(FileStatus::INLINE));
        assert_eq!(file.size(), 80);

        fs.file_sync(slot).unwrap();
        let (m, id) = fs.file_entry(slot).unwrap();
        let mut buf = [0u8; 8];
        let tag = fs
            .dir_get(&m, mask(0x700, 0x3ff, 0), Tag::new(types::STRUCT, id, 8), &mut buf)
            .unwrap();
        assert_eq!(tag.type3(), types::CTZSTRUCT);
        assert_eq!(CtzStruct::from_bytes(&buf).size, 80);
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let mut fs = mounted();
        let slot = fs
            .file_open("f", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(slot).unwrap();

        let slot = fs.file_open("f", OpenFlags::RDONLY).unwrap();
        assert!(matches!(fs.file_write(slot, b"x"), Err(Error::InvalidArgument)));
        assert!(matches!(fs.file_truncate(slot, 0), Err(Error::InvalidArgument)));
    }

    #[test]
    fn test_extend_from_unreadable_head_is_corrupt() {
        let mut fs = mounted();
        let slot = fs
            .file_open("f", OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        let before: u32 = fs.bd.dev.erase_counts().iter().sum();

        // a head past the end of the device can't be copied from
        assert!(matches!(fs.ctz_extend(slot, 5000, 100), Err(Error::Corrupt)));
        let after: u32 = fs.bd.dev.erase_counts().iter().sum();
        assert!(after - before <= 1, "erased {} blocks", after - before);
    }
}
