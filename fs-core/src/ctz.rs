//! File data stored as a backwards CTZ skip-list
//!
//! Block `n` of a file (counting from zero) starts with `ctz(n) + 1`
//! little-endian pointers; pointer `k` addresses block `n - 2^k`. Block 0
//! carries no pointers. Appending only ever writes the new last block, and
//! any position can be reached from the head in O(log n) reads.

use log::debug;

use crate::blockdev::BlockDevice;
use crate::cache::{Cache, Storage};
use crate::engine::{file_mut, Engine};
use crate::error::{Error, Result};

/// Map a byte position to the block index holding it and the offset of
/// that byte inside the block
pub(crate) fn index(block_size: u32, pos: u32) -> (u32, u32) {
    let b = block_size - 2 * 4;
    let i = pos / b;
    if i == 0 {
        return (0, pos);
    }

    let i = (pos - 4 * ((i - 1).count_ones() + 2)) / b;
    (i, pos - b * i - 4 * i.count_ones())
}

impl<D: BlockDevice> Storage<D> {
    /// Find the block and offset of byte `pos` in the list ending at `head`
    pub fn ctz_find(
        &mut self,
        pcache: Option<&Cache>,
        mut rcache: Option<&mut Cache>,
        head: u32,
        size: u32,
        pos: u32,
    ) -> Result<(u32, u32)> {
        if size == 0 {
            return Ok((crate::layout::BLOCK_NULL, 0));
        }

        let block_size = self.geo.block_size;
        let (mut current, _) = index(block_size, size - 1);
        let (target, off) = index(block_size, pos);

        let mut head = head;
        while current > target {
            let skip = (32 - (current - target).leading_zeros() - 1).min(current.trailing_zeros());
            let mut buf = [0u8; 4];
            self.read_cached(pcache, rcache.as_deref_mut(), 4, head, 4 * skip, &mut buf)?;
            head = u32::from_le_bytes(buf);
            current -= 1 << skip;
        }
        Ok((head, off))
    }

    /// Call `cb` for every block of the list ending at `head`
    pub fn ctz_traverse(
        &mut self,
        pcache: Option<&Cache>,
        head: u32,
        size: u32,
        cb: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let (mut index, _) = index(self.geo.block_size, size - 1);
        let mut head = head;
        loop {
            cb(head)?;
            if index == 0 {
                return Ok(());
            }

            // odd blocks hold one pointer, even blocks at least two; take
            // both when we can to skip a level
            let count = 2 - (index & 1);
            let mut buf = [0u8; 8];
            self.read(pcache, 4 * count, head, 0, &mut buf[..4 * count as usize])?;
            let heads = [
                u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
                u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ];
            if count == 2 {
                cb(heads[0])?;
            }
            head = heads[count as usize - 1];
            index -= count;
        }
    }
}

impl<D: BlockDevice> Engine<D> {
    /// Allocate a block to follow a list of `size` bytes ending at `head`.
    ///
    /// Returns the new block and the offset where data continues. Staging
    /// goes through the cache of the open file in `slot`.
    pub(crate) fn ctz_extend(&mut self, slot: usize, head: u32, size: u32) -> Result<(u32, u32)> {
        loop {
            let nblock = self.alloc()?;
            match self.ctz_fill(slot, nblock, head, size)? {
                Some(res) => return Ok(res),
                None => {
                    debug!("Bad block at {:#x}", nblock);
                    file_mut(&mut self.handles, slot)?.cache.zero();
                }
            }
        }
    }

    /// Erase `nblock` and write its pointers or copied prefix. `None` means
    /// `nblock` itself went bad; errors reading the existing list are
    /// returned as they are.
    fn ctz_fill(
        &mut self,
        slot: usize,
        nblock: u32,
        head: u32,
        size: u32,
    ) -> Result<Option<(u32, u32)>> {
        if let Err(e) = self.bd.erase(nblock) {
            return bad_block(e);
        }
        if size == 0 {
            return Ok(Some((nblock, 0)));
        }

        let block_size = self.bd.geo.block_size;
        let (index, last) = index(block_size, size - 1);
        let noff = last + 1;

        let Engine { bd, handles, .. } = self;
        let cache = &mut file_mut(handles, slot)?.cache;

        // an incomplete last block is copied rather than linked
        if noff != block_size {
            let mut chunk = [0u8; 32];
            let mut i = 0;
            while i < noff {
                let n = (noff - i).min(chunk.len() as u32);
                bd.read(None, noff - i, head, i, &mut chunk[..n as usize])?;
                if let Err(e) = bd.prog(cache, true, nblock, i, &chunk[..n as usize]) {
                    return bad_block(e);
                }
                i += n;
            }
            return Ok(Some((nblock, noff)));
        }

        let index = index + 1;
        let skips = index.trailing_zeros() + 1;
        let mut nhead = head;
        for i in 0..skips {
            if let Err(e) = bd.prog(cache, true, nblock, 4 * i, &nhead.to_le_bytes()) {
                return bad_block(e);
            }
            if i != skips - 1 {
                let mut buf = [0u8; 4];
                bd.read(None, 4, nhead, 4 * i, &mut buf)?;
                nhead = u32::from_le_bytes(buf);
            }
        }
        Ok(Some((nblock, 4 * skips)))
    }
}

/// A corrupt erase or program marks the target block bad
fn bad_block<T>(e: Error) -> Result<Option<T>> {
    if e.is_corrupt() {
        Ok(None)
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;
    use crate::config::{Config, Geometry};
    use crate::crc::Crc32;

    #[test]
    fn test_index_boundaries() {
        assert_eq!(index(512, 0), (0, 0));
        assert_eq!(index(512, 511), (0, 511));
        // block 1 starts with one pointer
        assert_eq!(index(512, 512), (1, 4));
        assert_eq!(index(512, 1019), (1, 511));
        // block 2 starts with two
        assert_eq!(index(512, 1020), (2, 8));
    }

    #[test]
    fn test_index_walks_blocks_in_order() {
        let block_size = 128;
        let (mut block, mut off) = (0, 0);
        for pos in 0..20_000 {
            assert_eq!(index(block_size, pos), (block, off), "pos {}", pos);
            off += 1;
            if off == block_size {
                block += 1;
                off = 4 * (block.trailing_zeros() + 1);
            }
        }
    }

    /// Lay out a five block list in blocks 10..15 by hand
    fn build_list(storage: &mut Storage<RamBlockDevice>) {
        let pointers: [&[u32]; 5] = [&[], &[10], &[11, 10], &[12], &[13, 12, 10]];
        let mut pcache = Cache::new(storage.geo.cache_size);
        for (n, ptrs) in pointers.iter().enumerate() {
            let block = 10 + n as u32;
            storage.erase(block).unwrap();
            for (k, p) in ptrs.iter().enumerate() {
                storage
                    .prog(&mut pcache, false, block, 4 * k as u32, &p.to_le_bytes())
                    .unwrap();
            }
            storage.flush(&mut pcache, false).unwrap();
        }
    }

    #[test]
    fn test_find_and_traverse() {
        let dev = RamBlockDevice::new(1, 1, 512, 32);
        let geo = Geometry::derive(&dev, &Config::default()).unwrap();
        let mut storage = Storage::new(dev, geo, Box::new(Crc32));
        build_list(&mut storage);

        // one byte into block 4, which starts after three pointers
        let size = 2033;
        assert_eq!(index(512, size - 1), (4, 12));

        assert_eq!(storage.ctz_find(None, None, 14, size, 0).unwrap(), (10, 0));
        assert_eq!(storage.ctz_find(None, None, 14, size, 600).unwrap(), (11, 92));
        assert_eq!(storage.ctz_find(None, None, 14, size, 1100).unwrap(), (12, 88));
        assert_eq!(storage.ctz_find(None, None, 14, size, 2032).unwrap(), (14, 12));

        let mut seen = Vec::new();
        storage
            .ctz_traverse(None, 14, size, &mut |b| {
                seen.push(b);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![14, 13, 12, 11, 10]);
    }
}
