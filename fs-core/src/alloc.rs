//! Lookahead block allocator
//!
//! Free space is never stored on disk. Instead a bitmap covering a window
//! of `8 * lookahead_size` blocks is filled by walking every live structure,
//! and allocations are served from the window until it runs dry. The window
//! then slides forward, so allocation sweeps the device round-robin and
//! wear spreads across all blocks.

use log::{debug, error};

use crate::blockdev::BlockDevice;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Bitmap window over the device, one bit per block
#[derive(Debug)]
pub(crate) struct Lookahead {
    /// First block covered by the window
    pub off: u32,
    /// Blocks covered by the window
    pub size: u32,
    /// Next window index to examine
    pub i: u32,
    /// Blocks that may still be examined before every block has been seen
    /// since the last acknowledgement
    pub ack: u32,
    block_count: u32,
    bitmap: Vec<u8>,
}

impl Lookahead {
    pub fn new(lookahead_size: u32, block_count: u32) -> Self {
        Self {
            off: 0,
            size: 0,
            i: 0,
            ack: block_count,
            block_count,
            bitmap: vec![0; lookahead_size as usize],
        }
    }

    /// Window capacity in blocks
    pub fn capacity(&self) -> u32 {
        8 * self.bitmap.len() as u32
    }

    /// Every allocation so far has been committed somewhere reachable
    pub fn ack(&mut self) {
        self.ack = self.block_count;
    }

    /// Throw the window away; the next allocation rescans
    pub fn drop_window(&mut self) {
        self.size = 0;
        self.i = 0;
        self.ack();
    }

    /// Start a fresh window at `off` with nothing marked in use
    pub fn reset(&mut self, off: u32) {
        self.off = off % self.block_count;
        self.size = self.capacity().min(self.block_count);
        self.i = 0;
        self.bitmap.fill(0);
        self.ack();
    }

    fn is_set(&self, i: u32) -> bool {
        self.bitmap[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Mark `block` as in use if it falls inside the window
    pub fn mark(&mut self, block: u32) {
        Self::mark_in(&mut self.bitmap, self.off, self.size, self.block_count, block);
    }

    /// `mark` against a detached bitmap, used while the engine walks the
    /// filesystem
    pub fn mark_in(bitmap: &mut [u8], off: u32, size: u32, block_count: u32, block: u32) {
        if block >= block_count {
            return;
        }
        let rel = (block + block_count - off) % block_count;
        if rel < size {
            bitmap[(rel / 8) as usize] |= 1 << (rel % 8);
        }
    }

    /// Take a free block from the current window, if it has one left
    pub fn next_free(&mut self) -> Option<u32> {
        while self.i != self.size {
            let rel = self.i;
            self.i += 1;
            self.ack = self.ack.saturating_sub(1);

            if !self.is_set(rel) {
                let block = (self.off + rel) % self.block_count;
                debug!("Lookahead::next_free: block {} (window {}+{})", block, self.off, rel);

                // skip ahead so a later ack does not credit blocks in use
                while self.i != self.size && self.is_set(self.i) {
                    self.i += 1;
                    self.ack = self.ack.saturating_sub(1);
                }
                return Some(block);
            }
        }
        None
    }

    /// Slide the window to the first unexamined block and detach its zeroed
    /// bitmap for filling.
    ///
    /// Fails with `NoSpace` once every block has been examined since the
    /// last acknowledgement.
    pub fn advance(&mut self) -> Result<Vec<u8>> {
        if self.ack == 0 {
            error!("No more free space {}", self.i + self.off);
            return Err(Error::NoSpace);
        }

        self.off = (self.off + self.i) % self.block_count;
        self.size = self.capacity().min(self.ack);
        self.i = 0;
        let mut bitmap = std::mem::take(&mut self.bitmap);
        bitmap.fill(0);
        Ok(bitmap)
    }

    /// Reattach a bitmap detached by `advance`
    pub fn restore(&mut self, bitmap: Vec<u8>) {
        self.bitmap = bitmap;
    }
}

impl<D: BlockDevice> Engine<D> {
    /// Hand out a free block, refilling the window as needed
    pub(crate) fn alloc(&mut self) -> Result<u32> {
        loop {
            if let Some(block) = self.free.next_free() {
                return Ok(block);
            }
            self.scan_free()?;
        }
    }

    /// Move the window on and mark every block reachable from the
    /// filesystem, including pairs not yet linked into the thread
    pub(crate) fn scan_free(&mut self) -> Result<()> {
        let mut bitmap = self.free.advance()?;
        let (off, size) = (self.free.off, self.free.size);
        let block_count = self.bd.geo.block_count;
        let res = self.traverse_blocks(true, &mut |block| {
            Lookahead::mark_in(&mut bitmap, off, size, block_count, block);
            Ok(())
        });
        self.free.restore(bitmap);
        if res.is_err() {
            self.free.drop_window();
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(look: &mut Lookahead, used: &[u32]) {
        let mut bitmap = look.advance().unwrap();
        for &b in used {
            Lookahead::mark_in(&mut bitmap, look.off, look.size, 64, b);
        }
        look.restore(bitmap);
    }

    #[test]
    fn test_block_allocation() {
        let mut look = Lookahead::new(2, 64);
        look.reset(0);
        look.mark(0);
        look.mark(1);

        assert_eq!(look.next_free(), Some(2));
        assert_eq!(look.next_free(), Some(3));
    }

    #[test]
    fn test_window_slides_and_wraps() {
        let mut look = Lookahead::new(2, 64);
        look.off = 56;
        look.drop_window();

        // first window starts where the previous one ended: 56..64 then 0..8
        filled(&mut look, &[56, 57, 60, 1]);
        assert_eq!(look.off, 56);
        assert_eq!(look.size, 16);
        let got: Vec<u32> = std::iter::from_fn(|| look.next_free()).collect();
        assert_eq!(got, vec![58, 59, 61, 62, 63, 0, 2, 3, 4, 5, 6, 7]);

        filled(&mut look, &[]);
        assert_eq!(look.off, 8);
        assert_eq!(look.next_free(), Some(8));
    }

    #[test]
    fn test_exhaustion_without_ack() {
        let mut look = Lookahead::new(1, 16);
        look.drop_window();
        let all: Vec<u32> = (0..16).collect();

        filled(&mut look, &all);
        assert_eq!(look.next_free(), None);
        filled(&mut look, &all);
        assert_eq!(look.next_free(), None);
        assert!(matches!(look.advance(), Err(Error::NoSpace)));

        // an ack makes the whole device eligible again
        look.ack();
        assert!(look.advance().is_ok());
    }
}
