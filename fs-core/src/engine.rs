//! Filesystem-wide state and the operations that span metadata pairs:
//! format, mount, block traversal, parent/predecessor lookup, relocation
//! and recovery of interrupted moves and orphans.

use log::{debug, error, warn};

use crate::alloc::Lookahead;
use crate::blockdev::BlockDevice;
use crate::cache::{Cache, Storage};
use crate::config::Geometry;
use crate::crc::Integrity;
use crate::dir::DirState;
use crate::error::{Error, Result};
use crate::file::{FileState, FileStatus};
use crate::layout::{
    mask, pair_cmp, pair_from_bytes, pair_is_null, pair_sync, pair_to_bytes, types, CtzStruct,
    GState, Pair, Superblock, Tag, BLOCK_INLINE, DISK_VERSION, ID_NONE, MAGIC, PAIR_NULL, SUPERBLOCK_PAIR,
};
use crate::metadata::{Attr, Fetched, MDir, Matcher, Search};

/// What an open handle tracks
pub(crate) enum HandleKind {
    File(FileState),
    Dir(DirState),
    /// Keeps a metadata pair up to date across commits during a
    /// multi-step operation
    Pin,
}

/// An open handle: the pair and id it refers to, kept current by every
/// commit
pub(crate) struct Handle {
    pub id: u16,
    pub m: MDir,
    pub kind: HandleKind,
}

pub(crate) fn handle_mut(handles: &mut [Option<Handle>], slot: usize) -> Result<&mut Handle> {
    handles
        .get_mut(slot)
        .and_then(Option::as_mut)
        .ok_or(Error::InvalidArgument)
}

pub(crate) fn file_mut(handles: &mut [Option<Handle>], slot: usize) -> Result<&mut FileState> {
    match handle_mut(handles, slot)? {
        Handle {
            kind: HandleKind::File(file),
            ..
        } => Ok(file),
        _ => Err(Error::InvalidArgument),
    }
}

/// The mounted filesystem behind the lock
pub(crate) struct Engine<D> {
    pub bd: Storage<D>,
    pub pcache: Cache,
    pub free: Lookahead,
    pub root: Pair,
    /// Global state as it should be
    pub gstate: GState,
    /// Global state as last committed
    pub gdisk: GState,
    /// Delta taken over from dropped pairs, not yet committed
    pub gdelta: GState,
    pub seed: u32,
    pub handles: Vec<Option<Handle>>,
}

impl<D: BlockDevice> Engine<D> {
    pub fn new(dev: D, geo: Geometry, integrity: Box<dyn Integrity + Send + Sync>) -> Self {
        Self {
            pcache: Cache::new(geo.cache_size),
            free: Lookahead::new(geo.lookahead_size, geo.block_count),
            bd: Storage::new(dev, geo, integrity),
            root: PAIR_NULL,
            gstate: GState::default(),
            gdisk: GState::default(),
            gdelta: GState::default(),
            seed: 0,
            handles: Vec::new(),
        }
    }

    pub fn into_device(self) -> D {
        self.bd.dev
    }

    pub fn open_handle(&mut self, handle: Handle) -> usize {
        match self.handles.iter().position(Option::is_none) {
            Some(slot) => {
                self.handles[slot] = Some(handle);
                slot
            }
            None => {
                self.handles.push(Some(handle));
                self.handles.len() - 1
            }
        }
    }

    pub fn close_handle(&mut self, slot: usize) -> Option<Handle> {
        self.handles.get_mut(slot).and_then(Option::take)
    }

    /// Track `m` through commits until `unpin`
    pub fn pin(&mut self, m: MDir, id: u16) -> usize {
        self.open_handle(Handle {
            id,
            m,
            kind: HandleKind::Pin,
        })
    }

    pub fn unpin(&mut self, slot: usize) -> Result<Handle> {
        self.close_handle(slot).ok_or(Error::InvalidArgument)
    }

    fn check_cycle(&self, cycle: &mut u32) -> Result<()> {
        if *cycle >= self.bd.geo.block_count / 2 {
            warn!("Detected cycle in tail list");
            return Err(Error::Corrupt);
        }
        *cycle += 1;
        Ok(())
    }

    /// Write an empty filesystem: a root pair at {0, 1} holding the
    /// superblock entry
    pub fn format(&mut self) -> Result<()> {
        let geo = self.bd.geo;
        self.free.reset(0);

        let mut root = self.dir_alloc()?;
        let superblock = Superblock {
            version: DISK_VERSION,
            block_size: geo.block_size,
            block_count: geo.block_count,
            name_max: geo.name_max,
            file_max: geo.file_max,
            attr_max: geo.attr_max,
        }
        .to_bytes();
        self.dir_commit(
            &mut root,
            &[
                Attr::new(Tag::new(types::CREATE, 0, 0)),
                Attr::bytes(Tag::new(types::SUPERBLOCK, 0, 8), MAGIC),
                Attr::bytes(
                    Tag::new(types::INLINESTRUCT, 0, Superblock::SIZE as u16),
                    &superblock,
                ),
            ],
            None,
        )?;

        // compact again so both blocks carry this format and no older
        // filesystem can be mounted from the spare
        root.erased = false;
        self.dir_commit(&mut root, &[], None)?;

        self.fetch(SUPERBLOCK_PAIR)?;
        Ok(())
    }

    /// Find the superblock, check it against our geometry and fold the
    /// global state of every pair
    pub fn mount(&mut self) -> Result<()> {
        let mut dir = MDir::walk_start();
        let mut cycle = 0;
        let search = Search {
            mask: mask(0x7ff, 0x3ff, 0),
            tag: Tag::new(types::SUPERBLOCK, 0, 8),
            matcher: Matcher::Name(MAGIC),
        };
        while !pair_is_null(dir.tail) {
            self.check_cycle(&mut cycle)?;

            let (next, found, _) = self.fetch_match(dir.tail, Some(&search))?;
            dir = next;

            if let Fetched::Found(tag) = found {
                if !tag.is_delete() {
                    self.root = dir.pair;
                    let mut buf = [0u8; Superblock::SIZE];
                    self.dir_get(
                        &dir,
                        mask(0x7ff, 0x3ff, 0),
                        Tag::new(types::INLINESTRUCT, 0, Superblock::SIZE as u16),
                        &mut buf,
                    )?;
                    let superblock = Superblock::from_bytes(&buf)?;
                    self.check_superblock(&superblock)?;
                }
            }

            let delta = self.dir_get_gstate(&dir)?;
            self.gstate.xor(&delta);
        }

        if pair_is_null(self.root) {
            error!("No superblock found");
            return Err(Error::Corrupt);
        }

        if !self.gstate.is_zero() {
            debug!(
                "Found pending gstate {:#010x}{:08x}{:08x}",
                self.gstate.tag, self.gstate.pair[0], self.gstate.pair[1]
            );
        }
        // only the orphan flag is stored, assume at least one
        self.gstate.tag = self
            .gstate
            .tag
            .wrapping_add(!Tag(self.gstate.tag).is_valid() as u32);
        self.gdisk = self.gstate;

        self.free.off = self.seed % self.bd.geo.block_count;
        self.free.drop_window();

        self.force_consistency()
    }

    fn check_superblock(&mut self, superblock: &Superblock) -> Result<()> {
        let geo = &mut self.bd.geo;
        if superblock.major() != (DISK_VERSION >> 16) as u16
            || superblock.minor() > (DISK_VERSION & 0xffff) as u16
        {
            error!(
                "Invalid version v{}.{}",
                superblock.major(),
                superblock.minor()
            );
            return Err(Error::InvalidArgument);
        }

        if superblock.block_size != geo.block_size || superblock.block_count != geo.block_count {
            error!(
                "Invalid block geometry {}x{} (expected {}x{})",
                superblock.block_count, superblock.block_size, geo.block_count, geo.block_size
            );
            return Err(Error::InvalidArgument);
        }

        if superblock.name_max != 0 {
            if superblock.name_max > geo.name_max {
                error!("Unsupported name_max ({} > {})", superblock.name_max, geo.name_max);
                return Err(Error::InvalidArgument);
            }
            geo.name_max = superblock.name_max;
        }

        if superblock.file_max != 0 {
            if superblock.file_max > geo.file_max {
                error!("Unsupported file_max ({} > {})", superblock.file_max, geo.file_max);
                return Err(Error::InvalidArgument);
            }
            geo.file_max = superblock.file_max;
        }

        if superblock.attr_max != 0 {
            if superblock.attr_max > geo.attr_max {
                error!("Unsupported attr_max ({} > {})", superblock.attr_max, geo.attr_max);
                return Err(Error::InvalidArgument);
            }
            geo.attr_max = superblock.attr_max;
            geo.inline_max = geo.inline_max.min(geo.attr_max);
        }
        Ok(())
    }

    /// Call `cb` on every block in use: metadata pairs, file lists, and
    /// the in-flight blocks of open files. With `include_orphans` the
    /// pairs named by directory entries are reported too, which covers
    /// pairs not yet threaded into the list.
    pub fn traverse_blocks(
        &mut self,
        include_orphans: bool,
        cb: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        let mut dir = MDir::walk_start();
        let mut cycle = 0;
        while !pair_is_null(dir.tail) {
            self.check_cycle(&mut cycle)?;

            cb(dir.tail[0])?;
            cb(dir.tail[1])?;

            dir = self.fetch(dir.tail)?;
            for id in 0..dir.count {
                let mut buf = [0u8; CtzStruct::SIZE];
                let tag = match self.dir_get(
                    &dir,
                    mask(0x700, 0x3ff, 0),
                    Tag::new(types::STRUCT, id, CtzStruct::SIZE as u16),
                    &mut buf,
                ) {
                    Ok(tag) => tag,
                    Err(Error::NotFound) => continue,
                    Err(e) => return Err(e),
                };

                let ctz = CtzStruct::from_bytes(&buf);
                match tag.type3() {
                    types::CTZSTRUCT => self.bd.ctz_traverse(None, ctz.head, ctz.size, cb)?,
                    types::DIRSTRUCT if include_orphans => {
                        let pair = pair_from_bytes(&buf);
                        cb(pair[0])?;
                        cb(pair[1])?;
                    }
                    _ => {}
                }
            }
        }

        let Engine { bd, handles, .. } = self;
        for handle in handles.iter().flatten() {
            let HandleKind::File(file) = &handle.kind else {
                continue;
            };
            if file.status.contains(FileStatus::INLINE) {
                continue;
            }
            // an outlined file keeps an inline head until its next flush
            if file.status.contains(FileStatus::DIRTY) && file.ctz.head != BLOCK_INLINE {
                bd.ctz_traverse(Some(&file.cache), file.ctz.head, file.ctz.size, cb)?;
            }
            if file.status.contains(FileStatus::WRITING) {
                bd.ctz_traverse(Some(&file.cache), file.block, file.pos, cb)?;
            }
        }
        Ok(())
    }

    /// Number of blocks in use
    pub fn fs_size(&mut self) -> Result<u32> {
        let mut size = 0;
        self.traverse_blocks(false, &mut |_| {
            size += 1;
            Ok(())
        })?;
        Ok(size)
    }

    /// The pair holding the directory entry that points at `pair`
    pub fn fs_parent(&mut self, pair: Pair) -> Result<Option<(Tag, MDir)>> {
        let search = Search {
            mask: mask(0x7ff, 0, 0x3ff),
            tag: Tag::new(types::DIRSTRUCT, 0, 8),
            matcher: Matcher::Pair(pair),
        };
        let mut tail = SUPERBLOCK_PAIR;
        let mut cycle = 0;
        while !pair_is_null(tail) {
            self.check_cycle(&mut cycle)?;

            let (parent, found, _) = self.fetch_match(tail, Some(&search))?;
            if let Fetched::Found(tag) = found {
                return Ok(Some((tag, parent)));
            }
            tail = parent.tail;
        }
        Ok(None)
    }

    /// The pair whose tail is `pair`
    pub fn fs_pred(&mut self, pair: Pair) -> Result<Option<MDir>> {
        // nothing precedes the superblock
        if pair_cmp(pair, SUPERBLOCK_PAIR) {
            return Ok(None);
        }

        let mut pdir = MDir::walk_start();
        let mut cycle = 0;
        while !pair_is_null(pdir.tail) {
            self.check_cycle(&mut cycle)?;
            if pair_cmp(pdir.tail, pair) {
                return Ok(Some(pdir));
            }
            pdir = self.fetch(pdir.tail)?;
        }
        Ok(None)
    }

    /// A pair moved from `oldpair` to `newpair`: update the root, open
    /// handles, the parent's entry and the predecessor's tail
    pub fn fs_relocate(&mut self, oldpair: Pair, newpair: Pair) -> Result<()> {
        if pair_cmp(oldpair, self.root) {
            debug!("Relocating root {{{:#x}, {:#x}}}", newpair[0], newpair[1]);
            self.root = newpair;
        }

        for handle in self.handles.iter_mut().flatten() {
            if pair_cmp(oldpair, handle.m.pair) {
                handle.m.pair = newpair;
            }
            if let HandleKind::Dir(state) = &mut handle.kind {
                if pair_cmp(oldpair, state.head) {
                    state.head = newpair;
                }
            }
        }

        let bytes = pair_to_bytes(newpair);

        if let Some((mut tag, mut parent)) = self.fs_parent(newpair)? {
            // the parent and the thread disagree until both are fixed
            self.gstate.prep_orphans(1);

            // a pending move in the parent must land in the same commit,
            // the relocation may have outdated it
            let moveid = self.take_move_in(parent.pair);
            if moveid != ID_NONE && moveid < tag.id() {
                tag = tag.shift_id(-1);
            }

            let mut attrs = Vec::with_capacity(2);
            if moveid != ID_NONE {
                attrs.push(Attr::new(Tag::new(types::DELETE, moveid, 0)));
            }
            attrs.push(Attr::bytes(tag, &bytes));
            self.dir_commit(&mut parent, &attrs, None)?;

            self.gstate.prep_orphans(-1);
        }

        if let Some(mut pred) = self.fs_pred(oldpair)? {
            let moveid = self.take_move_in(pred.pair);

            let mut attrs = Vec::with_capacity(2);
            if moveid != ID_NONE {
                attrs.push(Attr::new(Tag::new(types::DELETE, moveid, 0)));
            }
            attrs.push(Attr::bytes(
                Tag::new(types::TAIL + pred.split as u16, ID_NONE, 8),
                &bytes,
            ));
            self.dir_commit(&mut pred, &attrs, None)?;
        }
        Ok(())
    }

    /// Clear a pending move out of `pair`, returning its id
    fn take_move_in(&mut self, pair: Pair) -> u16 {
        if !self.gstate.has_move_here(pair) {
            return ID_NONE;
        }
        let moveid = self.gstate.move_id();
        debug!(
            "Fixing move while relocating {{{:#x}, {:#x}}} {:#x}",
            pair[0], pair[1], moveid
        );
        self.gstate.prep_move(ID_NONE, PAIR_NULL);
        moveid
    }

    /// Finish a rename that lost power between its two commits
    fn demove(&mut self) -> Result<()> {
        if !self.gdisk.has_move() {
            return Ok(());
        }

        debug!(
            "Fixing move {{{:#x}, {:#x}}} {:#x}",
            self.gdisk.pair[0],
            self.gdisk.pair[1],
            self.gdisk.move_id()
        );

        let mut movedir = self.fetch(self.gdisk.pair)?;
        let moveid = self.gdisk.move_id();
        self.gstate.prep_move(ID_NONE, PAIR_NULL);
        self.dir_commit(
            &mut movedir,
            &[Attr::new(Tag::new(types::DELETE, moveid, 0))],
            None,
        )
    }

    /// Unlink pairs no directory entry points at, and re-thread pairs
    /// whose parent was updated after a relocation but whose predecessor
    /// was not
    fn deorphan(&mut self) -> Result<()> {
        if !self.gstate.has_orphans() {
            return Ok(());
        }

        let mut pdir = MDir {
            split: true,
            ..MDir::walk_start()
        };
        let mut cycle = 0;
        while !pair_is_null(pdir.tail) {
            let dir = self.fetch(pdir.tail)?;

            // only the head pair of a directory has a parent
            if !pdir.split {
                match self.fs_parent(pdir.tail)? {
                    None => {
                        debug!("Fixing orphan {{{:#x}, {:#x}}}", pdir.tail[0], pdir.tail[1]);
                        self.dir_drop(&mut pdir, &dir)?;
                        continue;
                    }
                    Some((tag, parent)) => {
                        let mut buf = [0u8; 8];
                        self.dir_get(&parent, mask(0x7ff, 0x3ff, 0), tag, &mut buf)?;
                        let pair = pair_from_bytes(&buf);
                        if !pair_sync(pair, pdir.tail) {
                            debug!(
                                "Fixing half-orphan {{{:#x}, {:#x}}} -> {{{:#x}, {:#x}}}",
                                pdir.tail[0], pdir.tail[1], pair[0], pair[1]
                            );
                            self.dir_commit(
                                &mut pdir,
                                &[Attr::bytes(Tag::new(types::SOFTTAIL, ID_NONE, 8), &buf)],
                                None,
                            )?;
                            continue;
                        }
                    }
                }
            }

            self.check_cycle(&mut cycle)?;
            pdir = dir;
        }

        let orphans = self.gstate.orphans();
        self.gstate.prep_orphans(-(orphans as i8));
        Ok(())
    }

    /// Resolve anything a power loss left half done
    pub fn force_consistency(&mut self) -> Result<()> {
        self.demove()?;
        self.deorphan()
    }

    /// Compact pairs that have grown past `compact_thresh` and refill the
    /// lookahead window
    pub fn gc(&mut self) -> Result<()> {
        self.force_consistency()?;

        let geo = self.bd.geo;
        if geo.compact_thresh < geo.block_size - geo.prog_size {
            let mut mdir = MDir::walk_start();
            let mut cycle = 0;
            while !pair_is_null(mdir.tail) {
                self.check_cycle(&mut cycle)?;
                mdir = self.fetch(mdir.tail)?;

                if !mdir.erased || mdir.off > geo.compact_thresh {
                    debug!(
                        "Compacting {{{:#x}, {:#x}}} at {} bytes",
                        mdir.pair[0], mdir.pair[1], mdir.off
                    );
                    mdir.erased = false;
                    self.dir_commit(&mut mdir, &[], None)?;
                }
            }
        }

        if self.free.i > 0 || self.free.size < self.free.capacity().min(geo.block_count) {
            self.free.ack();
            self.scan_free()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::RamBlockDevice;
    use crate::config::Config;
    use crate::crc::Crc32;

    fn engine(dev: &RamBlockDevice) -> Engine<RamBlockDevice> {
        let geo = Geometry::derive(dev, &Config::default()).unwrap();
        Engine::new(dev.clone(), geo, Box::new(Crc32))
    }

    #[test]
    fn test_format_then_mount() {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        engine(&dev).format().unwrap();

        let mut fs = engine(&dev);
        fs.mount().unwrap();
        assert!(pair_sync(fs.root, SUPERBLOCK_PAIR));
        assert!(fs.gstate.is_zero());
        // only the superblock pair is in use
        assert_eq!(fs.fs_size().unwrap(), 2);
    }

    #[test]
    fn test_mount_blank_device_fails() {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        assert!(matches!(engine(&dev).mount(), Err(Error::Corrupt)));
    }

    #[test]
    fn test_mount_rejects_other_geometry() {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        engine(&dev).format().unwrap();

        let geo = Geometry::derive(
            &dev,
            &Config {
                block_size: 1024,
                ..Config::default()
            },
        )
        .unwrap();
        let mut fs = Engine::new(dev.clone(), geo, Box::new(Crc32));
        assert!(fs.mount().is_err());
    }

    #[test]
    fn test_pins_follow_commits() {
        let dev = RamBlockDevice::new(1, 1, 512, 64);
        engine(&dev).format().unwrap();
        let mut fs = engine(&dev);
        fs.mount().unwrap();

        let mut root = fs.fetch(fs.root).unwrap();
        let pin = fs.pin(root, 1);
        fs.dir_commit(
            &mut root,
            &[
                Attr::new(Tag::new(types::CREATE, 1, 0)),
                Attr::bytes(Tag::new(types::REG, 1, 1), b"a"),
                Attr::bytes(Tag::new(types::INLINESTRUCT, 1, 0), &[]),
            ],
            None,
        )
        .unwrap();

        // an insert at our id pushes us along
        let pinned = fs.unpin(pin).unwrap();
        assert_eq!(pinned.id, 2);
        assert_eq!(pinned.m, root);
        assert_eq!(root.count, 2);
    }
}
