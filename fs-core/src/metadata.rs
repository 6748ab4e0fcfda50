//! Metadata pairs
//!
//! A directory lives in one or more pairs of blocks. Each block is an
//! append-only log of tagged records; the block with the newer revision is
//! active and the other is the spare that compaction rewrites. Every
//! commit ends in a CRC record, so a commit torn by power loss is simply
//! not seen on the next fetch.

use std::cmp::Ordering;

use log::{debug, error, trace, warn};

use crate::blockdev::BlockDevice;
use crate::engine::{Engine, HandleKind};
use crate::error::{Error, Result};
use crate::layout::{
    mask, pair_cmp, pair_from_bytes, pair_is_null, pair_to_bytes, scmp, types, GState, Pair, Tag,
    ID_NONE, PAIR_NULL, SUPERBLOCK_PAIR,
};

/// In-memory view of a fetched metadata pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MDir {
    /// Active block first
    pub pair: Pair,
    pub rev: u32,
    /// End of the last valid commit
    pub off: u32,
    /// Tag chain value after the last valid commit
    pub etag: u32,
    pub count: u16,
    /// The block is clean past `off` and can take an appended commit
    pub erased: bool,
    /// `tail` continues this directory rather than the next one
    pub split: bool,
    pub tail: Pair,
}

impl Default for MDir {
    fn default() -> Self {
        Self {
            pair: PAIR_NULL,
            rev: 0,
            off: 0,
            etag: 0xffff_ffff,
            count: 0,
            erased: false,
            split: false,
            tail: PAIR_NULL,
        }
    }
}

impl MDir {
    /// A placeholder whose tail points at the superblock pair, the start
    /// of every walk over the threaded list
    pub fn walk_start() -> Self {
        Self {
            tail: SUPERBLOCK_PAIR,
            ..Self::default()
        }
    }
}

/// Payload of a record queued for commit
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttrData<'a> {
    None,
    Bytes(&'a [u8]),
    /// Bytes already on disk, copied during compaction
    Disk { block: u32, off: u32 },
    /// Source directory of a `FROM_MOVE` record
    Move(MDir),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Attr<'a> {
    pub tag: Tag,
    pub data: AttrData<'a>,
}

impl<'a> Attr<'a> {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            data: AttrData::None,
        }
    }

    pub fn bytes(tag: Tag, bytes: &'a [u8]) -> Self {
        Self {
            tag,
            data: AttrData::Bytes(bytes),
        }
    }

    pub fn moved(tag: Tag, source: MDir) -> Self {
        Self {
            tag,
            data: AttrData::Move(source),
        }
    }

    fn pair(&self) -> Result<Pair> {
        match self.data {
            AttrData::Bytes(b) if b.len() >= 8 => Ok(pair_from_bytes(b)),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// How a fetch compares a candidate record against what it is looking for
pub(crate) enum Matcher<'a> {
    /// Entry name, ordered bytewise then by length
    Name(&'a [u8]),
    /// A `DIRSTRUCT` pointing at this pair
    Pair(Pair),
}

pub(crate) struct Search<'a> {
    pub mask: u32,
    pub tag: Tag,
    pub matcher: Matcher<'a>,
}

/// Outcome of a search during fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fetched {
    Found(Tag),
    /// No match, but the returned id lies inside the pair: the insertion
    /// point for a new entry
    Missing,
    NotHere,
}

/// A commit in progress
struct Commit {
    block: u32,
    off: u32,
    ptag: u32,
    crc: u32,
    begin: u32,
    end: u32,
}

/// Callback for `dir_traverse`; returning `true` stops the walk
pub(crate) type TraverseCb<'c, 'a, D> =
    dyn FnMut(&mut Engine<D>, Tag, AttrData<'a>) -> Result<bool> + 'c;

/// Record `later` comes after `tag`: is `tag` superseded, and how do
/// creates and deletes in between move its id
fn filter_redundant(tag: &mut Tag, later: Tag) -> bool {
    let m = if later.0 & mask(0x100, 0, 0) != 0 {
        mask(0x7ff, 0x3ff, 0)
    } else {
        mask(0x700, 0x3ff, 0)
    };

    if later.matches(m, *tag)
        || tag.is_delete()
        || (mask(0x7ff, 0x3ff, 0) & later.0)
            == (Tag::new(types::DELETE, 0, 0).0 | (mask(0, 0x3ff, 0) & tag.0))
    {
        return true;
    }

    if later.type1() == types::SPLICE && later.id() <= tag.id() {
        *tag = tag.shift_id(later.splice() as i32);
    }
    false
}

fn corrupt_or<T>(res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_corrupt() => Ok(None),
        Err(e) => Err(e),
    }
}

impl<D: BlockDevice> Engine<D> {
    fn match_record(&mut self, matcher: &Matcher<'_>, tag: Tag, block: u32, off: u32) -> Result<Ordering> {
        match matcher {
            Matcher::Name(name) => {
                let diff = (name.len() as u32).min(tag.size());
                let ord = self.bd.cmp(None, diff, block, off, &name[..diff as usize])?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
                Ok(tag.size().cmp(&(name.len() as u32)))
            }
            Matcher::Pair(pair) => {
                let mut buf = [0u8; 8];
                self.bd.read(Some(&self.pcache), 8, block, off, &mut buf)?;
                Ok(if pair_cmp(pair_from_bytes(&buf), *pair) {
                    Ordering::Equal
                } else {
                    Ordering::Less
                })
            }
        }
    }

    /// Fetch the pair at `pair`, optionally searching for a record on the
    /// way. Returns the directory, the search outcome and the matching (or
    /// insertion) id.
    pub(crate) fn fetch_match(
        &mut self,
        pair: Pair,
        search: Option<&Search<'_>>,
    ) -> Result<(MDir, Fetched, u16)> {
        let geo = self.bd.geo;
        if pair[0] >= geo.block_count || pair[1] >= geo.block_count {
            return Err(Error::Corrupt);
        }

        // the block with the newer revision goes first
        let mut revs = [0u32; 2];
        let mut r = 0;
        for i in 0..2 {
            let mut buf = [0u8; 4];
            if corrupt_or(self.bd.read(None, 4, pair[i], 0, &mut buf))?.is_some() {
                revs[i] = u32::from_le_bytes(buf);
                if scmp(revs[i], revs[(i + 1) % 2]) > 0 {
                    r = i;
                }
            }
        }

        let mut dir = MDir {
            pair: [pair[r % 2], pair[(r + 1) % 2]],
            rev: revs[r % 2],
            off: 0,
            ..MDir::default()
        };

        let mut besttag: u32 = 0xffff_ffff;
        for _ in 0..2 {
            let mut off = 0u32;
            let mut ptag = 0xffff_ffffu32;

            let mut tempcount = 0u16;
            let mut temptail = PAIR_NULL;
            let mut tempsplit = false;
            let mut tempbest = besttag;

            let mut crc = self.bd.crc(0xffff_ffff, &dir.rev.to_le_bytes());
            loop {
                off += Tag(ptag).dsize();
                let mut buf = [0u8; 4];
                if corrupt_or(self.bd.read(None, geo.block_size, dir.pair[0], off, &mut buf))?
                    .is_none()
                {
                    dir.erased = false;
                    break;
                }
                crc = self.bd.crc(crc, &buf);
                let tag = Tag(u32::from_be_bytes(buf) ^ ptag);

                // next commit not yet programmed, or out of range
                if !tag.is_valid() {
                    dir.erased =
                        Tag(ptag).type1() == types::CRC && dir.off % geo.prog_size == 0;
                    break;
                } else if off + tag.dsize() > geo.block_size {
                    dir.erased = false;
                    break;
                }

                ptag = tag.0;

                if tag.type1() == types::CRC {
                    let mut buf = [0u8; 4];
                    if corrupt_or(self.bd.read(None, geo.block_size, dir.pair[0], off + 4, &mut buf))?
                        .is_none()
                        || crc != u32::from_le_bytes(buf)
                    {
                        dir.erased = false;
                        break;
                    }

                    // the next tag's valid bit may be inverted
                    ptag ^= ((tag.chunk() & 1) as u32) << 31;

                    // CRCs make a cheap seed for the allocator
                    self.seed ^= crc;

                    besttag = tempbest;
                    dir.off = off + tag.dsize();
                    dir.etag = ptag;
                    dir.count = tempcount;
                    dir.tail = temptail;
                    dir.split = tempsplit;

                    crc = 0xffff_ffff;
                    continue;
                }

                match corrupt_or(self.bd.crc_range(None, dir.pair[0], off + 4, tag.dsize() - 4, crc))? {
                    Some(c) => crc = c,
                    None => {
                        dir.erased = false;
                        break;
                    }
                }

                if tag.type1() == types::NAME {
                    if tag.id() >= tempcount {
                        tempcount = tag.id() + 1;
                    }
                } else if tag.type1() == types::SPLICE {
                    tempcount = (tempcount as i32 + tag.splice() as i32) as u16;

                    if tag.0 == (Tag::new(types::DELETE, 0, 0).0 | (mask(0, 0x3ff, 0) & tempbest)) {
                        tempbest |= 0x8000_0000;
                    } else if tempbest != 0xffff_ffff && tag.id() <= Tag(tempbest).id() {
                        tempbest = Tag(tempbest).shift_id(tag.splice() as i32).0;
                    }
                } else if tag.type1() == types::TAIL {
                    tempsplit = tag.chunk() & 1 != 0;
                    let mut buf = [0u8; 8];
                    if corrupt_or(self.bd.read(None, geo.block_size, dir.pair[0], off + 4, &mut buf))?
                        .is_none()
                    {
                        dir.erased = false;
                        break;
                    }
                    temptail = pair_from_bytes(&buf);
                }

                if let Some(search) = search {
                    if tag.matches(search.mask, search.tag) {
                        let res = match corrupt_or(self.match_record(
                            &search.matcher,
                            tag,
                            dir.pair[0],
                            off + 4,
                        ))? {
                            Some(res) => res,
                            None => {
                                dir.erased = false;
                                break;
                            }
                        };

                        if res == Ordering::Equal {
                            tempbest = tag.0;
                        } else if mask(0x7ff, 0x3ff, 0) & tag.0 == mask(0x7ff, 0x3ff, 0) & tempbest {
                            // same record with other contents: our best
                            // match has been overwritten
                            tempbest = 0xffff_ffff;
                        } else if res == Ordering::Greater && tag.id() <= Tag(tempbest).id() {
                            // keep the first greater entry as insertion point
                            tempbest = tag.0 | 0x8000_0000;
                        }
                    }
                }
            }

            if dir.off > 0 {
                // hide the source of a pending move
                if self.gdisk.has_move_here(dir.pair) {
                    if self.gdisk.move_id() == Tag(besttag).id() {
                        besttag |= 0x8000_0000;
                    } else if besttag != 0xffff_ffff && self.gdisk.move_id() < Tag(besttag).id() {
                        besttag = Tag(besttag).shift_id(-1).0;
                    }
                }

                let best = Tag(besttag);
                let id = best.id().min(dir.count);
                let fetched = if best.is_valid() {
                    Fetched::Found(best)
                } else if best.id() < dir.count {
                    Fetched::Missing
                } else {
                    Fetched::NotHere
                };
                return Ok((dir, fetched, id));
            }

            // nothing valid here, try the other block
            dir.pair.swap(0, 1);
            dir.rev = revs[(r + 1) % 2];
        }

        error!(
            "Corrupted dir pair at {{{:#x}, {:#x}}}",
            dir.pair[0], dir.pair[1]
        );
        Err(Error::Corrupt)
    }

    pub(crate) fn fetch(&mut self, pair: Pair) -> Result<MDir> {
        let (dir, _, _) = self.fetch_match(pair, None)?;
        Ok(dir)
    }

    /// Newest record matching `gtag` under `gmask`, following id shifts.
    ///
    /// Copies up to `buf.len()` bytes of its payload starting at `goff`
    /// and zero-fills the rest. `NotFound` if the record is missing or
    /// deleted.
    pub(crate) fn dir_get_slice(
        &mut self,
        dir: &MDir,
        gmask: u32,
        gtag: Tag,
        goff: u32,
        buf: &mut [u8],
    ) -> Result<Tag> {
        let mut off = dir.off;
        let mut ntag = dir.etag;
        let mut gdiff: i32 = 0;

        let gmask_id = Tag(gmask).id();
        if self.gdisk.has_move_here(dir.pair) && gmask_id != 0 && self.gdisk.move_id() <= gtag.id() {
            // synthetic moves
            gdiff -= 1;
        }

        // walk backwards, the newest record wins
        while off >= 4 + Tag(ntag).dsize() {
            off -= Tag(ntag).dsize();
            let tag = Tag(ntag & 0x7fff_ffff);
            let mut word = [0u8; 4];
            self.bd.read(None, 4, dir.pair[0], off, &mut word)?;
            ntag = (u32::from_be_bytes(word) ^ tag.0) & 0x7fff_ffff;

            let target = gtag.shift_id(-gdiff);
            if gmask_id != 0 && tag.type1() == types::SPLICE && tag.id() <= target.id() {
                if tag.0 == (Tag::new(types::CREATE, 0, 0).0 | (mask(0, 0x3ff, 0) & target.0)) {
                    // found where we were created
                    return Err(Error::NotFound);
                }
                gdiff += tag.splice() as i32;
            }

            if tag.matches(gmask, gtag.shift_id(-gdiff)) {
                if tag.is_delete() {
                    return Err(Error::NotFound);
                }

                let diff = (tag.size() as usize).min(buf.len());
                self.bd.read(None, diff as u32, dir.pair[0], off + 4 + goff, &mut buf[..diff])?;
                buf[diff..].fill(0);
                return Ok(tag.shift_id(gdiff));
            }
        }
        Err(Error::NotFound)
    }

    pub(crate) fn dir_get(&mut self, dir: &MDir, gmask: u32, gtag: Tag, buf: &mut [u8]) -> Result<Tag> {
        self.dir_get_slice(dir, gmask, gtag, 0, buf)
    }

    /// This pair's share of the global state
    pub(crate) fn dir_get_gstate(&mut self, dir: &MDir) -> Result<GState> {
        let mut buf = [0u8; GState::SIZE];
        match self.dir_get(
            dir,
            mask(0x7ff, 0, 0),
            Tag::new(types::MOVESTATE, 0, GState::SIZE as u16),
            &mut buf,
        ) {
            Ok(_) => Ok(GState::from_bytes(&buf)),
            Err(Error::NotFound) => Ok(GState::default()),
            Err(e) => Err(e),
        }
    }

    /// Walk the records of `dir` from `off`, then `attrs`, calling `cb` on
    /// each one that passes `tmask`/`ttag`.
    ///
    /// With an id in `tmask` only the newest record per (type, id) in
    /// `begin..end` survives, renumbered by `diff`, and `FROM_MOVE`
    /// records expand to the struct records of their source.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dir_traverse<'a>(
        &mut self,
        dir: &MDir,
        mut off: u32,
        mut ptag: u32,
        attrs: &[Attr<'a>],
        tmask: u32,
        ttag: Tag,
        begin: u16,
        end: u16,
        diff: i32,
        cb: &mut TraverseCb<'_, 'a, D>,
    ) -> Result<bool> {
        let mut attrs = attrs;
        loop {
            let (mut tag, data) = if off + Tag(ptag).dsize() < dir.off {
                off += Tag(ptag).dsize();
                let mut word = [0u8; 4];
                self.bd.read(None, 4, dir.pair[0], off, &mut word)?;
                ptag = u32::from_be_bytes(word) ^ ptag;
                (
                    Tag(ptag & 0x7fff_ffff),
                    AttrData::Disk {
                        block: dir.pair[0],
                        off: off + 4,
                    },
                )
            } else if let Some((first, rest)) = attrs.split_first() {
                attrs = rest;
                (first.tag, first.data)
            } else {
                return Ok(false);
            };

            let m = mask(0x7ff, 0, 0);
            if (m & tmask & tag.0) != (m & tmask & ttag.0) {
                continue;
            }

            if Tag(tmask).id() != 0 {
                // drop superseded records and follow id shifts
                let mut current = tag;
                let redundant = self.dir_traverse(
                    dir,
                    off,
                    ptag,
                    attrs,
                    0,
                    Tag(0),
                    0,
                    0,
                    0,
                    &mut |_, later, _| Ok(filter_redundant(&mut current, later)),
                )?;
                if redundant {
                    continue;
                }
                tag = current;

                if !(tag.id() >= begin && tag.id() < end) {
                    continue;
                }
            }

            match tag.type3() {
                types::NOOP => {}
                types::FROM_MOVE => {
                    let AttrData::Move(source) = data else {
                        return Err(Error::InvalidArgument);
                    };
                    let from = tag.size() as u16;
                    let to = tag.id();
                    if self.dir_traverse(
                        &source,
                        0,
                        0xffff_ffff,
                        &[],
                        mask(0x600, 0x3ff, 0),
                        Tag::new(types::STRUCT, 0, 0),
                        from,
                        from + 1,
                        to as i32 - from as i32 + diff,
                        cb,
                    )? {
                        return Ok(true);
                    }
                }
                _ => {
                    if cb(self, tag.shift_id(diff), data)? {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn commit_prog(&mut self, commit: &mut Commit, data: &[u8]) -> Result<()> {
        self.bd.prog(&mut self.pcache, false, commit.block, commit.off, data)?;
        commit.crc = self.bd.crc(commit.crc, data);
        commit.off += data.len() as u32;
        Ok(())
    }

    fn commit_attr(&mut self, commit: &mut Commit, tag: Tag, data: AttrData<'_>) -> Result<()> {
        let dsize = tag.dsize();
        if commit.off + dsize > commit.end {
            return Err(Error::NoSpace);
        }

        let ntag = ((tag.0 & 0x7fff_ffff) ^ commit.ptag).to_be_bytes();
        self.commit_prog(commit, &ntag)?;

        let len = dsize - 4;
        match data {
            AttrData::Bytes(bytes) => {
                let bytes = bytes.get(..len as usize).ok_or(Error::InvalidArgument)?;
                self.commit_prog(commit, bytes)?;
            }
            AttrData::Disk { block, off } => {
                let mut chunk = [0u8; 32];
                let mut i = 0;
                while i < len {
                    let n = (len - i).min(chunk.len() as u32);
                    self.bd
                        .read(Some(&self.pcache), len - i, block, off + i, &mut chunk[..n as usize])?;
                    self.commit_prog(commit, &chunk[..n as usize])?;
                    i += n;
                }
            }
            AttrData::None | AttrData::Move(_) => {
                if len != 0 {
                    return Err(Error::InvalidArgument);
                }
            }
        }

        commit.ptag = tag.0 & 0x7fff_ffff;
        Ok(())
    }

    /// Seal a commit with CRC records up to the next program boundary,
    /// then read it back and check every CRC
    fn commit_crc(&mut self, commit: &mut Commit) -> Result<()> {
        let geo = self.bd.geo;
        let off1 = commit.off;
        let crc1 = commit.crc;
        let align_up = |a: u32| (a + geo.prog_size - 1) / geo.prog_size * geo.prog_size;
        let end = align_up(off1 + 8);

        // padding is not covered by any CRC, so fetch can skip it
        while commit.off < end {
            let off = commit.off + 4;
            let mut noff = (end - off).min(0x3fe) + off;
            if noff < end {
                noff = noff.min(end - 8);
            }

            // the erased state of the next unit decides the valid bit
            let mut word = [0xffu8; 4];
            if corrupt_or(self.bd.read(None, 4, commit.block, noff, &mut word))?.is_none() {
                word = [0xff; 4];
            }
            let reset = (!u32::from_be_bytes(word)) >> 31;
            let tag = Tag::new(types::CRC + reset as u16, ID_NONE, (noff - off) as u16);

            let mut footer = [0u8; 8];
            footer[..4].copy_from_slice(&(tag.0 ^ commit.ptag).to_be_bytes());
            commit.crc = self.bd.crc(commit.crc, &footer[..4]);
            footer[4..].copy_from_slice(&commit.crc.to_le_bytes());
            self.bd.prog(&mut self.pcache, false, commit.block, commit.off, &footer)?;

            commit.off += 4 + tag.size();
            commit.ptag = tag.0 ^ (reset << 31);
            commit.crc = 0xffff_ffff;
        }

        self.bd.sync(&mut self.pcache, false)?;

        // read back each CRC'd range
        let mut off = commit.begin;
        let mut noff = off1 + 4;
        while off < end {
            let mut crc = 0xffff_ffff;
            if off <= off1 && off1 < noff {
                crc = self.bd.crc_range(None, commit.block, off, off1 - off, crc)?;
                if crc != crc1 {
                    return Err(Error::Corrupt);
                }
                crc = self.bd.crc_range(None, commit.block, off1, noff - off1, crc)?;
            } else {
                crc = self.bd.crc_range(None, commit.block, off, noff - off, crc)?;
            }

            let mut word = [0u8; 4];
            self.bd.read(None, 4, commit.block, noff, &mut word)?;
            if crc != u32::from_le_bytes(word) {
                return Err(Error::Corrupt);
            }

            // skip padding
            off = (end - noff).min(0x3fe) + noff;
            if off < end {
                off = off.min(end - 8);
            }
            noff = off + 4;
        }

        trace!(
            "commit: block {} {}..{} crc {:#010x}",
            commit.block,
            commit.begin,
            commit.off,
            crc1
        );
        Ok(())
    }

    /// Prepare a fresh, unwritten pair
    pub(crate) fn dir_alloc(&mut self) -> Result<MDir> {
        let mut dir = MDir::default();
        // backwards, so block 1 is written first
        dir.pair[1] = self.alloc()?;
        dir.pair[0] = self.alloc()?;

        // keep whatever revision the old block had, so we don't regress
        let mut buf = [0u8; 4];
        if corrupt_or(self.bd.read(None, 4, dir.pair[0], 0, &mut buf))?.is_some() {
            dir.rev = u32::from_le_bytes(buf);
        }

        // start on a multiple of the relocation period so a new pair is
        // not evicted straight away
        let cycles = self.bd.geo.block_cycles;
        if cycles > 0 {
            let period = (cycles as u32 + 1) | 1;
            dir.rev = dir.rev.wrapping_add(period - 1) / period * period;
        }

        dir.off = 4;
        dir.etag = 0xffff_ffff;
        Ok(dir)
    }

    /// Unlink `tail` from the list after `dir`, taking over its gstate
    pub(crate) fn dir_drop(&mut self, dir: &mut MDir, tail: &MDir) -> Result<()> {
        let delta = self.dir_get_gstate(tail)?;
        self.gdelta.xor(&delta);

        let bytes = pair_to_bytes(tail.tail);
        self.dir_commit(
            dir,
            &[Attr::bytes(
                Tag::new(types::TAIL + tail.split as u16, ID_NONE, 8),
                &bytes,
            )],
            None,
        )
    }

    fn dir_split(
        &mut self,
        dir: &mut MDir,
        attrs: &[Attr<'_>],
        source: &MDir,
        split: u16,
        end: u16,
    ) -> Result<()> {
        self.free.ack();
        let mut tail = self.dir_alloc()?;
        tail.split = dir.split;
        tail.tail = dir.tail;

        self.dir_compact(&mut tail, attrs, source, split, end)?;

        dir.tail = tail.pair;
        dir.split = true;

        if pair_cmp(dir.pair, self.root) && split == 0 {
            self.root = tail.pair;
        }
        Ok(())
    }

    /// Rewrite entries `begin..end` of `source` plus `attrs` into the spare
    /// block of `dir`, splitting off a new pair when they do not fit
    fn dir_compact(
        &mut self,
        dir: &mut MDir,
        attrs: &[Attr<'_>],
        source: &MDir,
        begin: u16,
        mut end: u16,
    ) -> Result<()> {
        let geo = self.bd.geo;
        let oldpair = dir.pair;
        let mut relocated = false;
        let mut tired = false;

        while end - begin > 1 {
            let mut size = 0u32;
            self.dir_traverse(
                source,
                0,
                0xffff_ffff,
                attrs,
                mask(0x400, 0x3ff, 0),
                Tag::new(types::NAME, 0, 0),
                begin,
                end,
                -(begin as i32),
                &mut |_, tag, _| {
                    size += tag.dsize();
                    Ok(false)
                },
            )?;

            // leave room for tail, gstate, CRCs and a cleanup delete, and
            // cap at half a block so appends have space to land
            let half = (geo.block_size / 2 + geo.prog_size - 1) / geo.prog_size * geo.prog_size;
            if end - begin < 0xff && size <= (geo.block_size - 36).min(half) {
                break;
            }

            let split = (end - begin) / 2;
            match self.dir_split(dir, attrs, source, begin + split, end) {
                Ok(()) => end = begin + split,
                // too big to split, try to overcompact
                Err(Error::NoSpace) if size <= geo.block_size - 36 => break,
                Err(e) => return Err(e),
            }
        }

        dir.rev = dir.rev.wrapping_add(1);
        let mut relocate = false;
        // (block_cycles + 1) | 1 keeps the period odd, so both blocks of
        // the pair take turns being evicted
        if geo.block_cycles > 0 && dir.rev % ((geo.block_cycles as u32 + 1) | 1) == 0 {
            if pair_cmp(dir.pair, SUPERBLOCK_PAIR) {
                // the superblock can't move, grow the tree below it instead
                let used = self.fs_size()?;
                if used < geo.block_count / 2 {
                    debug!("Expanding superblock at rev {}", dir.rev);
                    match self.dir_split(dir, attrs, source, begin, end) {
                        Ok(()) => end = begin,
                        Err(Error::NoSpace) => {}
                        Err(e) => return Err(e),
                    }
                }
            } else {
                tired = true;
                relocate = true;
            }
        }

        loop {
            if relocate {
                relocated = true;
                self.pcache.zero();
                if !tired {
                    debug!("Bad block at {:#x}", dir.pair[1]);
                }

                if pair_cmp(dir.pair, SUPERBLOCK_PAIR) {
                    warn!("Superblock {:#x} has become unwritable", dir.pair[1]);
                    return Err(Error::NoSpace);
                }

                match self.alloc() {
                    Ok(block) => dir.pair[1] = block,
                    // worn but still good, keep using it
                    Err(Error::NoSpace) if tired => {}
                    Err(e) => return Err(e),
                }
                tired = false;
            }

            match self.compact_into(dir, attrs, source, begin, end, relocated) {
                Ok(()) => break,
                Err(e) if e.is_corrupt() => relocate = true,
                Err(e) => return Err(e),
            }
        }

        if relocated {
            debug!(
                "Relocating {{{:#x}, {:#x}}} -> {{{:#x}, {:#x}}}",
                oldpair[0], oldpair[1], dir.pair[0], dir.pair[1]
            );
            self.fs_relocate(oldpair, dir.pair)?;
        }
        Ok(())
    }

    fn compact_into(
        &mut self,
        dir: &mut MDir,
        attrs: &[Attr<'_>],
        source: &MDir,
        begin: u16,
        end: u16,
        relocated: bool,
    ) -> Result<()> {
        let mut commit = Commit {
            block: dir.pair[1],
            off: 0,
            ptag: 0xffff_ffff,
            crc: 0xffff_ffff,
            begin: 0,
            end: self.bd.geo.metadata_max(),
        };

        self.bd.erase(dir.pair[1])?;
        self.commit_prog(&mut commit, &dir.rev.to_le_bytes())?;

        self.dir_traverse(
            source,
            0,
            0xffff_ffff,
            attrs,
            mask(0x400, 0x3ff, 0),
            Tag::new(types::NAME, 0, 0),
            begin,
            end,
            -(begin as i32),
            &mut |eng, tag, data| {
                eng.commit_attr(&mut commit, tag, data)?;
                Ok(false)
            },
        )?;

        // the tail may be new since the size check
        if !pair_is_null(dir.tail) {
            let bytes = pair_to_bytes(dir.tail);
            self.commit_attr(
                &mut commit,
                Tag::new(types::TAIL + dir.split as u16, ID_NONE, 8),
                AttrData::Bytes(&bytes),
            )?;
        }

        let mut delta = GState::default();
        if !relocated {
            delta.xor(&self.gdisk);
            delta.xor(&self.gstate);
        }
        delta.xor(&self.gdelta);
        delta.tag &= !mask(0, 0, 0x3ff);
        let own = self.dir_get_gstate(dir)?;
        delta.xor(&own);
        if !delta.is_zero() {
            let bytes = delta.to_bytes();
            self.commit_attr(
                &mut commit,
                Tag::new(types::MOVESTATE, ID_NONE, GState::SIZE as u16),
                AttrData::Bytes(&bytes),
            )?;
        }

        self.commit_crc(&mut commit)?;

        dir.pair.swap(0, 1);
        dir.count = end - begin;
        dir.off = commit.off;
        dir.etag = commit.ptag;
        dir.erased = true;
        self.gdelta = GState::default();
        if !relocated {
            self.gdisk = self.gstate;
        }
        Ok(())
    }

    /// Append `attrs` to the active block
    fn dir_append(&mut self, dir: &mut MDir, attrs: &[Attr<'_>]) -> Result<()> {
        let mut commit = Commit {
            block: dir.pair[0],
            off: dir.off,
            ptag: dir.etag,
            crc: 0xffff_ffff,
            begin: dir.off,
            end: self.bd.geo.metadata_max(),
        };

        let snapshot = *dir;
        self.dir_traverse(
            &snapshot,
            dir.off,
            dir.etag,
            attrs,
            0,
            Tag(0),
            0,
            0,
            0,
            &mut |eng, tag, data| {
                eng.commit_attr(&mut commit, tag, data)?;
                Ok(false)
            },
        )?;

        let mut delta = self.gstate;
        delta.xor(&self.gdisk);
        delta.xor(&self.gdelta);
        delta.tag &= !mask(0, 0, 0x3ff);
        if !delta.is_zero() {
            let own = self.dir_get_gstate(dir)?;
            delta.xor(&own);
            let bytes = delta.to_bytes();
            self.commit_attr(
                &mut commit,
                Tag::new(types::MOVESTATE, ID_NONE, GState::SIZE as u16),
                AttrData::Bytes(&bytes),
            )?;
        }

        self.commit_crc(&mut commit)?;

        dir.off = commit.off;
        dir.etag = commit.ptag;
        self.gdisk = self.gstate;
        self.gdelta = GState::default();
        Ok(())
    }

    /// Commit `attrs` to `dir`, compacting, splitting or relocating as
    /// needed, then bring every open handle on that pair up to date.
    ///
    /// `owner` is the handle slot `dir` was copied from, if any. Its id is
    /// left alone but it still follows the entry into a split-off tail.
    pub(crate) fn dir_commit(
        &mut self,
        dir: &mut MDir,
        attrs: &[Attr<'_>],
        owner: Option<usize>,
    ) -> Result<()> {
        let olddir = *dir;
        if let Err(e) = self.dir_commit_inner(dir, attrs) {
            *dir = olddir;
            return Err(e);
        }
        self.fixup_handles(dir, &olddir, attrs, owner)
    }

    fn dir_commit_inner(&mut self, dir: &mut MDir, attrs: &[Attr<'_>]) -> Result<()> {
        let mut hasdelete = false;
        for attr in attrs {
            match attr.tag.type3() {
                types::CREATE => dir.count += 1,
                types::DELETE => {
                    dir.count = dir.count.checked_sub(1).ok_or(Error::Corrupt)?;
                    hasdelete = true;
                }
                _ if attr.tag.type1() == types::TAIL => {
                    dir.tail = attr.pair()?;
                    dir.split = attr.tag.chunk() & 1 != 0;
                }
                _ => {}
            }
        }

        // an emptied continuation block can leave the chain
        if hasdelete && dir.count == 0 {
            if let Some(mut pdir) = self.fs_pred(dir.pair)? {
                if pdir.split {
                    self.dir_drop(&mut pdir, dir)?;
                }
            }
        }

        if dir.erased && dir.count < 0xff {
            match self.dir_append(dir, attrs) {
                Ok(()) => return Ok(()),
                Err(Error::NoSpace) | Err(Error::Corrupt) => {}
                Err(e) => return Err(e),
            }
        }

        // fall back to compaction
        self.pcache.zero();
        let source = *dir;
        self.dir_compact(dir, attrs, &source, 0, dir.count)
    }

    fn fixup_handles(
        &mut self,
        dir: &MDir,
        olddir: &MDir,
        attrs: &[Attr<'_>],
        owner: Option<usize>,
    ) -> Result<()> {
        for slot in 0..self.handles.len() {
            let Some(handle) = self.handles[slot].as_mut() else {
                continue;
            };
            if !pair_cmp(handle.m.pair, olddir.pair) {
                continue;
            }

            handle.m = *dir;
            // the owner's id already accounts for its own attrs
            let attrs = if owner == Some(slot) { &[][..] } else { attrs };
            for attr in attrs {
                let id = attr.tag.id();
                match attr.tag.type3() {
                    types::DELETE if handle.id == id => handle.m.pair = PAIR_NULL,
                    types::DELETE if handle.id > id => {
                        handle.id -= 1;
                        if let HandleKind::Dir(state) = &mut handle.kind {
                            state.pos = state.pos.saturating_sub(1);
                        }
                    }
                    types::CREATE if handle.id >= id => {
                        handle.id += 1;
                        if let HandleKind::Dir(state) = &mut handle.kind {
                            state.pos += 1;
                        }
                    }
                    _ => {}
                }
            }

            // the id may have moved to a split-off tail
            loop {
                let (id, m) = match &self.handles[slot] {
                    Some(handle) => (handle.id, handle.m),
                    None => break,
                };
                if !(id >= m.count && m.split) {
                    break;
                }
                let next = self.fetch(m.tail)?;
                if let Some(handle) = self.handles[slot].as_mut() {
                    handle.id = id - m.count;
                    handle.m = next;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_later_record_supersedes() {
        let mut name = Tag::new(types::REG, 3, 5);
        // a newer name for the same id makes this one redundant
        assert!(filter_redundant(&mut name, Tag::new(types::DIR, 3, 7)));

        let mut name = Tag::new(types::REG, 3, 5);
        assert!(!filter_redundant(&mut name, Tag::new(types::REG, 4, 5)));

        // a delete of the id also does
        let mut strukt = Tag::new(types::CTZSTRUCT, 2, 8);
        assert!(filter_redundant(&mut strukt, Tag::new(types::DELETE, 2, 0)));
    }

    #[test]
    fn test_filter_follows_splices() {
        let mut name = Tag::new(types::REG, 3, 5);
        assert!(!filter_redundant(&mut name, Tag::new(types::CREATE, 1, 0)));
        assert_eq!(name.id(), 4);

        assert!(!filter_redundant(&mut name, Tag::new(types::DELETE, 0, 0)));
        assert_eq!(name.id(), 3);

        // splices above the id leave it alone
        assert!(!filter_redundant(&mut name, Tag::new(types::CREATE, 9, 0)));
        assert_eq!(name.id(), 3);
    }

    #[test]
    fn test_unique_types_compare_exactly() {
        // struct records (no 0x100 bit) collapse by the top type bits
        let mut inline = Tag::new(types::INLINESTRUCT, 1, 10);
        assert!(filter_redundant(&mut inline, Tag::new(types::CTZSTRUCT, 1, 8)));

        // FROM_MOVE carries the 0x100 bit and only matches itself
        let mut strukt = Tag::new(types::CTZSTRUCT, 1, 8);
        assert!(!filter_redundant(&mut strukt, Tag::new(types::FROM_MOVE, 1, 0)));
    }
}
