//! Path lookup, directory entries and directory handles

use log::debug;

use crate::blockdev::BlockDevice;
use crate::engine::{handle_mut, Engine, Handle, HandleKind};
use crate::error::{Error, Result};
use crate::layout::{
    mask, pair_cmp, pair_from_bytes, pair_to_bytes, types, CtzStruct, Pair, Tag, ID_NONE,
};
use crate::metadata::{Attr, Fetched, MDir, Matcher, Search};

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// What `stat` and directory reads report about an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub kind: FileType,
    /// Bytes in the file; 0 for directories
    pub size: u32,
    pub name: String,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == FileType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileType::File
    }

    /// POSIX `st_mode`, with full permissions since none are stored
    pub fn mode(&self) -> u32 {
        let kind = match self.kind {
            FileType::File => libc::S_IFREG,
            FileType::Dir => libc::S_IFDIR,
        };
        kind as u32 | 0o777
    }

    /// `d_type` for a `dirent`
    pub fn d_type(&self) -> u8 {
        match self.kind {
            FileType::File => libc::DT_REG,
            FileType::Dir => libc::DT_DIR,
        }
    }

    fn dot(name: &str) -> Self {
        Self {
            kind: FileType::Dir,
            size: 0,
            name: name.to_string(),
        }
    }
}

/// Position of an open directory handle
pub(crate) struct DirState {
    /// First pair of the directory
    pub head: Pair,
    /// Entries returned so far, counting `.` and `..`
    pub pos: u32,
}

/// Result of resolving a path
pub(crate) struct Lookup<'p> {
    /// Pair holding the entry, or where it would be inserted
    pub dir: MDir,
    /// The entry, if the last component exists
    pub tag: Option<Tag>,
    /// Id of the entry, or the insertion id when it does not exist
    pub id: u16,
    /// Last component
    pub name: &'p str,
}

/// Split a path into names, dropping `.` and empty components and letting
/// `..` cancel the name before it. `..` at the root stays at the root.
pub(crate) fn components(path: &str) -> Vec<&str> {
    let mut names = Vec::new();
    for name in path.split('/') {
        match name {
            "" | "." => {}
            ".." => {
                names.pop();
            }
            _ => names.push(name),
        }
    }
    names
}

impl<D: BlockDevice> Engine<D> {
    /// Walk `path` from the root.
    ///
    /// Fails with `NotFound` if an intermediate directory is missing and
    /// `NotADirectory` if one is a file. A missing last component is not
    /// an error: the lookup then carries the insertion point.
    pub(crate) fn dir_find<'p>(&mut self, path: &'p str) -> Result<Lookup<'p>> {
        let names = components(path);
        let mut dir = MDir {
            tail: self.root,
            ..MDir::default()
        };
        let mut tag = Tag::new(types::DIR, ID_NONE, 0);
        let mut last = "";

        for (i, &name) in names.iter().enumerate() {
            last = name;
            if tag.type3() != types::DIR {
                return Err(Error::NotADirectory);
            }

            if tag.id() != ID_NONE {
                let mut buf = [0u8; 8];
                self.dir_get(
                    &dir,
                    mask(0x700, 0x3ff, 0),
                    Tag::new(types::STRUCT, tag.id(), 8),
                    &mut buf,
                )?;
                dir.tail = pair_from_bytes(&buf);
            }

            let search = Search {
                mask: mask(0x780, 0, 0),
                tag: Tag::new(types::NAME, 0, name.len().min(0x3ff) as u16),
                matcher: Matcher::Name(name.as_bytes()),
            };
            loop {
                let (next, found, id) = self.fetch_match(dir.tail, Some(&search))?;
                dir = next;
                let missing = match found {
                    Fetched::Found(t) => {
                        tag = t;
                        break;
                    }
                    Fetched::Missing => true,
                    Fetched::NotHere => !dir.split,
                };
                if missing {
                    if i + 1 != names.len() {
                        return Err(Error::NotFound);
                    }
                    return Ok(Lookup {
                        dir,
                        tag: None,
                        id,
                        name,
                    });
                }
            }
        }

        Ok(Lookup {
            dir,
            tag: Some(tag),
            id: tag.id(),
            name: last,
        })
    }

    /// Name, kind and size of entry `id` in `dir`
    pub(crate) fn dir_get_info(&mut self, dir: &MDir, id: u16) -> Result<EntryInfo> {
        if id == ID_NONE {
            return Ok(EntryInfo::dot("/"));
        }

        let name_max = self.bd.geo.name_max;
        let mut name = vec![0u8; name_max as usize + 1];
        let tag = self.dir_get(
            dir,
            mask(0x780, 0x3ff, 0),
            Tag::new(types::NAME, id, name.len() as u16),
            &mut name,
        )?;
        name.truncate((tag.size() as usize).min(name_max as usize));

        let kind = match tag.type3() {
            types::DIR => FileType::Dir,
            _ => FileType::File,
        };

        let mut buf = [0u8; CtzStruct::SIZE];
        let tag = self.dir_get(
            dir,
            mask(0x700, 0x3ff, 0),
            Tag::new(types::STRUCT, id, CtzStruct::SIZE as u16),
            &mut buf,
        )?;
        let size = match tag.type3() {
            types::CTZSTRUCT => CtzStruct::from_bytes(&buf).size,
            types::INLINESTRUCT => tag.size(),
            _ => 0,
        };

        Ok(EntryInfo {
            kind,
            size,
            name: String::from_utf8_lossy(&name).into_owned(),
        })
    }

    pub(crate) fn stat(&mut self, path: &str) -> Result<EntryInfo> {
        let lookup = self.dir_find(path)?;
        let tag = lookup.tag.ok_or(Error::NotFound)?;
        self.dir_get_info(&lookup.dir, tag.id())
    }

    pub(crate) fn mkdir(&mut self, path: &str) -> Result<()> {
        self.force_consistency()?;

        let lookup = self.dir_find(path)?;
        if lookup.tag.is_some() {
            return Err(Error::AlreadyExists);
        }
        if lookup.id == ID_NONE {
            return Err(Error::NotFound);
        }
        let name = lookup.name;
        if name.len() > self.bd.geo.name_max as usize {
            return Err(Error::NameTooLong);
        }
        let id = lookup.id;
        let mut cwd = lookup.dir;

        self.free.ack();
        let mut dir = self.dir_alloc()?;

        // thread the new pair in after the last pair of the parent
        let mut pred = cwd;
        while pred.split {
            pred = self.fetch(pred.tail)?;
        }
        self.dir_commit(
            &mut dir,
            &[Attr::bytes(
                Tag::new(types::SOFTTAIL, ID_NONE, 8),
                &pair_to_bytes(pred.tail),
            )],
            None,
        )?;
        let newpair = pair_to_bytes(dir.pair);

        // the parent spans several pairs, so the thread is updated in its
        // last pair and the new pair is an orphan until the entry lands
        if cwd.split {
            self.gstate.prep_orphans(1);
            let pin = self.pin(cwd, 0);
            let res = self.dir_commit(
                &mut pred,
                &[Attr::bytes(Tag::new(types::SOFTTAIL, ID_NONE, 8), &newpair)],
                None,
            );
            cwd = self.unpin(pin)?.m;
            res?;
            self.gstate.prep_orphans(-1);
        }

        let mut attrs = vec![
            Attr::new(Tag::new(types::CREATE, id, 0)),
            Attr::bytes(Tag::new(types::DIR, id, name.len() as u16), name.as_bytes()),
            Attr::bytes(Tag::new(types::DIRSTRUCT, id, 8), &newpair),
        ];
        if !cwd.split {
            attrs.push(Attr::bytes(Tag::new(types::SOFTTAIL, ID_NONE, 8), &newpair));
        }
        debug!("mkdir {:?} at id {} -> {{{:#x}, {:#x}}}", path, id, dir.pair[0], dir.pair[1]);
        self.dir_commit(&mut cwd, &attrs, None)
    }

    /// Read the pair an entry of type DIR points at and require it empty
    fn empty_child(&mut self, dir: &MDir, id: u16) -> Result<MDir> {
        let mut buf = [0u8; 8];
        self.dir_get(
            dir,
            mask(0x700, 0x3ff, 0),
            Tag::new(types::STRUCT, id, 8),
            &mut buf,
        )?;
        let child = self.fetch(pair_from_bytes(&buf))?;
        if child.count > 0 || child.split {
            return Err(Error::NotEmpty);
        }
        Ok(child)
    }

    /// Unlink a directory pair whose entry has been deleted
    fn drop_child(&mut self, child: &MDir) -> Result<()> {
        self.gstate.prep_orphans(-1);
        let mut pred = self.fs_pred(child.pair)?.ok_or(Error::Corrupt)?;
        self.dir_drop(&mut pred, child)
    }

    pub(crate) fn remove(&mut self, path: &str) -> Result<()> {
        self.force_consistency()?;

        let lookup = self.dir_find(path)?;
        let tag = lookup.tag.ok_or(Error::NotFound)?;
        if tag.id() == ID_NONE {
            return Err(Error::InvalidArgument);
        }
        let mut cwd = lookup.dir;

        let mut pin = None;
        if tag.type3() == types::DIR {
            let child = self.empty_child(&cwd, tag.id())?;
            self.gstate.prep_orphans(1);
            pin = Some(self.pin(child, 0));
        }

        let res = self.dir_commit(
            &mut cwd,
            &[Attr::new(Tag::new(types::DELETE, tag.id(), 0))],
            None,
        );
        let child = match pin {
            Some(slot) => Some(self.unpin(slot)?.m),
            None => None,
        };
        res?;

        if let Some(child) = child {
            self.drop_child(&child)?;
        }
        Ok(())
    }

    pub(crate) fn rename(&mut self, oldpath: &str, newpath: &str) -> Result<()> {
        self.force_consistency()?;

        let old = self.dir_find(oldpath)?;
        let oldtag = old.tag.ok_or(Error::NotFound)?;
        if oldtag.id() == ID_NONE {
            return Err(Error::InvalidArgument);
        }
        let oldcwd = old.dir;

        let new = self.dir_find(newpath)?;
        let prevtag = new.tag;
        let newid = new.id;
        if newid == ID_NONE {
            return Err(if prevtag.is_some() {
                Error::InvalidArgument
            } else {
                Error::NotFound
            });
        }
        let newname = new.name;
        let mut newcwd = new.dir;

        let samepair = pair_cmp(oldcwd.pair, newcwd.pair);
        let mut newoldid = oldtag.id();

        let mut prevdir = None;
        match prevtag {
            None => {
                if newname.len() > self.bd.geo.name_max as usize {
                    return Err(Error::NameTooLong);
                }
                // the create lands before the source
                if samepair && newid <= newoldid {
                    newoldid += 1;
                }
            }
            Some(prev) if prev.type3() != oldtag.type3() => {
                return Err(if prev.type3() == types::DIR {
                    Error::IsADirectory
                } else {
                    Error::NotADirectory
                });
            }
            Some(_) if samepair && newid == newoldid => return Ok(()),
            Some(prev) if prev.type3() == types::DIR => {
                let child = self.empty_child(&newcwd, newid)?;
                self.gstate.prep_orphans(1);
                prevdir = Some(self.pin(child, 0));
            }
            Some(_) => {}
        }

        // the first commit may relocate the source pair
        let oldpin = self.pin(oldcwd, oldtag.id());
        if !samepair {
            self.gstate.prep_move(newoldid, oldcwd.pair);
        }

        let mut attrs = Vec::with_capacity(5);
        if prevtag.is_some() {
            attrs.push(Attr::new(Tag::new(types::DELETE, newid, 0)));
        }
        attrs.push(Attr::new(Tag::new(types::CREATE, newid, 0)));
        attrs.push(Attr::bytes(
            Tag::new(oldtag.type3(), newid, newname.len() as u16),
            newname.as_bytes(),
        ));
        attrs.push(Attr::moved(
            Tag::new(types::FROM_MOVE, newid, oldtag.id()),
            oldcwd,
        ));
        if samepair {
            attrs.push(Attr::new(Tag::new(types::DELETE, newoldid, 0)));
        }

        let mut res = self.dir_commit(&mut newcwd, &attrs, None);

        // the entry now exists twice; drop the source, which also clears
        // the pending move
        if res.is_ok() && !samepair && self.gstate.has_move() {
            self.gstate.prep_move(ID_NONE, crate::layout::PAIR_NULL);
            res = match handle_mut(&mut self.handles, oldpin) {
                Ok(pinned) => {
                    let (mut m, id) = (pinned.m, pinned.id);
                    self.dir_commit(
                        &mut m,
                        &[Attr::new(Tag::new(types::DELETE, id, 0))],
                        Some(oldpin),
                    )
                }
                Err(e) => Err(e),
            };
        }

        self.unpin(oldpin)?;
        let prevdir = match prevdir {
            Some(slot) => Some(self.unpin(slot)?.m),
            None => None,
        };
        res?;

        if let Some(prevdir) = prevdir {
            self.drop_child(&prevdir)?;
        }
        Ok(())
    }

    /// Open a directory handle, returning its slot
    pub(crate) fn dir_open(&mut self, path: &str) -> Result<usize> {
        let lookup = self.dir_find(path)?;
        let tag = lookup.tag.ok_or(Error::NotFound)?;
        if tag.type3() != types::DIR {
            return Err(Error::NotADirectory);
        }

        let head = if tag.id() == ID_NONE {
            self.root
        } else {
            let mut buf = [0u8; 8];
            self.dir_get(
                &lookup.dir,
                mask(0x700, 0x3ff, 0),
                Tag::new(types::STRUCT, tag.id(), 8),
                &mut buf,
            )?;
            pair_from_bytes(&buf)
        };

        let m = self.fetch(head)?;
        Ok(self.open_handle(Handle {
            id: 0,
            m,
            kind: HandleKind::Dir(DirState { head: m.pair, pos: 0 }),
        }))
    }

    fn dir_state(&mut self, slot: usize) -> Result<&mut Handle> {
        let handle = handle_mut(&mut self.handles, slot)?;
        match handle.kind {
            HandleKind::Dir(_) => Ok(handle),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn dir_advance(&mut self, slot: usize, by: u32) -> Result<()> {
        if let HandleKind::Dir(state) = &mut self.dir_state(slot)?.kind {
            state.pos += by;
        }
        Ok(())
    }

    /// Next entry, `.` and `..` first; `None` at the end
    pub(crate) fn dir_read(&mut self, slot: usize) -> Result<Option<EntryInfo>> {
        let handle = self.dir_state(slot)?;
        if let HandleKind::Dir(state) = &mut handle.kind {
            if state.pos < 2 {
                let name = if state.pos == 0 { "." } else { ".." };
                state.pos += 1;
                return Ok(Some(EntryInfo::dot(name)));
            }
        }

        loop {
            let (id, m) = {
                let handle = self.dir_state(slot)?;
                (handle.id, handle.m)
            };

            if id == m.count {
                if !m.split {
                    return Ok(None);
                }
                let next = self.fetch(m.tail)?;
                let handle = self.dir_state(slot)?;
                handle.m = next;
                handle.id = 0;
                continue;
            }

            let info = match self.dir_get_info(&m, id) {
                Ok(info) => Some(info),
                Err(Error::NotFound) => None,
                Err(e) => return Err(e),
            };
            self.dir_state(slot)?.id += 1;

            if let Some(info) = info {
                self.dir_advance(slot, 1)?;
                return Ok(Some(info));
            }
        }
    }

    /// Return to the first entry
    pub(crate) fn dir_rewind(&mut self, slot: usize) -> Result<()> {
        let head = match &self.dir_state(slot)?.kind {
            HandleKind::Dir(state) => state.head,
            _ => return Err(Error::InvalidArgument),
        };
        let m = self.fetch(head)?;

        let handle = self.dir_state(slot)?;
        handle.m = m;
        handle.id = 0;
        if let HandleKind::Dir(state) = &mut handle.kind {
            state.pos = 0;
        }
        Ok(())
    }

    pub(crate) fn dir_tell(&mut self, slot: usize) -> Result<u32> {
        match &self.dir_state(slot)?.kind {
            HandleKind::Dir(state) => Ok(state.pos),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Seek to a position returned by `dir_tell`
    pub(crate) fn dir_seek(&mut self, slot: usize, off: u32) -> Result<()> {
        self.dir_rewind(slot)?;

        // `.` and `..`
        let dots = off.min(2);
        self.dir_advance(slot, dots)?;
        let mut off = off - dots;

        let root = self.root;
        while off > 0 {
            let (mut id, mut m) = {
                let handle = self.dir_state(slot)?;
                (handle.id, handle.m)
            };

            // the superblock entry sits at id 0 of the root and is never
            // returned by reads
            if id == 0 && pair_cmp(m.pair, root) && m.count > 0 {
                let handle = self.dir_state(slot)?;
                handle.id = 1;
                id = 1;
            }

            if id == m.count {
                if !m.split {
                    return Err(Error::InvalidArgument);
                }
                m = self.fetch(m.tail)?;
                let handle = self.dir_state(slot)?;
                handle.m = m;
                handle.id = 0;
                id = 0;
            }

            let diff = (m.count - id).min(off.min(u16::MAX as u32) as u16);
            self.dir_state(slot)?.id += diff;
            self.dir_advance(slot, diff as u32)?;
            off -= diff as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_normalize() {
        assert_eq!(components("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(components("a//b/"), vec!["a", "b"]);
        assert_eq!(components("./a/./b"), vec!["a", "b"]);
        assert_eq!(components("a/b/../c"), vec!["a", "c"]);
        assert_eq!(components("/../a"), vec!["a"]);
        assert!(components("/").is_empty());
        assert!(components("a/..").is_empty());
    }

    #[test]
    fn test_entry_modes() {
        let file = EntryInfo {
            kind: FileType::File,
            size: 3,
            name: "f".into(),
        };
        assert_eq!(file.mode() & libc::S_IFMT as u32, libc::S_IFREG as u32);
        assert_eq!(file.d_type(), libc::DT_REG);
        assert!(EntryInfo::dot("..").is_dir());
    }
}
