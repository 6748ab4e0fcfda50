//! On-disk layout definitions for PebbleFS
//!
//! Metadata is a log of 32-bit tags, each followed by its payload. A tag is
//! `[invalid:1 | type:11 | id:10 | size:10]`, stored big-endian and XORed
//! with the previous tag so that erased flash reads back as an invalid tag.
//! Everything else (revisions, pointers, CRCs, structs) is little-endian.

use std::io::{Cursor, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// The null block address
pub const BLOCK_NULL: u32 = 0xffff_ffff;
/// Marks file data stored inline in its metadata entry
pub const BLOCK_INLINE: u32 = 0xffff_fffe;

/// Superblock name record contents
pub const MAGIC: &[u8; 8] = b"littlefs";
/// Disk version 2.0
pub const DISK_VERSION: u32 = 0x0002_0000;

/// Tag types
pub mod types {
    pub const NAME: u16 = 0x000;
    pub const REG: u16 = 0x001;
    pub const DIR: u16 = 0x002;
    pub const SUPERBLOCK: u16 = 0x0ff;

    pub const STRUCT: u16 = 0x200;
    pub const DIRSTRUCT: u16 = 0x200;
    pub const INLINESTRUCT: u16 = 0x201;
    pub const CTZSTRUCT: u16 = 0x202;

    pub const SPLICE: u16 = 0x400;
    pub const CREATE: u16 = 0x401;
    pub const DELETE: u16 = 0x4ff;

    pub const CRC: u16 = 0x500;

    pub const TAIL: u16 = 0x600;
    pub const SOFTTAIL: u16 = 0x600;
    pub const HARDTAIL: u16 = 0x601;

    pub const GLOBALS: u16 = 0x700;
    pub const MOVESTATE: u16 = 0x7ff;

    /// In-memory only: copy the struct records of another entry
    pub const FROM_MOVE: u16 = 0x101;
    /// In-memory only: an attribute slot that writes nothing
    pub const NOOP: u16 = 0x100;
}

/// Id used by records that do not belong to an entry
pub const ID_NONE: u16 = 0x3ff;

/// A 32-bit metadata tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

impl Tag {
    pub const INVALID: Tag = Tag(0xffff_ffff);

    pub const fn new(ty: u16, id: u16, size: u16) -> Self {
        Tag(((ty as u32) << 20) | ((id as u32) << 10) | size as u32)
    }

    pub fn is_valid(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    pub fn is_delete(self) -> bool {
        self.size() == 0x3ff
    }

    /// Top three type bits, shifted into place
    pub fn type1(self) -> u16 {
        ((self.0 & 0x7000_0000) >> 20) as u16
    }

    /// Full eleven type bits
    pub fn type3(self) -> u16 {
        ((self.0 & 0x7ff0_0000) >> 20) as u16
    }

    /// Low eight type bits
    pub fn chunk(self) -> u8 {
        ((self.0 & 0x0ff0_0000) >> 20) as u8
    }

    /// Signed id shift carried by CREATE/DELETE
    pub fn splice(self) -> i8 {
        self.chunk() as i8
    }

    pub fn id(self) -> u16 {
        ((self.0 & 0x000f_fc00) >> 10) as u16
    }

    pub fn size(self) -> u32 {
        self.0 & 0x0000_03ff
    }

    /// Bytes the record occupies on disk, tag included
    pub fn dsize(self) -> u32 {
        4 + Tag(self.0.wrapping_add(self.is_delete() as u32)).size()
    }

    pub fn with_id(self, id: u16) -> Self {
        Tag((self.0 & !0x000f_fc00) | ((id as u32) << 10))
    }

    /// Shift the id field by `delta`, wrapping within the field
    pub fn shift_id(self, delta: i32) -> Self {
        Tag(self.0.wrapping_add((delta as u32) << 10))
    }

    /// Masked equality
    pub fn matches(self, mask: u32, other: Tag) -> bool {
        self.0 & mask == other.0 & mask
    }
}

/// Build a tag mask from type, id and size masks
pub const fn mask(ty: u16, id: u16, size: u16) -> u32 {
    Tag::new(ty, id, size).0
}

/// Sequence comparison for revision counters
pub fn scmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

pub type Pair = [u32; 2];

pub const PAIR_NULL: Pair = [BLOCK_NULL, BLOCK_NULL];
pub const SUPERBLOCK_PAIR: Pair = [0, 1];

/// Two pairs are the same directory if they share any block
pub fn pair_cmp(a: Pair, b: Pair) -> bool {
    a[0] == b[0] || a[1] == b[1] || a[0] == b[1] || a[1] == b[0]
}

/// Same blocks, in either order
pub fn pair_sync(a: Pair, b: Pair) -> bool {
    (a[0] == b[0] && a[1] == b[1]) || (a[0] == b[1] && a[1] == b[0])
}

pub fn pair_is_null(p: Pair) -> bool {
    p[0] == BLOCK_NULL || p[1] == BLOCK_NULL
}

pub fn pair_to_bytes(p: Pair) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u32_into(&p, &mut buf);
    buf
}

pub fn pair_from_bytes(buf: &[u8]) -> Pair {
    [LittleEndian::read_u32(&buf[0..4]), LittleEndian::read_u32(&buf[4..8])]
}

/// Location and length of a file stored as a CTZ skip list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtzStruct {
    pub head: u32,
    pub size: u32,
}

impl CtzStruct {
    pub const SIZE: usize = 8;

    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], self.head);
        LittleEndian::write_u32(&mut buf[4..8], self.size);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            head: LittleEndian::read_u32(&buf[0..4]),
            size: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Filesystem-wide parameters stored in the root entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

impl Superblock {
    pub const SIZE: usize = 24;

    pub fn serialize<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u32::<LittleEndian>(self.block_count)?;
        writer.write_u32::<LittleEndian>(self.name_max)?;
        writer.write_u32::<LittleEndian>(self.file_max)?;
        writer.write_u32::<LittleEndian>(self.attr_max)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            version: reader.read_u32::<LittleEndian>()?,
            block_size: reader.read_u32::<LittleEndian>()?,
            block_count: reader.read_u32::<LittleEndian>()?,
            name_max: reader.read_u32::<LittleEndian>()?,
            file_max: reader.read_u32::<LittleEndian>()?,
            attr_max: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.version,
            self.block_size,
            self.block_count,
            self.name_max,
            self.file_max,
            self.attr_max,
        ];
        let mut buf = [0u8; Self::SIZE];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            LittleEndian::write_u32(chunk, word);
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Self::deserialize(&mut Cursor::new(buf)).map_err(|_| Error::Corrupt)
    }

    pub fn major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version & 0xffff) as u16
    }
}

/// Global state: a pending move plus the orphan flag and count.
///
/// Each metadata pair stores an XOR delta in a MOVESTATE record; folding
/// every delta gives the filesystem-wide value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GState {
    pub tag: u32,
    pub pair: Pair,
}

impl GState {
    pub const SIZE: usize = 12;

    pub fn xor(&mut self, other: &GState) {
        self.tag ^= other.tag;
        self.pair[0] ^= other.pair[0];
        self.pair[1] ^= other.pair[1];
    }

    pub fn is_zero(&self) -> bool {
        self.tag == 0 && self.pair == [0, 0]
    }

    pub fn has_orphans(&self) -> bool {
        Tag(self.tag).size() != 0
    }

    pub fn orphans(&self) -> u8 {
        Tag(self.tag).size() as u8
    }

    pub fn has_move(&self) -> bool {
        Tag(self.tag).type1() != 0
    }

    pub fn has_move_here(&self, pair: Pair) -> bool {
        self.has_move() && pair_cmp(self.pair, pair)
    }

    pub fn move_id(&self) -> u16 {
        Tag(self.tag).id()
    }

    /// Adjust the orphan count; the top bit mirrors whether any remain
    pub fn prep_orphans(&mut self, delta: i8) {
        self.tag = self.tag.wrapping_add(delta as i32 as u32);
        self.tag = (self.tag & !0x8000_0000) | ((self.has_orphans() as u32) << 31);
    }

    /// Record a pending move of entry `id` out of `pair`, or clear it with
    /// `ID_NONE`
    pub fn prep_move(&mut self, id: u16, pair: Pair) {
        let moving = id != ID_NONE;
        self.tag = (self.tag & !mask(0x7ff, 0x3ff, 0))
            | if moving { Tag::new(types::DELETE, id, 0).0 } else { 0 };
        self.pair = if moving { pair } else { [0, 0] };
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.tag);
        LittleEndian::write_u32(&mut buf[4..8], self.pair[0]);
        LittleEndian::write_u32(&mut buf[8..12], self.pair[1]);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            tag: LittleEndian::read_u32(&buf[0..4]),
            pair: [
                LittleEndian::read_u32(&buf[4..8]),
                LittleEndian::read_u32(&buf[8..12]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_fields() {
        let tag = Tag::new(types::INLINESTRUCT, 17, 300);
        assert!(tag.is_valid());
        assert_eq!(tag.type3(), types::INLINESTRUCT);
        assert_eq!(tag.type1(), types::STRUCT);
        assert_eq!(tag.chunk(), 0x01);
        assert_eq!(tag.id(), 17);
        assert_eq!(tag.size(), 300);
        assert_eq!(tag.dsize(), 304);
        assert_eq!(tag.with_id(3).id(), 3);
        assert_eq!(tag.shift_id(-1).id(), 16);
    }

    #[test]
    fn test_splice_sign() {
        assert_eq!(Tag::new(types::CREATE, 4, 0).splice(), 1);
        assert_eq!(Tag::new(types::DELETE, 4, 0).splice(), -1);
    }

    #[test]
    fn test_deleted_records_have_no_payload() {
        let tag = Tag::new(types::REG, 2, 0x3ff);
        assert!(tag.is_delete());
        assert_eq!(tag.dsize(), 4);
    }

    #[test]
    fn test_xor_chain_marks_erased_flash_invalid() {
        // the first tag of a block is XORed with 0xffffffff
        let tag = Tag::new(types::CREATE, 0, 0);
        let stored = tag.0 ^ 0xffff_ffff;
        assert_eq!(Tag(stored ^ 0xffff_ffff), tag);
        // erased bytes following a valid tag decode with the top bit set
        assert!(!Tag(0xffff_ffff ^ tag.0).is_valid());
        // unless the commit flipped the expected valid bit
        assert!(Tag(0xffff_ffff ^ (tag.0 | 0x8000_0000)).is_valid());
    }

    #[test]
    fn test_pair_helpers() {
        assert!(pair_cmp([1, 0], [0, 1]));
        assert!(pair_cmp([5, 9], [9, 7]));
        assert!(!pair_cmp([5, 9], [6, 7]));
        assert!(pair_sync([1, 0], [0, 1]));
        assert!(!pair_sync([5, 9], [9, 7]));
        assert!(pair_is_null([BLOCK_NULL, 3]));
        assert_eq!(pair_from_bytes(&pair_to_bytes([7, 12])), [7, 12]);
    }

    #[test]
    fn test_revision_wraps() {
        assert!(scmp(1, 0xffff_fff0) > 0);
        assert!(scmp(5, 6) < 0);
    }

    #[test]
    fn test_superblock_layout() {
        let sb = Superblock {
            version: DISK_VERSION,
            block_size: 512,
            block_count: 64,
            name_max: 255,
            file_max: 0x7fff_ffff,
            attr_max: 0x3fe,
        };
        let bytes = sb.to_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&bytes[4..8], &512u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &64u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &[0xfe, 0x03, 0x00, 0x00]);

        let mut streamed = Vec::new();
        sb.serialize(&mut streamed).unwrap();
        assert_eq!(streamed, bytes);
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
        assert_eq!(sb.major(), 2);
        assert_eq!(sb.minor(), 0);
        assert!(matches!(Superblock::from_bytes(&bytes[..10]), Err(Error::Corrupt)));
    }

    #[test]
    fn test_gstate_orphans_and_moves() {
        let mut g = GState::default();
        g.prep_orphans(1);
        assert!(g.has_orphans());
        assert_eq!(g.orphans(), 1);
        assert_eq!(g.tag >> 31, 1);
        g.prep_orphans(-1);
        assert!(!g.has_orphans());
        assert!(g.is_zero());

        g.prep_move(3, [10, 11]);
        assert!(g.has_move_here([11, 10]));
        assert_eq!(g.move_id(), 3);
        g.prep_move(ID_NONE, PAIR_NULL);
        assert!(g.is_zero());

        let mut a = GState { tag: 0x1234, pair: [1, 2] };
        let b = a;
        a.xor(&b);
        assert!(a.is_zero());
        assert_eq!(GState::from_bytes(&b.to_bytes()), b);
    }
}
