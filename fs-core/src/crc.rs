//! Commit checksums
//!
//! Metadata commits are protected by a running 32-bit checksum. The
//! function is pluggable so that hosts with a hardware CRC unit can supply
//! their own; the default is the reflected CRC-32 (0xEDB88320) without the
//! final inversion, which is what the on-disk format expects.

/// A running 32-bit checksum over byte slices.
///
/// Implementations must be chainable: `crc(crc(s, a), b) == crc(s, a ++ b)`.
pub trait Integrity {
    fn crc(&self, seed: u32, data: &[u8]) -> u32;
}

/// Reflected CRC-32 built on `crc32fast`
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32;

impl Integrity for Crc32 {
    fn crc(&self, seed: u32, data: &[u8]) -> u32 {
        // crc32fast inverts on the way in and out, the raw register does not
        let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
        hasher.update(data);
        !hasher.finalize()
    }
}

impl<F: Fn(u32, &[u8]) -> u32> Integrity for F {
    fn crc(&self, seed: u32, data: &[u8]) -> u32 {
        self(seed, data)
    }
}
