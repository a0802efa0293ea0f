//! Checksum utilities for ShardSync
//!
//! Segment files are identified for diffing and verified after transfer by
//! a fixed-size digest combining CRC32C and xxHash64.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-size digest of a segment file's contents
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, hardware accelerated)
    pub crc32c: u32,
    /// xxHash64 (wider, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Size of the digest in bytes
    pub const SIZE: usize = 12;

    /// Create a checksum from its parts
    #[must_use]
    pub const fn new(crc32c: u32, xxhash64: u64) -> Self {
        Self { crc32c, xxhash64 }
    }

    /// Compute the checksum of a complete buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// Big-endian byte representation (`crc32c || xxhash64`)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.crc32c.to_be_bytes());
        out[4..].copy_from_slice(&self.xxhash64.to_be_bytes());
        out
    }

    /// Parse the byte representation produced by [`Checksum::to_bytes`]
    #[must_use]
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let mut crc = [0u8; 4];
        let mut xx = [0u8; 8];
        crc.copy_from_slice(&bytes[..4]);
        xx.copy_from_slice(&bytes[4..]);
        Self {
            crc32c: u32::from_be_bytes(crc),
            xxhash64: u64::from_be_bytes(xx),
        }
    }

    /// Lowercase hex form, used in logs and error messages
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    bytes: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            bytes: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        // CRC32C is computed incrementally
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
        }
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        self.crc32c = 0;
        self.xxhash_state.reset(0);
        self.bytes = 0;
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick CRC32C computation, used for frame integrity on the wire
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}
