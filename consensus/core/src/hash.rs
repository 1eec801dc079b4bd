use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_SIZE: usize = 32;

/// A 32-byte hash wrapper used across the project.
///
/// Proof-of-work comparisons interpret the bytes as a big-endian
/// 256-bit integer.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Hash([u8; HASH_SIZE]);

/// The all-zero hash, used as the previous-block pointer of genesis.
pub const ZERO_HASH: Hash = Hash([0u8; HASH_SIZE]);

impl Hash {
    /// Creates a hash from a 32-byte array.
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Constructs a hash from four little-endian u64s (used in tests).
    pub const fn from_le_u64(parts: [u64; 4]) -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        let mut i = 0;
        while i < 4 {
            let part = parts[i].to_le_bytes();
            let mut j = 0;
            while j < 8 {
                bytes[i * 8 + j] = part[j];
                j += 1;
            }
            i += 1;
        }
        Self(bytes)
    }

    /// Tries to create a hash from a slice of bytes.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, std::array::TryFromSliceError> {
        let array: [u8; HASH_SIZE] = slice.try_into()?;
        Ok(Self(array))
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; HASH_SIZE] {
    fn from(h: Hash) -> Self {
        h.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

/// Computes SHA256(SHA256(data)).
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut bytes = [0u8; HASH_SIZE];
    bytes.copy_from_slice(&second);
    Hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha256_is_deterministic() {
        let a = double_sha256(b"umbra");
        let b = double_sha256(b"umbra");
        assert_eq!(a, b);
        assert_ne!(a, double_sha256(b"arbmu"));
    }

    #[test]
    fn from_le_u64_places_words() {
        let h = Hash::from_le_u64([1, 0, 0, 0]);
        assert_eq!(h.as_bytes()[0], 1);
        assert!(h.as_bytes()[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(ZERO_HASH.to_string(), "0".repeat(64));
    }
}
