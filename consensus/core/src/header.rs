use borsh::{BorshDeserialize, BorshSerialize};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::compact::{compact_to_target, work_from_target};
use crate::hash::{double_sha256, Hash};

/// Block header containing the proof-of-work commitment and parent link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block format version.
    pub version: u32,
    /// Hash of the preceding block's header.
    pub prev_block_hash: Hash,
    /// Merkle root over the block's transaction ids.
    pub merkle_root: Hash,
    /// Block timestamp in seconds since the unix epoch.
    pub timestamp: u64,
    /// Difficulty target in compact encoding.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(
        version: u32,
        prev_block_hash: Hash,
        merkle_root: Hash,
        timestamp: u64,
        bits: u32,
        nonce: u64,
    ) -> Self {
        Self { version, prev_block_hash, merkle_root, timestamp, bits, nonce }
    }

    /// Computes the hash of this header.
    pub fn hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(88);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(self.prev_block_hash.as_bytes());
        bytes.extend_from_slice(self.merkle_root.as_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.bits.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        double_sha256(&bytes)
    }

    /// The difficulty target as a 256-bit integer.
    pub fn target(&self) -> U256 {
        compact_to_target(self.bits)
    }

    /// The amount of work represented by this header's target.
    pub fn work(&self) -> U256 {
        work_from_target(self.target())
    }
}
