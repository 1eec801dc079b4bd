use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::compact::compact_to_target;
use crate::hash::{double_sha256, Hash, ZERO_HASH};
use crate::header::BlockHeader;

/// Network identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

/// Consensus parameters of a network.
///
/// The chain engine consumes these through read-only access; node
/// configuration decides which network to instantiate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkParams {
    /// Which network these parameters describe.
    pub network: Network,
    /// The genesis block header.
    pub genesis: BlockHeader,
    /// Number of blocks between classic difficulty retargets.
    pub interval: u64,
    /// Seconds a full retarget interval is expected to take.
    pub target_timespan: u64,
    /// Expected seconds between consecutive blocks.
    pub target_spacing: u64,
    /// Easiest permitted difficulty target, in compact encoding.
    pub pow_limit_bits: u32,
    /// Hard-coded (height, hash) pairs the chain must pass through.
    pub checkpoints: HashMap<u64, Hash>,
}

/// Expected seconds between blocks on every Umbra network.
pub const TARGET_SPACING: u64 = 150;

/// Blocks per classic retarget interval.
pub const INTERVAL: u64 = 2016;

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            genesis: genesis_header(1_390_095_618, 0x1e0fffff, 28_917_698),
            interval: INTERVAL,
            target_timespan: INTERVAL * TARGET_SPACING,
            target_spacing: TARGET_SPACING,
            pow_limit_bits: 0x1e0fffff,
            checkpoints: HashMap::new(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            genesis: genesis_header(1_390_095_588, 0x1e0fffff, 3_861_367),
            interval: INTERVAL,
            target_timespan: INTERVAL * TARGET_SPACING,
            target_spacing: TARGET_SPACING,
            pow_limit_bits: 0x1e0fffff,
            checkpoints: HashMap::new(),
        }
    }

    /// Registers a checkpoint, replacing any previous one at the height.
    pub fn checkpoint(mut self, height: u64, hash: Hash) -> Self {
        self.checkpoints.insert(height, hash);
        self
    }

    /// The easiest permitted target as a 256-bit integer.
    pub fn pow_limit(&self) -> U256 {
        compact_to_target(self.pow_limit_bits)
    }

    /// The hash of the genesis header.
    pub fn genesis_hash(&self) -> Hash {
        self.genesis.hash()
    }

    /// True unless a checkpoint exists at `height` with a different hash.
    pub fn passes_checkpoint(&self, height: u64, hash: &Hash) -> bool {
        match self.checkpoints.get(&height) {
            Some(expected) => expected == hash,
            None => true,
        }
    }

    pub fn is_testnet(&self) -> bool {
        self.network == Network::Testnet
    }
}

fn genesis_header(timestamp: u64, bits: u32, nonce: u64) -> BlockHeader {
    BlockHeader::new(
        1,
        ZERO_HASH,
        double_sha256(b"shadows lengthen over honest ledgers 19/Jan/2014"),
        timestamp,
        bits,
        nonce,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_genesis() {
        assert_ne!(NetworkParams::mainnet().genesis_hash(), NetworkParams::testnet().genesis_hash());
    }

    #[test]
    fn checkpoint_gating() {
        let params = NetworkParams::testnet();
        let genesis_hash = params.genesis_hash();
        let params = params.checkpoint(5, genesis_hash);

        assert!(params.passes_checkpoint(4, &Hash::from_le_u64([9, 0, 0, 0])));
        assert!(params.passes_checkpoint(5, &genesis_hash));
        assert!(!params.passes_checkpoint(5, &Hash::from_le_u64([9, 0, 0, 0])));
    }

    #[test]
    fn pow_limit_decodes() {
        let params = NetworkParams::mainnet();
        assert!(params.pow_limit() > U256::zero());
    }
}
