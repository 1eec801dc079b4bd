use borsh::{BorshDeserialize, BorshSerialize};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::ALLOWED_TIME_DRIFT;
use crate::errors::VerificationError;
use crate::hash::Hash;
use crate::header::BlockHeader;
use crate::merkle::MerkleTree;
use crate::params::NetworkParams;
use crate::tx::Transaction;

/// A block as received from the network: always a header, and a
/// transaction list unless only the header was relayed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block header containing metadata and the parent link.
    pub header: BlockHeader,
    /// The block's transactions, absent for header-only relays.
    pub transactions: Option<Vec<Transaction>>,
}

impl Block {
    /// Creates a block with the given header and transactions.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions: Some(transactions) }
    }

    /// Creates a header-only block.
    pub fn from_header(header: BlockHeader) -> Self {
        Self { header, transactions: None }
    }

    /// The header hash.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Returns a copy of this block with the transaction list dropped.
    pub fn as_header_block(&self) -> Block {
        Block::from_header(self.header)
    }

    /// Proves the header is internally valid: the target is in range,
    /// the hash satisfies it, and the timestamp is not absurdly ahead
    /// of our clock.
    pub fn verify_header(&self, params: &NetworkParams) -> Result<(), VerificationError> {
        let target = self.header.target();
        if target.is_zero() || target > params.pow_limit() {
            return Err(VerificationError::BadTarget);
        }
        let hash_value = U256::from_big_endian(self.hash().as_bytes());
        if hash_value >= target {
            return Err(VerificationError::ProofOfWork);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if self.header.timestamp > now + ALLOWED_TIME_DRIFT {
            return Err(VerificationError::TimeTooFarAhead);
        }
        Ok(())
    }

    /// Proves the transaction list is structurally valid: non-empty,
    /// coinbase first and nowhere else, merkle root matching.
    pub fn verify_transactions(&self) -> Result<(), VerificationError> {
        let transactions = match &self.transactions {
            Some(txs) if !txs.is_empty() => txs,
            _ => return Err(VerificationError::EmptyBody),
        };

        if !transactions[0].is_coinbase() {
            return Err(VerificationError::MisplacedCoinbase);
        }
        if transactions[1..].iter().any(Transaction::is_coinbase) {
            return Err(VerificationError::MisplacedCoinbase);
        }

        let ids: Vec<Hash> = transactions.iter().map(Transaction::txid).collect();
        let root = MerkleTree::from_hashes(ids).root();
        if root != self.header.merkle_root {
            return Err(VerificationError::MerkleMismatch);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;
    use crate::hash::ZERO_HASH;
    use crate::tx::{OutPoint, TxInput, TxOutput};

    fn easy_params() -> NetworkParams {
        let mut params = NetworkParams::testnet();
        params.pow_limit_bits = 0x207fffff;
        params
    }

    fn coinbase(tag: u8) -> Transaction {
        Transaction::new(
            1,
            vec![TxInput::new(OutPoint::new(ZERO_HASH, u32::MAX), vec![tag], SEQUENCE_FINAL)],
            vec![TxOutput::new(50, vec![0x51])],
            0,
        )
    }

    fn mine(transactions: Vec<Transaction>, bits: u32) -> Block {
        let root = MerkleTree::from_hashes(transactions.iter().map(Transaction::txid).collect()).root();
        let mut header = BlockHeader::new(1, ZERO_HASH, root, 1_390_095_618, bits, 0);
        let target = header.target();
        while U256::from_big_endian(header.hash().as_bytes()) >= target {
            header.nonce += 1;
        }
        Block::new(header, transactions)
    }

    #[test]
    fn mined_block_verifies() {
        let block = mine(vec![coinbase(1)], 0x207fffff);
        block.verify_header(&easy_params()).unwrap();
        block.verify_transactions().unwrap();
    }

    #[test]
    fn rejects_target_above_limit() {
        let block = mine(vec![coinbase(1)], 0x207fffff);
        // Mainnet's limit is far below this block's target.
        assert!(matches!(
            block.verify_header(&NetworkParams::mainnet()),
            Err(VerificationError::BadTarget)
        ));
    }

    #[test]
    fn rejects_insufficient_work() {
        let mut block = mine(vec![coinbase(1)], 0x207fffff);
        // Find a nonce whose hash fails the target.
        let target = block.header.target();
        while U256::from_big_endian(block.hash().as_bytes()) < target {
            block.header.nonce += 1;
        }
        assert!(matches!(block.verify_header(&easy_params()), Err(VerificationError::ProofOfWork)));
    }

    #[test]
    fn rejects_future_timestamp() {
        let mut block = mine(vec![coinbase(1)], 0x207fffff);
        let far_future = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
            + ALLOWED_TIME_DRIFT * 2;
        block.header.timestamp = far_future;
        // Re-mine at the new timestamp.
        let target = block.header.target();
        block.header.nonce = 0;
        while U256::from_big_endian(block.hash().as_bytes()) >= target {
            block.header.nonce += 1;
        }
        assert!(matches!(block.verify_header(&easy_params()), Err(VerificationError::TimeTooFarAhead)));
    }

    #[test]
    fn rejects_merkle_mismatch() {
        let mut block = mine(vec![coinbase(1)], 0x207fffff);
        block.transactions = Some(vec![coinbase(2)]);
        assert!(matches!(block.verify_transactions(), Err(VerificationError::MerkleMismatch)));
    }

    #[test]
    fn rejects_missing_body() {
        let block = Block::from_header(mine(vec![coinbase(1)], 0x207fffff).header);
        assert!(matches!(block.verify_transactions(), Err(VerificationError::EmptyBody)));
    }

    #[test]
    fn rejects_misplaced_coinbase() {
        let txs = vec![coinbase(1), coinbase(2)];
        let block = mine(txs, 0x207fffff);
        assert!(matches!(block.verify_transactions(), Err(VerificationError::MisplacedCoinbase)));
    }
}
