use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::constants::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use crate::hash::{double_sha256, Hash, ZERO_HASH};

/// A 32-byte transaction identifier.
pub type TxId = Hash;

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, index: u32) -> Self {
        Self { txid, index }
    }
}

/// Transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous_outpoint: OutPoint, signature_script: Vec<u8>, sequence: u32) -> Self {
        Self { previous_outpoint, signature_script, sequence }
    }
}

/// Transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self { value, script_pubkey }
    }
}

/// A transfer of coins, opaque to the chain engine except for its id,
/// coinbase flag and finality rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: u32, inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u32) -> Self {
        Self { version, inputs, outputs, lock_time }
    }

    /// Computes the transaction id.
    pub fn txid(&self) -> TxId {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(input.previous_outpoint.txid.as_bytes());
            bytes.extend_from_slice(&input.previous_outpoint.index.to_le_bytes());
            bytes.extend_from_slice(&(input.signature_script.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&input.signature_script);
            bytes.extend_from_slice(&input.sequence.to_le_bytes());
        }
        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.value.to_le_bytes());
            bytes.extend_from_slice(&(output.script_pubkey.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&output.script_pubkey);
        }
        bytes.extend_from_slice(&self.lock_time.to_le_bytes());
        double_sha256(&bytes)
    }

    /// True if this is the block-subsidy transaction.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].previous_outpoint.txid == ZERO_HASH
            && self.inputs[0].previous_outpoint.index == u32::MAX
    }

    /// Whether the transaction is final at the given block height and
    /// time, i.e. its lock time has expired or every input opted out.
    pub fn is_final(&self, height: u64, block_time_seconds: u64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD { height } else { block_time_seconds };
        if (self.lock_time as u64) < cutoff {
            return true;
        }
        self.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}
