//! Consensus primitives for the Umbra block chain.
//!
//! This crate holds the domain types shared by every other component:
//! hashes, block headers, blocks, transactions, the compact difficulty
//! encoding, stored-block records and per-network consensus parameters.

pub mod block;
pub mod compact;
pub mod constants;
pub mod errors;
pub mod hash;
pub mod header;
pub mod merkle;
pub mod params;
pub mod stored_block;
pub mod tx;

pub use block::Block;
pub use hash::{double_sha256, Hash, ZERO_HASH};
pub use header::BlockHeader;
pub use params::{Network, NetworkParams};
pub use stored_block::StoredBlock;
pub use tx::{OutPoint, Transaction, TxId, TxInput, TxOutput};
