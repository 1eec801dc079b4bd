//! Difficulty-transition verification.
//!
//! Four retarget algorithms shipped over the network's lifetime; which
//! one governs a block is a pure function of network and height. Each
//! algorithm computes the expected target from the ancestors of the
//! candidate's parent and hands it to [`verify_difficulty`], which
//! applies the historical comparison policy.

mod dgw;
mod kgw;
mod v1;

use consensus_core::compact::compact_to_difficulty;
use consensus_core::errors::VerificationError;
use consensus_core::{BlockHeader, Network, NetworkParams, StoredBlock};
use primitive_types::U256;
use tracing::info;

use crate::chain::ChainBackend;
use crate::error::ChainError;

/// First mainnet height governed by Kimoto Gravity Well.
pub const MAINNET_KGW_HEIGHT: u64 = 15_200;
/// First mainnet height governed by Dark Gravity Wave.
pub const MAINNET_DGW_HEIGHT: u64 = 34_140;
/// First mainnet height governed by Dark Gravity Wave v3.
pub const MAINNET_DGW3_HEIGHT: u64 = 68_589;
/// First testnet height governed by Dark Gravity Wave v3.
pub const TESTNET_DGW3_HEIGHT: u64 = 16;

/// The closed set of retarget algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetargetAlgorithm {
    /// Classic interval retarget over `params.interval` blocks.
    V1,
    /// Kimoto Gravity Well.
    KimotoGravityWell,
    /// Dark Gravity Wave (the original, floating-point formulation).
    DarkGravityWave,
    /// Dark Gravity Wave v3.
    DarkGravityWave3,
}

/// Selects the retarget algorithm governing a block at `height`.
pub fn select_algorithm(network: Network, height: u64) -> RetargetAlgorithm {
    match network {
        Network::Testnet => {
            if height >= TESTNET_DGW3_HEIGHT {
                RetargetAlgorithm::DarkGravityWave3
            } else {
                RetargetAlgorithm::V1
            }
        }
        Network::Mainnet => {
            if height >= MAINNET_DGW3_HEIGHT {
                RetargetAlgorithm::DarkGravityWave3
            } else if height >= MAINNET_DGW_HEIGHT {
                RetargetAlgorithm::DarkGravityWave
            } else if height >= MAINNET_KGW_HEIGHT {
                RetargetAlgorithm::KimotoGravityWell
            } else {
                RetargetAlgorithm::V1
            }
        }
    }
}

/// Fails unless `next`'s difficulty matches what the consensus rules
/// demand on top of `stored_prev`.
pub fn check_difficulty_transitions(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    match select_algorithm(params.network, stored_prev.height() + 1) {
        RetargetAlgorithm::V1 => v1::check(stored_prev, next, params, backend),
        RetargetAlgorithm::KimotoGravityWell => kgw::check(stored_prev, next, params, backend),
        RetargetAlgorithm::DarkGravityWave => dgw::check_dgw(stored_prev, next, params, backend),
        RetargetAlgorithm::DarkGravityWave3 => dgw::check_dgw3(stored_prev, next, params, backend),
    }
}

/// One step of the incremental average both gravity-well algorithms
/// maintain: `prev_avg + (sample - prev_avg) / n`, with the signed
/// division truncating toward zero. Historical blocks were accepted
/// under exactly this rounding, so it must not change.
fn step_average(sample: U256, prev_avg: U256, n: u64) -> U256 {
    let n = U256::from(n);
    if sample >= prev_avg {
        prev_avg + (sample - prev_avg) / n
    } else {
        prev_avg - (prev_avg - sample) / n
    }
}

/// Compares a freshly calculated target against the one the candidate
/// block carries.
///
/// The calculated value is clamped to the proof-of-work limit and
/// reduced to the precision of the candidate's compact encoding. On
/// testnet the masked values must match exactly. On mainnet, heights up
/// to 68 589 tolerate up to 20 % drift between the reconstructed
/// floating-point difficulties; this absorbs accumulated floating-point
/// error in historical Dark Gravity Wave calculations and must be kept
/// to accept the existing chain. Above that height equality is exact
/// again.
pub(crate) fn verify_difficulty(
    calculated: U256,
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
) -> Result<(), ChainError> {
    let mut calculated = calculated;
    if calculated > params.pow_limit() {
        info!("difficulty hit proof of work limit: {:x}", calculated);
        calculated = params.pow_limit();
    }

    let accuracy_bytes = ((next.bits >> 24) as usize).saturating_sub(3);
    let received = next.target();

    // The calculated difficulty is to a higher precision than the
    // received one, so reduce it here.
    let mask = U256::from(0x00ff_ffffu64) << (accuracy_bytes * 8);
    calculated = calculated & mask;

    let exact = || -> Result<(), ChainError> {
        if calculated != received {
            return Err(VerificationError::DifficultyMismatch { received, calculated }.into());
        }
        Ok(())
    };

    if params.network == Network::Testnet {
        return exact();
    }

    let height = stored_prev.height() + 1;
    if height <= MAINNET_DGW3_HEIGHT {
        let mut calculated_bits = ((accuracy_bytes as u32) + 3) << 24;
        calculated_bits |= (calculated >> (accuracy_bytes * 8)).low_u64() as u32;

        let n1 = compact_to_difficulty(calculated_bits);
        let n2 = compact_to_difficulty(next.bits);

        if (n1 - n2).abs() > n1 * 0.2 {
            return Err(VerificationError::DifficultyMismatch { received, calculated }.into());
        }
        Ok(())
    } else {
        exact()
    }
}
