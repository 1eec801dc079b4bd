//! Kimoto Gravity Well.
//!
//! Walks backwards accumulating an average difficulty and the ratio of
//! actual to intended block rate, stopping early once the ratio leaves
//! an "event horizon" band that narrows as more blocks are sampled.

use consensus_core::{BlockHeader, NetworkParams, StoredBlock};
use primitive_types::U256;

use super::{step_average, verify_difficulty};
use crate::chain::ChainBackend;
use crate::error::ChainError;

const TARGET_BLOCKS_SPACING_SECONDS: u64 = 150;
const TIME_DAY_SECONDS: u64 = 60 * 60 * 24;
const PAST_SECONDS_MIN: u64 = TIME_DAY_SECONDS / 40;
const PAST_SECONDS_MAX: u64 = TIME_DAY_SECONDS * 7;
const PAST_BLOCKS_MIN: u64 = PAST_SECONDS_MIN / TARGET_BLOCKS_SPACING_SECONDS;
const PAST_BLOCKS_MAX: u64 = PAST_SECONDS_MAX / TARGET_BLOCKS_SPACING_SECONDS;

/// Height after which the rate floor and the monotonic-time clamp kick
/// in, slowing upward difficulty swings and time-travel games.
const LATE_RULES_HEIGHT: u64 = 646_120;

pub(super) fn check(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
) -> Result<(), ChainError> {
    kimoto_gravity_well(
        stored_prev,
        next,
        params,
        backend,
        TARGET_BLOCKS_SPACING_SECONDS,
        PAST_BLOCKS_MIN,
        PAST_BLOCKS_MAX,
    )
}

fn kimoto_gravity_well(
    stored_prev: &StoredBlock,
    next: &BlockHeader,
    params: &NetworkParams,
    backend: &dyn ChainBackend,
    target_spacing_seconds: u64,
    past_blocks_min: u64,
    past_blocks_max: u64,
) -> Result<(), ChainError> {
    let block_last_solved = stored_prev;
    if block_last_solved.height() == 0 || block_last_solved.height() < past_blocks_min {
        return verify_difficulty(params.pow_limit(), stored_prev, next, params);
    }

    let mut block_reading = *stored_prev;
    let mut past_blocks_mass = 0u64;
    let mut past_rate_actual_seconds: i64 = 0;
    let mut past_rate_target_seconds: i64 = 0;
    let mut past_rate_adjustment_ratio = 1.0f64;
    let mut past_difficulty_average = U256::zero();
    let mut past_difficulty_average_prev = U256::zero();
    let mut latest_block_time = block_last_solved.header().timestamp;

    let mut i = 1u64;
    while block_reading.height() > 0 {
        if i > past_blocks_max {
            break;
        }
        past_blocks_mass += 1;

        if i == 1 {
            past_difficulty_average = block_reading.header().target();
        } else {
            past_difficulty_average =
                step_average(block_reading.header().target(), past_difficulty_average_prev, i);
        }
        past_difficulty_average_prev = past_difficulty_average;

        if block_reading.height() > LATE_RULES_HEIGHT
            && latest_block_time < block_reading.header().timestamp
        {
            // Eliminates the ability to go back in time.
            latest_block_time = block_reading.header().timestamp;
        }

        past_rate_actual_seconds =
            block_last_solved.header().timestamp as i64 - block_reading.header().timestamp as i64;
        past_rate_target_seconds = (target_spacing_seconds * past_blocks_mass) as i64;
        past_rate_adjustment_ratio = 1.0;
        if block_reading.height() > LATE_RULES_HEIGHT {
            // This should slow down the upward difficulty change.
            if past_rate_actual_seconds < 5 {
                past_rate_actual_seconds = 5;
            }
        } else if past_rate_actual_seconds < 0 {
            past_rate_actual_seconds = 0;
        }
        if past_rate_actual_seconds != 0 && past_rate_target_seconds != 0 {
            past_rate_adjustment_ratio = past_rate_target_seconds as f64 / past_rate_actual_seconds as f64;
        }

        let event_horizon_deviation = 1.0 + 0.7084 * (past_blocks_mass as f64 / 28.2).powf(-1.228);
        let event_horizon_deviation_fast = event_horizon_deviation;
        let event_horizon_deviation_slow = 1.0 / event_horizon_deviation;

        if past_blocks_mass >= past_blocks_min
            && (past_rate_adjustment_ratio <= event_horizon_deviation_slow
                || past_rate_adjustment_ratio >= event_horizon_deviation_fast)
        {
            break;
        }

        match backend.get(&block_reading.header().prev_block_hash)? {
            Some(prev) => block_reading = prev,
            // Under checkpointed sync there may not be enough history
            // for this adjustment; skip the check until there is.
            None => return Ok(()),
        }
        i += 1;
    }

    let mut new_difficulty = past_difficulty_average;
    if past_rate_actual_seconds != 0 && past_rate_target_seconds != 0 {
        new_difficulty = new_difficulty * U256::from(past_rate_actual_seconds as u64);
        new_difficulty = new_difficulty / U256::from(past_rate_target_seconds as u64);
    }

    verify_difficulty(new_difficulty, stored_prev, next, params)
}
