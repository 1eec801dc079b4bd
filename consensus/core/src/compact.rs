//! The compact ("nBits") encoding of 256-bit difficulty targets.
//!
//! A compact value packs a target into 32 bits: one exponent byte (the
//! size of the target in bytes) followed by a three-byte mantissa.

use primitive_types::U256;

/// Decodes a compact difficulty encoding into a full 256-bit target.
pub fn compact_to_target(bits: u32) -> U256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;

    if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3))
    }
}

/// Encodes a 256-bit target into its compact representation.
pub fn target_to_compact(target: U256) -> u32 {
    let mut bytes = [0u8; 32];
    target.to_big_endian(&mut bytes);

    let mut size = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if byte != 0 {
            size = 32 - i;
            break;
        }
    }
    if size == 0 {
        return 0;
    }

    let mut mantissa: u32 = if size >= 3 {
        u32::from_be_bytes([0, bytes[32 - size], bytes[33 - size], bytes[34 - size]])
    } else {
        (target.low_u64() as u32) << (8 * (3 - size))
    };

    // The high bit of the mantissa is a sign bit in the legacy encoding,
    // so bump the exponent rather than produce a negative number.
    let mut size = size as u32;
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }

    (size << 24) | mantissa
}

/// The amount of work in a block with the given target:
/// floor(2^256 / (target + 1)).
pub fn work_from_target(target: U256) -> U256 {
    if target.is_zero() {
        return U256::MAX;
    }
    // 2^256 does not fit in a U256; use ~target / (target + 1) + 1,
    // which is the same quotient.
    (!target / (target + U256::one())) + U256::one()
}

/// Reconstructs the floating-point difficulty implied by a compact
/// target, relative to the maximum target 0xffff * 2^208.
///
/// Kept for the historical tolerance rule in difficulty verification.
pub fn compact_to_difficulty(bits: u32) -> f64 {
    let mut shift = (bits >> 24) & 0xff;
    let mut diff = 0x0000_ffff as f64 / (bits & 0x00ff_ffff) as f64;

    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }

    diff
}
