// ---------------------------------------------------------------------------
// Target Calculations
// ---------------------------------------------------------------------------
//
// Acceptance decisions compare raw big-integer magnitudes. Floating point is
// only used to express a difficulty and to report share difficulty.

use num_bigint::BigUint;
use num_traits::{FromPrimitive, Num, One, ToPrimitive, Zero};
use std::sync::OnceLock;
use thiserror::Error;

/// Difficulty-1 target for the Bitcoin (SHA256d) family.
pub const BITCOIN_DIFF1_HEX: &str =
    "00000000ffff0000000000000000000000000000000000000000000000000000";

/// Difficulty-1 target for the Equihash (ZCash) family.
pub const EQUIHASH_DIFF1_HEX: &str =
    "0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Fixed-point scale applied to fractional difficulties before dividing.
const DIFFICULTY_SCALE_BITS: u32 = 32;

static BITCOIN_DIFF1: OnceLock<BigUint> = OnceLock::new();
static EQUIHASH_DIFF1: OnceLock<BigUint> = OnceLock::new();
static MAX_TARGET: OnceLock<BigUint> = OnceLock::new();

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TargetError {
    #[error("difficulty must be a positive finite number, got {0}")]
    InvalidDifficulty(f64),
    #[error("invalid target hex: {0}")]
    InvalidHex(String),
}

pub fn bitcoin_diff1() -> &'static BigUint {
    BITCOIN_DIFF1.get_or_init(|| parse_const(BITCOIN_DIFF1_HEX))
}

pub fn equihash_diff1() -> &'static BigUint {
    EQUIHASH_DIFF1.get_or_init(|| parse_const(EQUIHASH_DIFF1_HEX))
}

fn max_target() -> &'static BigUint {
    MAX_TARGET.get_or_init(|| (BigUint::one() << 256u32) - BigUint::one())
}

fn parse_const(hex: &str) -> BigUint {
    // Only called with the constants above.
    BigUint::from_str_radix(hex, 16).unwrap_or_default()
}

/// Parse a hex-encoded 256-bit target (an optional `0x` prefix is accepted).
pub fn parse_target_hex(hex: &str) -> Result<BigUint, TargetError> {
    let trimmed = hex.trim().trim_start_matches("0x");
    if trimmed.is_empty() || trimmed.len() > 64 {
        return Err(TargetError::InvalidHex(hex.to_string()));
    }
    BigUint::from_str_radix(trimmed, 16).map_err(|_| TargetError::InvalidHex(hex.to_string()))
}

/// Format a target as 64 lowercase hex characters.
pub fn target_to_hex(target: &BigUint) -> String {
    format!("{:0>64}", target.to_str_radix(16))
}

/// Smallest difficulty the fixed-point conversion can represent.
pub const MIN_DIFFICULTY: f64 = 1.0 / (1u64 << DIFFICULTY_SCALE_BITS) as f64;

/// Whether `difficulty` converts to a usable target.
pub fn is_valid_difficulty(difficulty: f64) -> bool {
    difficulty.is_finite() && difficulty >= MIN_DIFFICULTY
}

/// `diff1 / difficulty`, computed in fixed point so fractional difficulties
/// (common for CPU miners and test networks) stay exact enough.
pub fn difficulty_to_target(difficulty: f64, diff1: &BigUint) -> Result<BigUint, TargetError> {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return Err(TargetError::InvalidDifficulty(difficulty));
    }

    let scale = f64::from(2u32).powi(DIFFICULTY_SCALE_BITS as i32);
    let scaled = BigUint::from_f64((difficulty * scale).round())
        .filter(|d| !d.is_zero())
        .ok_or(TargetError::InvalidDifficulty(difficulty))?;

    let target = (diff1 << DIFFICULTY_SCALE_BITS) / scaled;
    Ok(target.min(max_target().clone()))
}

/// Inverse of [`difficulty_to_target`], for reporting.
pub fn target_to_difficulty(target: &BigUint, diff1: &BigUint) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    let num = diff1.to_f64().unwrap_or(f64::MAX);
    let den = target.to_f64().unwrap_or(f64::MAX);
    num / den
}

/// Read a digest as a big-endian unsigned integer.
pub fn hash_to_biguint(hash: &[u8]) -> BigUint {
    BigUint::from_bytes_be(hash)
}

/// Difficulty actually achieved by a hash.
pub fn share_difficulty(hash: &BigUint, diff1: &BigUint) -> f64 {
    target_to_difficulty(hash, diff1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_representable_difficulty() {
        assert!(is_valid_difficulty(MIN_DIFFICULTY));
        assert!(difficulty_to_target(MIN_DIFFICULTY, bitcoin_diff1()).is_ok());
        assert!(!is_valid_difficulty(1e-300));
        assert!(difficulty_to_target(1e-300, bitcoin_diff1()).is_err());
        assert!(!is_valid_difficulty(f64::NAN));
        assert!(!is_valid_difficulty(-4.0));
    }

    #[test]
    fn diff1_constants_parse() {
        assert_eq!(target_to_hex(bitcoin_diff1()), BITCOIN_DIFF1_HEX);
        assert_eq!(target_to_hex(equihash_diff1()), EQUIHASH_DIFF1_HEX);
    }

    #[test]
    fn difficulty_one_is_diff1() {
        let t = difficulty_to_target(1.0, bitcoin_diff1()).unwrap();
        assert_eq!(&t, bitcoin_diff1());
    }

    #[test]
    fn integer_difficulty_divides_exactly() {
        let t = difficulty_to_target(1024.0, bitcoin_diff1()).unwrap();
        assert_eq!(t, bitcoin_diff1() / BigUint::from(1024u32));
    }

    #[test]
    fn fractional_difficulty_raises_target() {
        let half = difficulty_to_target(0.5, bitcoin_diff1()).unwrap();
        assert_eq!(half, bitcoin_diff1() * BigUint::from(2u32));
    }

    #[test]
    fn rejects_non_positive_difficulty() {
        assert!(difficulty_to_target(0.0, bitcoin_diff1()).is_err());
        assert!(difficulty_to_target(-3.0, bitcoin_diff1()).is_err());
        assert!(difficulty_to_target(f64::NAN, bitcoin_diff1()).is_err());
    }

    #[test]
    fn target_is_capped_at_256_bits() {
        let t = difficulty_to_target(1e-9, equihash_diff1()).unwrap();
        assert!(t.bits() <= 256);
    }

    #[test]
    fn parse_target_hex_accepts_prefix() {
        let t = parse_target_hex("0x00ff").unwrap();
        assert_eq!(t, BigUint::from(255u32));
        assert!(parse_target_hex("zz").is_err());
        assert!(parse_target_hex("").is_err());
    }

    #[test]
    fn share_difficulty_roundtrips_target() {
        let t = difficulty_to_target(4096.0, bitcoin_diff1()).unwrap();
        let d = share_difficulty(&t, bitcoin_diff1());
        assert!((d - 4096.0).abs() < 1e-6);
    }
}
