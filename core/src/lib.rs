//! Proof-of-work primitives shared by the pool service.
//!
//! Everything here is coin-agnostic: difficulty/target arithmetic on 256-bit
//! magnitudes and the hash-function seam that coin families plug into.

pub mod pow;

pub use pow::hash::{HashAlgorithm, Sha256d};
pub use pow::target::{
    difficulty_to_target, hash_to_biguint, is_valid_difficulty, parse_target_hex,
    share_difficulty, target_to_difficulty, target_to_hex, TargetError, MIN_DIFFICULTY,
};
