pub mod hash;
pub mod target;

pub use target::{bitcoin_diff1, equihash_diff1};
