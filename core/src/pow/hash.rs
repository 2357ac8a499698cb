use num_bigint::BigUint;
use sha2::{Digest, Sha256};

use super::target::bitcoin_diff1;

/// Turns a serialized candidate header into a proof-of-work digest.
///
/// The returned bytes are read as a big-endian integer when compared against
/// targets, so implementations return them in numeric (display) order.
pub trait HashAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn digest(&self, header: &[u8]) -> [u8; 32];

    /// Difficulty-1 target of this algorithm's coin family.
    fn diff1(&self) -> &BigUint;
}

/// Double SHA-256, Bitcoin family.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256d;

impl HashAlgorithm for Sha256d {
    fn name(&self) -> &'static str {
        "sha256d"
    }

    fn digest(&self, header: &[u8]) -> [u8; 32] {
        let first = Sha256::digest(header);
        let second = Sha256::digest(first);
        let mut out: [u8; 32] = second.into();
        // Bitcoin compares the hash as a little-endian number.
        out.reverse();
        out
    }

    fn diff1(&self) -> &BigUint {
        bitcoin_diff1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_genesis_header() {
        // Bitcoin genesis block header.
        let header = hex::decode(concat!(
            "01000000",
            "0000000000000000000000000000000000000000000000000000000000000000",
            "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
            "29ab5f49",
            "ffff001d",
            "1dac2b7c"
        ))
        .unwrap();
        let digest = Sha256d.digest(&header);
        assert_eq!(
            hex::encode(digest),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }
}
