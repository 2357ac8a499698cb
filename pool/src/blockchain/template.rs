use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratum_core::{parse_target_hex, TargetError};

/// Block template as delivered by the template source.
///
/// Only the fields the pool core reasons about are typed; everything the
/// coin serializer needs travels in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub height: u64,
    pub prev_hash: String,
    /// Earliest header time the daemon accepts, unix seconds.
    pub cur_time: u32,
    /// Network target, hex.
    pub target: String,
    #[serde(default)]
    pub data: Value,
}

impl BlockTemplate {
    pub fn network_target(&self) -> Result<BigUint, TargetError> {
        parse_target_hex(&self.target)
    }
}
