/// Mining shares module
///
/// The share record produced by job validation, the sink it is handed to,
/// and the processor that routes accepted shares.

pub mod processor;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

pub use processor::ShareProcessor;
pub use sink::{ChannelShareSink, ShareSink};

/// Outcome of one accepted submission. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Share {
    pub job_id: String,
    pub miner: String,
    pub worker: Option<String>,
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    /// Difficulty credited (the miner's effective difficulty).
    pub difficulty: f64,
    /// Difficulty the hash actually reached.
    pub share_difficulty: f64,
    pub network_difficulty: f64,
    pub block_height: u64,
    pub is_block_candidate: bool,
    pub hash: String,
    pub block_hash: Option<String>,
    pub created: DateTime<Utc>,
}
