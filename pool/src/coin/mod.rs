//! Coin family seam.
//!
//! A [`JobSerializer`] is picked when the pool is built. For every template it
//! prepares a [`CoinJob`], the typed per-family view of that template which
//! knows how to render `mining.notify` params and rebuild candidate headers.

pub mod generic;

use serde_json::Value;
use std::fmt::Debug;

use crate::blockchain::template::BlockTemplate;
use crate::stratum::protocol::StratumError;

pub use generic::{GenericJob, GenericSerializer};

pub trait CoinJob: Debug + Send + Sync {
    /// Positional `mining.notify` params, job id first.
    fn notify_params(&self, job_id: &str, clean_jobs: bool) -> Vec<Value>;

    fn build_header(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
        ntime: u32,
        nonce: &[u8],
    ) -> Result<Vec<u8>, StratumError>;

    /// Full block for submission. Families whose header is the block keep
    /// the default.
    fn build_block(&self, header: &[u8], _extranonce1: &[u8], _extranonce2: &[u8]) -> Vec<u8> {
        header.to_vec()
    }
}

pub trait JobSerializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn extranonce2_size(&self) -> usize;

    fn nonce_size(&self) -> usize {
        4
    }

    fn prepare(&self, template: &BlockTemplate) -> anyhow::Result<Box<dyn CoinJob>>;
}
