use anyhow::{anyhow, Context};
use serde_json::{json, Value};

use super::{CoinJob, JobSerializer};
use crate::blockchain::template::BlockTemplate;
use crate::stratum::protocol::StratumError;

/// Reference coin family.
///
/// The header is `prev_hash || coinbase1 || extraNonce1 || extraNonce2 ||
/// coinbase2 || nTime (BE) || nonce`. Templates carry `coinbase1` and
/// `coinbase2` as hex in `data`.
#[derive(Debug, Clone)]
pub struct GenericSerializer {
    extranonce2_size: usize,
}

impl GenericSerializer {
    pub fn new(extranonce2_size: usize) -> Self {
        Self { extranonce2_size }
    }
}

impl Default for GenericSerializer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl JobSerializer for GenericSerializer {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn extranonce2_size(&self) -> usize {
        self.extranonce2_size
    }

    fn prepare(&self, template: &BlockTemplate) -> anyhow::Result<Box<dyn CoinJob>> {
        let field = |name: &str| -> anyhow::Result<(String, Vec<u8>)> {
            let hex_str = template
                .data
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("template data is missing {}", name))?
                .to_ascii_lowercase();
            let bytes = hex::decode(&hex_str).with_context(|| format!("template {} is not hex", name))?;
            Ok((hex_str, bytes))
        };

        let (coinbase1_hex, coinbase1) = field("coinbase1")?;
        let (coinbase2_hex, coinbase2) = field("coinbase2")?;
        let prev_hash = hex::decode(&template.prev_hash).context("template prev_hash is not hex")?;

        Ok(Box::new(GenericJob {
            prev_hash_hex: template.prev_hash.to_ascii_lowercase(),
            prev_hash,
            coinbase1_hex,
            coinbase1,
            coinbase2_hex,
            coinbase2,
            height: template.height,
            ntime: template.cur_time,
        }))
    }
}

/// Typed notify payload of the reference family.
#[derive(Debug, Clone)]
pub struct GenericJob {
    pub prev_hash_hex: String,
    pub prev_hash: Vec<u8>,
    pub coinbase1_hex: String,
    pub coinbase1: Vec<u8>,
    pub coinbase2_hex: String,
    pub coinbase2: Vec<u8>,
    pub height: u64,
    pub ntime: u32,
}

impl CoinJob for GenericJob {
    fn notify_params(&self, job_id: &str, clean_jobs: bool) -> Vec<Value> {
        vec![
            json!(job_id),
            json!(self.prev_hash_hex),
            json!(self.coinbase1_hex),
            json!(self.coinbase2_hex),
            json!(self.height),
            json!(format!("{:08x}", self.ntime)),
            json!(clean_jobs),
        ]
    }

    fn build_header(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
        ntime: u32,
        nonce: &[u8],
    ) -> Result<Vec<u8>, StratumError> {
        if nonce.len() != 4 {
            return Err(StratumError::invalid_params("incorrect size of nonce"));
        }
        let mut header = Vec::with_capacity(
            self.prev_hash.len()
                + self.coinbase1.len()
                + extranonce1.len()
                + extranonce2.len()
                + self.coinbase2.len()
                + 8,
        );
        header.extend_from_slice(&self.prev_hash);
        header.extend_from_slice(&self.coinbase1);
        header.extend_from_slice(extranonce1);
        header.extend_from_slice(extranonce2);
        header.extend_from_slice(&self.coinbase2);
        header.extend_from_slice(&ntime.to_be_bytes());
        header.extend_from_slice(nonce);
        Ok(header)
    }
}
