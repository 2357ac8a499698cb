/// Share routing after validation
///
/// 1. Count the share
/// 2. Hand it to the share sink
/// 3. Submit block candidates to the daemon (in the background)

use std::sync::Arc;

use super::{Share, ShareSink};
use crate::blockchain::BlockSubmitter;
use crate::metrics::prometheus as metrics;

pub struct ShareProcessor {
    sink: Arc<dyn ShareSink>,
    submitter: Option<Arc<dyn BlockSubmitter>>,
}

impl ShareProcessor {
    pub fn new(sink: Arc<dyn ShareSink>, submitter: Option<Arc<dyn BlockSubmitter>>) -> Self {
        Self { sink, submitter }
    }

    /// Route an accepted share. Sink failures are logged, never surfaced to
    /// the miner.
    pub async fn process(&self, share: Share, block: Option<Vec<u8>>) {
        metrics::inc_accepted();

        if let Err(e) = self.sink.record_share(&share).await {
            tracing::warn!(job_id = %share.job_id, miner = %share.miner, "failed to record share: {:#}", e);
        }

        if !share.is_block_candidate {
            return;
        }

        metrics::inc_block_candidates();
        tracing::info!(
            "🎉 Block candidate at height {} from {} (hash {})",
            share.block_height,
            share.miner,
            share.hash
        );

        let (Some(submitter), Some(block)) = (self.submitter.clone(), block) else {
            tracing::warn!(height = share.block_height, "block candidate not submitted: no submitter");
            return;
        };

        tokio::spawn(async move {
            metrics::inc_block_submit_attempts();
            match submitter.submit_block(&share, &block).await {
                Ok(true) => {
                    tracing::info!("✅ Block {} accepted by daemon", share.block_height);
                }
                Ok(false) => {
                    metrics::inc_block_submit_rejected();
                    tracing::warn!("❌ Block {} rejected by daemon", share.block_height);
                }
                Err(e) => {
                    metrics::inc_block_submit_rejected();
                    tracing::error!("Block {} submission failed: {:#}", share.block_height, e);
                }
            }
        });
    }
}
