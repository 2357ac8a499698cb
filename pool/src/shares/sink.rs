use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Share;

/// Destination for accepted shares (persistence, payout accounting).
#[async_trait]
pub trait ShareSink: Send + Sync {
    async fn record_share(&self, share: &Share) -> anyhow::Result<()>;
}

/// Forwards shares to a bounded queue drained by the persistence layer.
/// Never waits: a full queue is reported as an error and the share dropped.
#[derive(Debug, Clone)]
pub struct ChannelShareSink {
    tx: mpsc::Sender<Share>,
}

impl ChannelShareSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Share>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ShareSink for ChannelShareSink {
    async fn record_share(&self, share: &Share) -> anyhow::Result<()> {
        self.tx
            .try_send(share.clone())
            .map_err(|e| anyhow!("share queue unavailable: {}", e))
    }
}
