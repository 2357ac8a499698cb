/// Blockchain communication module
/// Template source and block submission, plus the daemon client behind both

pub mod rpc_client;
pub mod template;
pub mod template_manager;

use async_trait::async_trait;

use crate::shares::Share;

pub use rpc_client::DaemonClient;
pub use template::BlockTemplate;
pub use template_manager::TemplatePoller;

/// Where block templates come from.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn get_block_template(&self) -> anyhow::Result<BlockTemplate>;
}

/// Hands a solved block to the network. `Ok(false)` means the daemon
/// answered and rejected it.
#[async_trait]
pub trait BlockSubmitter: Send + Sync {
    async fn submit_block(&self, share: &Share, block: &[u8]) -> anyhow::Result<bool>;
}
