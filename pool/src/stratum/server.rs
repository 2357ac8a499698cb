/// Stratum server
///
/// Accept loop plus the pool-wide state every connection works against.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connection::WorkerConnection;
use super::extranonce::ExtraNonceProvider;
use super::registry::ConnectionRegistry;
use crate::auth::Authorizer;
use crate::banning::BanManager;
use crate::config::{BanningConfig, PoolConfig, StratumConfig};
use crate::jobs::JobManager;
use crate::shares::ShareProcessor;
use crate::vardiff::VarDiffManager;

pub struct StratumServer {
    config: StratumConfig,
    banning: BanningConfig,
    registry: Arc<ConnectionRegistry>,
    jobs: Arc<JobManager>,
    bans: Arc<BanManager>,
    vardiff: Option<VarDiffManager>,
    authorizer: Arc<dyn Authorizer>,
    shares: Arc<ShareProcessor>,
    extranonce: ExtraNonceProvider,
}

impl StratumServer {
    pub fn new(
        config: &PoolConfig,
        jobs: Arc<JobManager>,
        bans: Arc<BanManager>,
        authorizer: Arc<dyn Authorizer>,
        shares: Arc<ShareProcessor>,
    ) -> Self {
        Self {
            config: config.stratum.clone(),
            banning: config.banning.clone(),
            registry: Arc::clone(jobs.registry()),
            jobs,
            bans,
            vardiff: config.vardiff.map(VarDiffManager::new),
            authorizer,
            shares,
            extranonce: ExtraNonceProvider::new(config.stratum.instance_id),
        }
    }

    pub fn config(&self) -> &StratumConfig {
        &self.config
    }

    pub fn banning(&self) -> &BanningConfig {
        &self.banning
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn bans(&self) -> &Arc<BanManager> {
        &self.bans
    }

    pub fn vardiff(&self) -> Option<&VarDiffManager> {
        self.vardiff.as_ref()
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    pub fn shares(&self) -> &Arc<ShareProcessor> {
        &self.shares
    }

    pub fn extranonce(&self) -> &ExtraNonceProvider {
        &self.extranonce
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connected_miner_count()
    }

    /// Bind with SO_REUSEADDR to avoid "Address already in use" on restart.
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = Self::bind(&self.config.listen)?;
        tracing::info!("✅ Stratum server listening on {} (SO_REUSEADDR)", self.config.listen);

        if self.banning.enabled {
            self.bans
                .spawn_sweeper(self.banning.sweep_interval(), cancel.clone());
        }

        self.serve(listener, cancel).await;
        Ok(())
    }

    /// Accept loop. Each connection runs on its own task with a child of
    /// `cancel`, so shutdown reaches every miner.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if self.bans.is_banned(&peer_addr.ip()) {
                tracing::debug!("🚫 Rejecting banned peer {}", peer_addr);
                continue;
            }

            let conn_count = self.registry.connected_miner_count();
            if conn_count >= self.config.max_connections {
                tracing::warn!(
                    "🚫 Max connections ({}) reached, rejecting {}",
                    self.config.max_connections,
                    peer_addr
                );
                continue;
            }

            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
            }

            tracing::info!("🔌 New connection from {}", peer_addr);

            let connection = WorkerConnection::new(Arc::clone(&self), peer_addr, cancel.child_token());
            tokio::spawn(connection.run(socket));
        }

        tracing::info!("Stratum server stopped accepting connections");
    }
}
