// Stratum pool core: template polling, job broadcast, share validation,
// vardiff and banning behind one Stratum listener.

use anyhow::Context;
use axum::{http::header, response::IntoResponse, routing::get};
use std::sync::Arc;
use stratum_core::Sha256d;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stratum_pool::auth;
use stratum_pool::banning::BanManager;
use stratum_pool::blockchain::{BlockSubmitter, DaemonClient, TemplatePoller, TemplateSource};
use stratum_pool::coin::GenericSerializer;
use stratum_pool::config::PoolConfig;
use stratum_pool::jobs::JobManager;
use stratum_pool::metrics::prometheus as metrics;
use stratum_pool::shares::{ChannelShareSink, ShareProcessor};
use stratum_pool::stratum::{ConnectionRegistry, StratumServer};

const SHARE_QUEUE_CAPACITY: usize = 10_000;

async fn api_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = PoolConfig::load().context("failed to load pool configuration")?;
    tracing::info!("🚀 Stratum pool starting on {}", cfg.stratum.listen);

    let cancel = CancellationToken::new();

    let daemon = Arc::new(DaemonClient::new(&cfg.daemon)?);
    let registry = Arc::new(ConnectionRegistry::new());
    let jobs = Arc::new(JobManager::new(
        Arc::new(GenericSerializer::new(cfg.stratum.extranonce2_size)),
        Arc::new(Sha256d),
        registry,
        cfg.jobs.max_active_jobs,
    ));

    // Accepted shares leave the real-time core through this queue.
    let (sink, mut accepted) = ChannelShareSink::new(SHARE_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(share) = accepted.recv().await {
            tracing::debug!(
                miner = %share.miner,
                difficulty = share.difficulty,
                height = share.block_height,
                "share accepted"
            );
        }
    });
    let submitter: Arc<dyn BlockSubmitter> = daemon.clone();
    let shares = Arc::new(ShareProcessor::new(Arc::new(sink), Some(submitter)));

    let server = Arc::new(StratumServer::new(
        &cfg,
        Arc::clone(&jobs),
        Arc::new(BanManager::new()),
        auth::from_config(&cfg.auth),
        shares,
    ));

    let source: Arc<dyn TemplateSource> = daemon;
    let poller = TemplatePoller::new(
        source,
        Arc::clone(&jobs),
        cfg.jobs.poll_interval(),
        cfg.jobs.rebroadcast_timeout(),
    );
    let poller_task = tokio::spawn(poller.run(cancel.clone()));

    if let Some(listen) = cfg.metrics_listen.clone() {
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind metrics listener {}", listen))?;
        let api = axum::Router::new().route("/metrics", get(api_metrics));
        let api_cancel = cancel.clone();
        tracing::info!("📡 Metrics listening on {}", listen);
        tokio::spawn(async move {
            let shutdown = async move { api_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, api).with_graceful_shutdown(shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    let server_task = tokio::spawn(Arc::clone(&server).run(cancel.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        res = server_task => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Stratum server failed: {:#}", e),
                Err(e) => tracing::error!("Stratum server task panicked: {}", e),
            }
        }
    }

    cancel.cancel();
    let _ = poller_task.await;

    tracing::info!("🏁 Pool shut down cleanly");
    Ok(())
}
