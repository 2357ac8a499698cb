/// Block template poller
///
/// Periodically fetches templates and feeds them to the job manager. A
/// template on an unchanged tip is re-issued once the rebroadcast timeout
/// passes so miners keep fresh work.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::TemplateSource;
use crate::jobs::{Job, JobManager};
use crate::metrics::prometheus as metrics;

pub struct TemplatePoller {
    source: Arc<dyn TemplateSource>,
    jobs: Arc<JobManager>,
    poll_interval: Duration,
    rebroadcast_timeout: Duration,
}

impl TemplatePoller {
    pub fn new(
        source: Arc<dyn TemplateSource>,
        jobs: Arc<JobManager>,
        poll_interval: Duration,
        rebroadcast_timeout: Duration,
    ) -> Self {
        tracing::info!(
            "TemplatePoller: interval={}ms, rebroadcast={}s",
            poll_interval.as_millis(),
            rebroadcast_timeout.as_secs()
        );

        Self {
            source,
            jobs,
            poll_interval,
            rebroadcast_timeout,
        }
    }

    /// Fetch one template and hand it to the job manager.
    pub async fn poll_once(&self, force: bool) -> Result<Option<Arc<Job>>> {
        let template = self.source.get_block_template().await?;
        self.jobs.update(template, force)
    }

    /// Poll until cancelled. Errors are logged and counted; the current job
    /// stays valid until a template succeeds.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut last_job_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let force = last_job_at
                .map(|at| at.elapsed() >= self.rebroadcast_timeout)
                .unwrap_or(false);

            match self.poll_once(force).await {
                Ok(Some(_)) => last_job_at = Some(Instant::now()),
                Ok(None) => {}
                Err(e) => {
                    metrics::inc_template_fetch_errors();
                    tracing::error!("Failed to fetch block template: {:#}", e);
                }
            }
        }

        tracing::info!("TemplatePoller stopped");
    }
}
