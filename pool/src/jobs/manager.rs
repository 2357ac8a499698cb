//! Current job, recent-job history and job rotation.

use anyhow::Context;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stratum_core::HashAlgorithm;

use super::job::{Job, ValidatedShare};
use crate::blockchain::template::BlockTemplate;
use crate::coin::JobSerializer;
use crate::metrics::prometheus as metrics;
use crate::session::ShareContext;
use crate::stratum::protocol::{ShareSubmission, StratumError};
use crate::stratum::registry::ConnectionRegistry;

pub struct JobManager {
    serializer: Arc<dyn JobSerializer>,
    hasher: Arc<dyn HashAlgorithm>,
    registry: Arc<ConnectionRegistry>,
    max_active_jobs: usize,
    /// Newest first. Its front is the current job.
    jobs: RwLock<VecDeque<Arc<Job>>>,
    next_job_id: AtomicU64,
}

impl JobManager {
    pub fn new(
        serializer: Arc<dyn JobSerializer>,
        hasher: Arc<dyn HashAlgorithm>,
        registry: Arc<ConnectionRegistry>,
        max_active_jobs: usize,
    ) -> Self {
        Self {
            serializer,
            hasher,
            registry,
            max_active_jobs: max_active_jobs.max(1),
            jobs: RwLock::new(VecDeque::new()),
            next_job_id: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn extranonce2_size(&self) -> usize {
        self.serializer.extranonce2_size()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.jobs.read().front().cloned()
    }

    pub fn find_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().iter().find(|j| j.id() == id).cloned()
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn connected_miner_count(&self) -> usize {
        self.registry.connected_miner_count()
    }

    /// Entry point for new templates. Templates on the same tip as the
    /// current job are ignored; see [`JobManager::update`] to force a refresh.
    pub fn on_new_template(&self, template: BlockTemplate) -> anyhow::Result<Option<Arc<Job>>> {
        self.update(template, false)
    }

    /// Turn `template` into the current job and broadcast it.
    ///
    /// A template with a new previous hash or a higher height is a new block
    /// (`clean_jobs`). Otherwise it only becomes a job when `force` is set,
    /// and miners may keep their earlier work.
    pub fn update(&self, template: BlockTemplate, force: bool) -> anyhow::Result<Option<Arc<Job>>> {
        let network_target = template
            .network_target()
            .with_context(|| format!("template at height {} has a bad target", template.height))?;

        let job = {
            let mut jobs = self.jobs.write();

            let is_new = match jobs.front() {
                None => true,
                Some(current) => {
                    current.template().prev_hash != template.prev_hash
                        || template.height > current.height()
                }
            };
            if !is_new && !force {
                return Ok(None);
            }

            let coin = self
                .serializer
                .prepare(&template)
                .with_context(|| format!("{} serializer rejected template", self.serializer.name()))?;

            let id = self.next_job_id();
            let height = template.height;
            let job = Arc::new(Job::new(
                id,
                template,
                coin,
                network_target,
                self.hasher.diff1(),
                is_new,
            ));

            jobs.push_front(Arc::clone(&job));
            while jobs.len() > self.max_active_jobs {
                jobs.pop_back();
            }

            metrics::inc_template_updates();
            metrics::set_template_height(height);
            job
        };

        if job.clean_jobs() {
            tracing::info!(
                "⛏️  New job {} at height {} (network difficulty {:.2})",
                job.id(),
                job.height(),
                job.network_difficulty()
            );
        } else {
            tracing::debug!(job_id = job.id(), height = job.height(), "job refreshed");
        }

        self.broadcast_job(&job);
        Ok(Some(job))
    }

    pub fn broadcast_job(&self, job: &Job) -> usize {
        self.registry.broadcast_job(job)
    }

    /// Resolve the submission's job and validate the share against it.
    pub fn submit_share(
        &self,
        ctx: &ShareContext,
        submission: &ShareSubmission,
    ) -> Result<ValidatedShare, StratumError> {
        let job = self
            .find_job(&submission.job_id)
            .ok_or_else(StratumError::job_not_found)?;

        job.validate_share(
            ctx,
            submission,
            self.serializer.extranonce2_size(),
            self.serializer.nonce_size(),
            self.hasher.as_ref(),
            unix_now(),
        )
    }

    fn next_job_id(&self) -> String {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:08x}", id)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
