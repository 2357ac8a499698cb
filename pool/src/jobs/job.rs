//! A unit of work and the share validation that runs against it.

use chrono::Utc;
use num_bigint::BigUint;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;
use stratum_core::{
    difficulty_to_target, hash_to_biguint, share_difficulty, target_to_difficulty, HashAlgorithm,
};

use crate::blockchain::template::BlockTemplate;
use crate::coin::CoinJob;
use crate::session::ShareContext;
use crate::shares::Share;
use crate::stratum::protocol::{ShareSubmission, StratumError};

/// How far past the pool's clock a submitted nTime may be, in seconds.
pub const MAX_FUTURE_NTIME_SECS: u64 = 7200;

/// Duplicate-detection key. Fields are decoded from hex, so two submissions
/// differing only in letter case collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    extranonce1: Vec<u8>,
    extranonce2: Vec<u8>,
    ntime: u32,
    nonce: Vec<u8>,
}

/// An accepted share plus the serialized block when it is a block candidate.
#[derive(Debug, Clone)]
pub struct ValidatedShare {
    pub share: Share,
    pub block: Option<Vec<u8>>,
}

/// Work derived from one template. Everything but the set of seen
/// submissions is fixed at construction.
#[derive(Debug)]
pub struct Job {
    id: String,
    template: BlockTemplate,
    coin: Box<dyn CoinJob>,
    network_target: BigUint,
    network_difficulty: f64,
    clean_jobs: bool,
    created_at: Instant,
    seen_shares: Mutex<HashSet<ShareKey>>,
}

impl Job {
    pub fn new(
        id: String,
        template: BlockTemplate,
        coin: Box<dyn CoinJob>,
        network_target: BigUint,
        diff1: &BigUint,
        clean_jobs: bool,
    ) -> Self {
        let network_difficulty = target_to_difficulty(&network_target, diff1);
        Self {
            id,
            template,
            coin,
            network_target,
            network_difficulty,
            clean_jobs,
            created_at: Instant::now(),
            seen_shares: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn height(&self) -> u64 {
        self.template.height
    }

    pub fn network_target(&self) -> &BigUint {
        &self.network_target
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    /// Whether miners should drop earlier work (new block) for this job.
    pub fn clean_jobs(&self) -> bool {
        self.clean_jobs
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn notify_params(&self, clean_jobs: bool) -> Vec<Value> {
        self.coin.notify_params(&self.id, clean_jobs)
    }

    pub fn submission_count(&self) -> usize {
        self.seen_shares.lock().len()
    }

    /// Validate a submission against this job.
    ///
    /// Order: field formats, duplicate check (atomic with recording the
    /// submission), nTime window, header hash against the network target and
    /// the miner's target.
    pub fn validate_share(
        &self,
        ctx: &ShareContext,
        submission: &ShareSubmission,
        extranonce2_size: usize,
        nonce_size: usize,
        hasher: &dyn HashAlgorithm,
        now_unix: u64,
    ) -> Result<ValidatedShare, StratumError> {
        let extranonce2 = decode_field(&submission.extranonce2, extranonce2_size, "extraNonce2")?;
        let ntime_bytes: [u8; 4] = decode_field(&submission.ntime, 4, "nTime")?
            .try_into()
            .map_err(|_| StratumError::invalid_params("incorrect size of nTime"))?;
        let ntime = u32::from_be_bytes(ntime_bytes);
        let nonce = decode_field(&submission.nonce, nonce_size, "nonce")?;

        let key = ShareKey {
            extranonce1: ctx.extranonce1.clone(),
            extranonce2: extranonce2.clone(),
            ntime,
            nonce: nonce.clone(),
        };
        if !self.seen_shares.lock().insert(key) {
            return Err(StratumError::duplicate_share());
        }

        if ntime < self.template.cur_time
            || u64::from(ntime) > now_unix.saturating_add(MAX_FUTURE_NTIME_SECS)
        {
            return Err(StratumError::ntime_out_of_range());
        }

        let header = self
            .coin
            .build_header(&ctx.extranonce1, &extranonce2, ntime, &nonce)?;
        let digest = hasher.digest(&header);
        let hash_value = hash_to_biguint(&digest);
        let diff1 = hasher.diff1();
        let achieved = share_difficulty(&hash_value, diff1);

        let is_block_candidate = hash_value < self.network_target;
        let difficulty = ctx.effective_difficulty(self.created_at);

        if !is_block_candidate {
            let miner_target = difficulty_to_target(difficulty, diff1)
                .map_err(|e| StratumError::other(e.to_string()))?;
            if hash_value >= miner_target {
                return Err(StratumError::low_difficulty(achieved));
            }
        }

        let hash = hex::encode(digest);
        let block = is_block_candidate
            .then(|| self.coin.build_block(&header, &ctx.extranonce1, &extranonce2));

        let share = Share {
            job_id: self.id.clone(),
            miner: ctx.miner.clone(),
            worker: ctx.worker.clone(),
            ip: ctx.ip,
            user_agent: ctx.user_agent.clone(),
            difficulty,
            share_difficulty: achieved,
            network_difficulty: self.network_difficulty,
            block_height: self.template.height,
            is_block_candidate,
            block_hash: is_block_candidate.then(|| hash.clone()),
            hash,
            created: Utc::now(),
        };

        Ok(ValidatedShare { share, block })
    }
}

fn decode_field(value: &str, size: usize, name: &str) -> Result<Vec<u8>, StratumError> {
    if value.len() != size * 2 {
        return Err(StratumError::invalid_params(format!("incorrect size of {}", name)));
    }
    hex::decode(value).map_err(|_| StratumError::invalid_params(format!("{} is not hex", name)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coin::{GenericSerializer, JobSerializer};
    use crate::stratum::protocol::StratumErrorCode;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;
    use stratum_core::pow::bitcoin_diff1;
    use stratum_core::target_to_hex;

    pub(crate) const CUR_TIME: u32 = 1_700_000_000;
    pub(crate) const NOW: u64 = 1_700_000_100;

    /// Returns the same digest for every header.
    pub(crate) struct FixedHasher(pub [u8; 32]);

    impl FixedHasher {
        pub(crate) fn of(value: &BigUint) -> Self {
            let raw = value.to_bytes_be();
            let mut out = [0u8; 32];
            out[32 - raw.len()..].copy_from_slice(&raw);
            Self(out)
        }
    }

    impl HashAlgorithm for FixedHasher {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn digest(&self, _header: &[u8]) -> [u8; 32] {
            self.0
        }
        fn diff1(&self) -> &BigUint {
            bitcoin_diff1()
        }
    }

    pub(crate) fn template(network_difficulty: u32) -> BlockTemplate {
        let target = bitcoin_diff1() / BigUint::from(network_difficulty);
        BlockTemplate {
            height: 500,
            prev_hash: "11".repeat(32),
            cur_time: CUR_TIME,
            target: target_to_hex(&target),
            data: json!({"coinbase1": "aa", "coinbase2": "bb"}),
        }
    }

    fn job() -> Job {
        let tpl = template(1_000_000);
        let coin = GenericSerializer::default().prepare(&tpl).unwrap();
        let target = tpl.network_target().unwrap();
        Job::new("00000001".into(), tpl, coin, target, bitcoin_diff1(), true)
    }

    fn ctx(extranonce1: [u8; 4]) -> ShareContext {
        ShareContext::new(extranonce1.to_vec(), 1024.0, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
    }

    fn submission(nonce: &str) -> ShareSubmission {
        ShareSubmission {
            worker: "miner.rig".into(),
            job_id: "00000001".into(),
            extranonce2: "00000001".into(),
            ntime: format!("{:08x}", CUR_TIME + 30),
            nonce: nonce.into(),
        }
    }

    fn miner_target() -> BigUint {
        difficulty_to_target(1024.0, bitcoin_diff1()).unwrap()
    }

    fn validate(
        job: &Job,
        ctx: &ShareContext,
        sub: &ShareSubmission,
        hasher: &FixedHasher,
    ) -> Result<ValidatedShare, StratumError> {
        job.validate_share(ctx, sub, 4, 4, hasher, NOW)
    }

    #[test]
    fn accepts_share_between_targets() {
        let job = job();
        let hasher = FixedHasher::of(&(miner_target() - 1u32));
        let out = validate(&job, &ctx([0, 0, 0, 1]), &submission("deadbeef"), &hasher).unwrap();
        assert!(!out.share.is_block_candidate);
        assert!(out.block.is_none());
        assert_eq!(out.share.difficulty, 1024.0);
        assert_eq!(out.share.block_height, 500);
        assert!((out.share.network_difficulty - 1_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn hash_equal_to_miner_target_is_low_difficulty() {
        let job = job();
        let hasher = FixedHasher::of(&miner_target());
        let err = validate(&job, &ctx([0, 0, 0, 1]), &submission("deadbeef"), &hasher).unwrap_err();
        assert_eq!(err.code, StratumErrorCode::LowDifficultyShare);
    }

    #[test]
    fn hash_equal_to_network_target_is_not_a_block() {
        let job = job();
        let hasher = FixedHasher::of(job.network_target());
        let out = validate(&job, &ctx([0, 0, 0, 1]), &submission("deadbeef"), &hasher).unwrap();
        assert!(!out.share.is_block_candidate);
    }

    #[test]
    fn hash_below_network_target_is_block_candidate() {
        let job = job();
        let hasher = FixedHasher::of(&(job.network_target().clone() - 1u32));
        let out = validate(&job, &ctx([0, 0, 0, 1]), &submission("deadbeef"), &hasher).unwrap();
        assert!(out.share.is_block_candidate);
        assert!(out.block.is_some());
        assert_eq!(out.share.block_hash.as_deref(), Some(out.share.hash.as_str()));
    }

    #[test]
    fn duplicate_is_case_insensitive() {
        let job = job();
        let hasher = FixedHasher::of(&BigUint::from(1u8));
        let c = ctx([0, 0, 0, 1]);
        validate(&job, &c, &submission("deadbeef"), &hasher).unwrap();
        let err = validate(&job, &c, &submission("DEADBEEF"), &hasher).unwrap_err();
        assert_eq!(err.code, StratumErrorCode::DuplicateShare);
    }

    #[test]
    fn same_tuple_from_other_extranonce1_is_not_duplicate() {
        let job = job();
        let hasher = FixedHasher::of(&BigUint::from(1u8));
        validate(&job, &ctx([0, 0, 0, 1]), &submission("deadbeef"), &hasher).unwrap();
        validate(&job, &ctx([0, 0, 0, 2]), &submission("deadbeef"), &hasher).unwrap();
        assert_eq!(job.submission_count(), 2);
    }

    #[test]
    fn concurrent_duplicates_accept_exactly_one() {
        let job = Arc::new(job());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = Arc::clone(&job);
                std::thread::spawn(move || {
                    let hasher = FixedHasher::of(&BigUint::from(7u8));
                    validate(&job, &ctx([9, 9, 9, 9]), &submission("0badf00d"), &hasher)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.code == StratumErrorCode::DuplicateShare));
    }

    #[test]
    fn ntime_window() {
        let job = job();
        let hasher = FixedHasher::of(&BigUint::from(1u8));
        let c = ctx([0, 0, 0, 1]);

        let mut early = submission("00000001");
        early.ntime = format!("{:08x}", CUR_TIME - 1);
        let err = validate(&job, &c, &early, &hasher).unwrap_err();
        assert_eq!(err.code, StratumErrorCode::JobNotFound);

        let mut late = submission("00000002");
        late.ntime = format!("{:08x}", NOW + MAX_FUTURE_NTIME_SECS + 1);
        assert!(validate(&job, &c, &late, &hasher).is_err());

        let mut edge = submission("00000003");
        edge.ntime = format!("{:08x}", NOW + MAX_FUTURE_NTIME_SECS);
        assert!(validate(&job, &c, &edge, &hasher).is_ok());
    }

    #[test]
    fn malformed_fields_are_rejected_as_other() {
        let job = job();
        let hasher = FixedHasher::of(&BigUint::from(1u8));
        let c = ctx([0, 0, 0, 1]);

        let mut short_en2 = submission("deadbeef");
        short_en2.extranonce2 = "0001".into();
        assert_eq!(validate(&job, &c, &short_en2, &hasher).unwrap_err().code, StratumErrorCode::Other);

        let bad_nonce = submission("zzzzzzzz");
        assert_eq!(validate(&job, &c, &bad_nonce, &hasher).unwrap_err().code, StratumErrorCode::Other);
        assert_eq!(job.submission_count(), 0);
    }

    #[test]
    fn previous_difficulty_applies_to_older_job() {
        let job = job();
        // Between the 1024 and 4096 targets.
        let hasher = FixedHasher::of(&(miner_target() - 1u32));
        let mut c = ctx([0, 0, 0, 1]);
        c.difficulty = 4096.0;
        c.previous_difficulty = Some((1024.0, job.created_at() + Duration::from_millis(1)));

        let out = validate(&job, &c, &submission("deadbeef"), &hasher).unwrap();
        assert_eq!(out.share.difficulty, 1024.0);
    }
}
