/// Per-connection worker state
///
/// Owned by one connection task. The registry keeps a shared handle so
/// broadcasts can check whether the miner is subscribed.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::vardiff::VarDiffContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Authorized,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub valid_shares: u64,
    pub invalid_shares: u64,
}

impl ShareStats {
    pub fn total(&self) -> u64 {
        self.valid_shares + self.invalid_shares
    }

    pub fn invalid_percent(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.invalid_shares as f64 * 100.0 / self.total() as f64
    }
}

/// Worker fields a share is validated against, copied out of the context
/// so no lock is held while hashing.
#[derive(Debug, Clone)]
pub struct ShareContext {
    pub extranonce1: Vec<u8>,
    pub difficulty: f64,
    /// Difficulty before the last change, and when it changed.
    pub previous_difficulty: Option<(f64, Instant)>,
    pub miner: String,
    pub worker: Option<String>,
    pub ip: IpAddr,
    pub user_agent: Option<String>,
}

impl ShareContext {
    pub fn new(extranonce1: Vec<u8>, difficulty: f64, ip: IpAddr) -> Self {
        Self {
            extranonce1,
            difficulty,
            previous_difficulty: None,
            miner: ip.to_string(),
            worker: None,
            ip,
            user_agent: None,
        }
    }

    /// Difficulty a share for a job created at `job_created_at` must meet.
    ///
    /// Work handed out before the last change may still be at the previous
    /// difficulty, so the lower of the two applies to it.
    pub fn effective_difficulty(&self, job_created_at: Instant) -> f64 {
        match self.previous_difficulty {
            Some((previous, changed_at)) if job_created_at < changed_at => {
                previous.min(self.difficulty)
            }
            _ => self.difficulty,
        }
    }
}

#[derive(Debug)]
pub struct WorkerContext {
    pub connection_id: String,
    pub remote_addr: SocketAddr,
    pub subscribed: bool,
    pub authorized: bool,
    pub disconnected: bool,
    pub extranonce1: Option<Vec<u8>>,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pub difficulty_changed_at: Option<Instant>,
    /// `None` when vardiff is off for this connection.
    pub vardiff: Option<VarDiffContext>,
    pub miner: Option<String>,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub stats: ShareStats,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub requests_received: u64,
}

impl WorkerContext {
    pub fn new(connection_id: String, remote_addr: SocketAddr, difficulty: f64, vardiff: bool) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            remote_addr,
            subscribed: false,
            authorized: false,
            disconnected: false,
            extranonce1: None,
            difficulty,
            previous_difficulty: None,
            difficulty_changed_at: None,
            vardiff: vardiff.then(VarDiffContext::new),
            miner: None,
            worker: None,
            user_agent: None,
            stats: ShareStats::default(),
            connected_at: now,
            last_activity: now,
            requests_received: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.disconnected {
            ConnectionState::Disconnected
        } else if self.subscribed && self.authorized {
            ConnectionState::Authorized
        } else if self.subscribed {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Connected
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.requests_received += 1;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Connected for longer than `timeout` without sending anything.
    pub fn is_zombie(&self, now: Instant, timeout: Duration) -> bool {
        self.requests_received == 0 && now.saturating_duration_since(self.connected_at) > timeout
    }

    /// Seconds since connect; the clock vardiff runs on.
    pub fn clock(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.connected_at).as_secs_f64()
    }

    pub fn set_difficulty(&mut self, difficulty: f64) {
        if difficulty == self.difficulty {
            return;
        }
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty_changed_at = Some(Instant::now());
        self.difficulty = difficulty;
    }

    /// Snapshot used to validate a share; `None` before subscribe.
    pub fn share_context(&self) -> Option<ShareContext> {
        let extranonce1 = self.extranonce1.clone()?;
        Some(ShareContext {
            extranonce1,
            difficulty: self.difficulty,
            previous_difficulty: self.previous_difficulty.zip(self.difficulty_changed_at),
            miner: self.miner.clone().unwrap_or_else(|| self.connection_id.clone()),
            worker: self.worker.clone(),
            ip: self.remote_addr.ip(),
            user_agent: self.user_agent.clone(),
        })
    }

    /// Split `miner.worker` login into its parts.
    pub fn set_login(&mut self, username: &str) {
        let mut parts = username.splitn(2, '.');
        self.miner = parts.next().map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
        self.worker = parts.next().map(|w| w.trim().to_string()).filter(|w| !w.is_empty());
    }

    pub fn worker_id(&self) -> String {
        match (&self.miner, &self.worker) {
            (Some(m), Some(w)) => format!("{}.{}", m, w),
            (Some(m), None) => m.clone(),
            _ => self.connection_id.clone(),
        }
    }

    pub fn record_share(&mut self, valid: bool) {
        if valid {
            self.stats.valid_shares += 1;
        } else {
            self.stats.invalid_shares += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx() -> WorkerContext {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        WorkerContext::new("c1".to_string(), addr, 1024.0, true)
    }

    #[test]
    fn state_follows_flags() {
        let mut c = ctx();
        assert_eq!(c.state(), ConnectionState::Connected);
        c.subscribed = true;
        assert_eq!(c.state(), ConnectionState::Subscribed);
        c.authorized = true;
        assert_eq!(c.state(), ConnectionState::Authorized);
        c.disconnected = true;
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn login_split() {
        let mut c = ctx();
        c.set_login("bc1qaddress.rig01");
        assert_eq!(c.miner.as_deref(), Some("bc1qaddress"));
        assert_eq!(c.worker.as_deref(), Some("rig01"));
        assert_eq!(c.worker_id(), "bc1qaddress.rig01");

        c.set_login("bc1qaddress");
        assert_eq!(c.worker, None);
        assert_eq!(c.worker_id(), "bc1qaddress");
    }

    #[test]
    fn no_share_context_before_subscribe() {
        assert!(ctx().share_context().is_none());
    }

    #[test]
    fn old_jobs_get_previous_difficulty() {
        let mut c = ctx();
        c.extranonce1 = Some(vec![0, 0, 0, 1]);
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        c.set_difficulty(4096.0);

        let share_ctx = c.share_context().unwrap();
        assert_eq!(share_ctx.effective_difficulty(before), 1024.0);
        assert_eq!(share_ctx.effective_difficulty(Instant::now()), 4096.0);
    }

    #[test]
    fn stats_ratio() {
        let mut c = ctx();
        c.record_share(true);
        c.record_share(false);
        c.record_share(false);
        c.record_share(false);
        assert_eq!(c.stats.total(), 4);
        assert_eq!(c.stats.invalid_percent(), 75.0);
    }

    #[test]
    fn zombie_detection() {
        let mut c = ctx();
        let later = c.connected_at + Duration::from_secs(11);
        assert!(c.is_zombie(later, Duration::from_secs(10)));
        c.touch();
        assert!(!c.is_zombie(later, Duration::from_secs(10)));
    }
}
