//! IP banning with TTL entries.
//!
//! Expired entries are treated as absent on lookup; the optional sweeper only
//! reclaims memory.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::prometheus as metrics;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BanError {
    #[error("ban duration must be positive, got {0:?}")]
    InvalidArgument(Duration),
}

/// IPv4/IPv6 loopback, including IPv4-mapped IPv6 loopback.
pub fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

#[derive(Debug, Default)]
pub struct BanManager {
    bans: RwLock<HashMap<IpAddr, Instant>>,
}

impl BanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    pub fn is_banned_at(&self, ip: &IpAddr, now: Instant) -> bool {
        self.bans
            .read()
            .get(ip)
            .is_some_and(|expires_at| now <= *expires_at)
    }

    pub fn ban(&self, ip: IpAddr, duration: Duration) -> Result<(), BanError> {
        self.ban_at(ip, duration, Instant::now())
    }

    pub fn ban_at(&self, ip: IpAddr, duration: Duration, now: Instant) -> Result<(), BanError> {
        if duration.is_zero() {
            return Err(BanError::InvalidArgument(duration));
        }
        if is_loopback(&ip) {
            tracing::debug!(%ip, "not banning loopback address");
            return Ok(());
        }

        let expires_at = now + duration;
        {
            let mut bans = self.bans.write();
            let entry = bans.entry(ip).or_insert(expires_at);
            if *entry < expires_at {
                *entry = expires_at;
            }
        }

        metrics::inc_bans();
        tracing::info!("🚫 Banned {} for {}s", ip, duration.as_secs());
        Ok(())
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut bans = self.bans.write();
        let before = bans.len();
        bans.retain(|_, expires_at| now <= *expires_at);
        before - bans.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bans = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = bans.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "expired bans removed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn loopback_is_never_banned() {
        let bans = BanManager::new();
        for addr in ["127.0.0.1", "127.8.9.10", "::1", "::ffff:127.0.0.1"] {
            bans.ban(ip(addr), Duration::from_secs(1)).unwrap();
            assert!(!bans.is_banned(&ip(addr)), "{addr} was banned");
        }
        assert_eq!(bans.purge_expired_at(Instant::now() + Duration::from_secs(5)), 0);
    }

    #[test]
    fn ban_expires_lazily() {
        let bans = BanManager::new();
        let t0 = Instant::now();
        let peer = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

        bans.ban_at(peer, Duration::from_secs(60), t0).unwrap();
        assert!(bans.is_banned_at(&peer, t0));
        assert!(bans.is_banned_at(&peer, t0 + Duration::from_secs(60)));
        assert!(!bans.is_banned_at(&peer, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn zero_duration_is_rejected() {
        let bans = BanManager::new();
        let err = bans.ban(ip("198.51.100.1"), Duration::ZERO).unwrap_err();
        assert_eq!(err, BanError::InvalidArgument(Duration::ZERO));
    }

    #[test]
    fn longer_ban_wins() {
        let bans = BanManager::new();
        let t0 = Instant::now();
        let peer = ip("2001:db8::1");
        bans.ban_at(peer, Duration::from_secs(600), t0).unwrap();
        bans.ban_at(peer, Duration::from_secs(5), t0).unwrap();
        assert!(bans.is_banned_at(&peer, t0 + Duration::from_secs(300)));
    }

    #[test]
    fn purge_drops_only_expired() {
        let bans = BanManager::new();
        let t0 = Instant::now();
        bans.ban_at(ip("192.0.2.1"), Duration::from_secs(1), t0).unwrap();
        bans.ban_at(ip("192.0.2.2"), Duration::from_secs(100), t0).unwrap();
        assert_eq!(bans.purge_expired_at(t0 + Duration::from_secs(10)), 1);
        assert!(bans.is_banned_at(&ip("192.0.2.2"), t0 + Duration::from_secs(10)));
    }
}
