/// Miner authorization
///
/// Decides whether a `mining.authorize` login may submit shares. Runs
/// against the login only; banning and share accounting live elsewhere.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use stratum_core::is_valid_difficulty;

use crate::config::{AuthConfig, AuthMode};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(false)` is a clean denial. Errors are treated as denials by the
    /// caller.
    async fn authorize(&self, addr: IpAddr, username: &str, password: &str) -> anyhow::Result<bool>;
}

pub fn from_config(cfg: &AuthConfig) -> Arc<dyn Authorizer> {
    match cfg.mode {
        AuthMode::Address => Arc::new(AddressAuthorizer::new(
            cfg.address_prefix.clone(),
            cfg.min_address_len,
            cfg.max_address_len,
        )),
        AuthMode::Password => Arc::new(PasswordAuthorizer::new(cfg.password.clone())),
    }
}

/// Accepts `address[.worker]` logins whose address looks like a payout
/// address: optional fixed prefix, bounded length, ASCII alphanumeric.
#[derive(Debug, Clone)]
pub struct AddressAuthorizer {
    prefix: Option<String>,
    min_len: usize,
    max_len: usize,
}

impl AddressAuthorizer {
    pub fn new(prefix: Option<String>, min_len: usize, max_len: usize) -> Self {
        Self {
            prefix,
            min_len,
            max_len,
        }
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        let addr = address.trim();
        if let Some(prefix) = &self.prefix {
            if !addr.starts_with(prefix.as_str()) {
                return false;
            }
        }
        (self.min_len..=self.max_len).contains(&addr.len())
            && addr.bytes().all(|b| b.is_ascii_alphanumeric())
    }
}

#[async_trait]
impl Authorizer for AddressAuthorizer {
    async fn authorize(&self, _addr: IpAddr, username: &str, _password: &str) -> anyhow::Result<bool> {
        let address = username.split('.').next().unwrap_or_default();
        Ok(self.is_valid_address(address))
    }
}

/// Shared pool password. With no password configured every login passes.
#[derive(Debug, Clone, Default)]
pub struct PasswordAuthorizer {
    password: Option<String>,
}

impl PasswordAuthorizer {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl Authorizer for PasswordAuthorizer {
    async fn authorize(&self, _addr: IpAddr, username: &str, password: &str) -> anyhow::Result<bool> {
        if username.trim().is_empty() {
            return Ok(false);
        }
        let Some(expected) = &self.password else {
            return Ok(true);
        };
        // The password field may also carry options such as `d=`.
        Ok(password
            .split([',', ';'])
            .any(|part| part.trim() == expected.as_str()))
    }
}

/// Static difficulty requested in the password field, e.g. `x,d=16384`.
pub fn parse_static_difficulty(password: &str) -> Option<f64> {
    password
        .split([',', ';', ' '])
        .filter_map(|part| part.trim().strip_prefix("d="))
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .find(|d| is_valid_difficulty(*d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    #[tokio::test]
    async fn address_authorizer_checks_prefix_and_length() {
        let auth = AddressAuthorizer::new(Some("bc1".into()), 26, 62);
        let good = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
        assert!(auth.authorize(IP, good, "x").await.unwrap());
        assert!(auth.authorize(IP, &format!("{}.rig01", good), "x").await.unwrap());
        assert!(!auth.authorize(IP, "1BoatSLRHtKNngkdXEeobR76b53LETtpyT", "x").await.unwrap());
        assert!(!auth.authorize(IP, "bc1short", "x").await.unwrap());
        assert!(!auth.authorize(IP, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzz-f5mdq", "x").await.unwrap());
    }

    #[tokio::test]
    async fn password_authorizer() {
        let open = PasswordAuthorizer::default();
        assert!(open.authorize(IP, "anyone", "").await.unwrap());
        assert!(!open.authorize(IP, " ", "").await.unwrap());

        let closed = PasswordAuthorizer::new(Some("hunter2".into()));
        assert!(closed.authorize(IP, "m", "hunter2").await.unwrap());
        assert!(closed.authorize(IP, "m", "d=512,hunter2").await.unwrap());
        assert!(!closed.authorize(IP, "m", "x").await.unwrap());
    }

    #[test]
    fn static_difficulty_from_password() {
        assert_eq!(parse_static_difficulty("d=16384"), Some(16384.0));
        assert_eq!(parse_static_difficulty("x,d=0.5"), Some(0.5));
        assert_eq!(parse_static_difficulty("d=2048;foo"), Some(2048.0));
        assert_eq!(parse_static_difficulty("d=0"), None);
        assert_eq!(parse_static_difficulty("d=abc"), None);
        assert_eq!(parse_static_difficulty("d=1e-300"), None);
        assert_eq!(parse_static_difficulty("d=inf"), None);
        assert_eq!(parse_static_difficulty("x"), None);
    }
}
