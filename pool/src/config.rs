use serde::Deserialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::vardiff::VarDiffConfig;

/// Used when `POOL_CONFIG` is unset and the file exists in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pool_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, value: impl Display) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StratumConfig {
    pub listen: String,
    pub max_connections: usize,
    /// Flood protection for the line framer.
    pub max_line_length: usize,
    /// Idle connections are dropped after this long without a request.
    pub connection_timeout_secs: u64,
    /// Connections that send nothing at all are dropped after this long.
    pub zombie_timeout_secs: u64,
    pub send_queue_capacity: usize,
    pub send_timeout_secs: u64,
    pub initial_difficulty: f64,
    pub extranonce2_size: usize,
    /// Goes into the high bits of every extraNonce1.
    pub instance_id: u8,
    pub authorize_timeout_secs: u64,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".to_string(),
            max_connections: 10_000,
            max_line_length: crate::stratum::codec::DEFAULT_MAX_LINE_LENGTH,
            connection_timeout_secs: 600,
            zombie_timeout_secs: 10,
            send_queue_capacity: 64,
            send_timeout_secs: 5,
            initial_difficulty: 4096.0,
            extranonce2_size: 4,
            instance_id: 0,
            authorize_timeout_secs: 5,
        }
    }
}

impl StratumConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn zombie_timeout(&self) -> Duration {
        Duration::from_secs(self.zombie_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_secs(self.authorize_timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BanningConfig {
    pub enabled: bool,
    /// Shares seen before the invalid ratio is evaluated.
    pub check_threshold: u64,
    pub invalid_percent: f64,
    pub time_secs: u64,
    /// Ban applied to peers sending unparseable or oversized lines.
    pub junk_ban_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_threshold: 50,
            invalid_percent: 50.0,
            time_secs: 600,
            junk_ban_secs: 180,
            sweep_interval_secs: 60,
        }
    }
}

impl BanningConfig {
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.time_secs)
    }

    pub fn junk_ban_time(&self) -> Duration {
        Duration::from_secs(self.junk_ban_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct JobsConfig {
    /// Jobs kept for late shares, newest first.
    pub max_active_jobs: usize,
    pub poll_interval_ms: u64,
    /// Force a refreshed job when the template has not changed for this long.
    pub rebroadcast_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: 4,
            poll_interval_ms: 1000,
            rebroadcast_timeout_secs: 55,
        }
    }
}

impl JobsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rebroadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DaemonConfig {
    pub url: String,
    pub template_method: String,
    pub submit_method: String,
    pub timeout_secs: u64,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Consecutive transport failures before calls fail fast.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            template_method: "getblocktemplate".to_string(),
            submit_method: "submitblock".to_string(),
            timeout_secs: 30,
            user: None,
            password: None,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Address,
    Password,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub address_prefix: Option<String>,
    pub min_address_len: usize,
    pub max_address_len: usize,
    pub password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Address,
            address_prefix: None,
            min_address_len: 26,
            max_address_len: 90,
            password: None,
        }
    }
}

fn default_vardiff() -> Option<VarDiffConfig> {
    Some(VarDiffConfig::default())
}

fn default_metrics_listen() -> Option<String> {
    Some("0.0.0.0:9100".to_string())
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolConfig {
    #[serde(default)]
    pub stratum: StratumConfig,
    /// `null` disables vardiff; every miner keeps the initial difficulty.
    #[serde(default = "default_vardiff")]
    pub vardiff: Option<VarDiffConfig>,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            stratum: StratumConfig::default(),
            vardiff: default_vardiff(),
            banning: BanningConfig::default(),
            jobs: JobsConfig::default(),
            daemon: DaemonConfig::default(),
            auth: AuthConfig::default(),
            metrics_listen: default_metrics_listen(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl PoolConfig {
    /// Defaults, then the JSON file (`POOL_CONFIG` or `pool_config.json`),
    /// then `STRATUM_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("POOL_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(l) = std::env::var("STRATUM_LISTEN") {
            self.stratum.listen = l;
        }
        if let Some(n) = env_parse("STRATUM_MAX_CONNECTIONS") {
            self.stratum.max_connections = n;
        }
        if let Some(d) = env_parse("STRATUM_INITIAL_DIFFICULTY") {
            self.stratum.initial_difficulty = d;
        }
        if let Some(id) = env_parse("STRATUM_INSTANCE_ID") {
            self.stratum.instance_id = id;
        }
        if let Ok(u) = std::env::var("STRATUM_DAEMON_URL") {
            self.daemon.url = u;
        }
        if let Ok(u) = std::env::var("STRATUM_DAEMON_USER") {
            self.daemon.user = Some(u);
        }
        if let Ok(p) = std::env::var("STRATUM_DAEMON_PASSWORD") {
            self.daemon.password = Some(p);
        }
        if let Ok(m) = std::env::var("STRATUM_METRICS_LISTEN") {
            self.metrics_listen = if m.is_empty() { None } else { Some(m) };
        }
        if let Some(enabled) = env_parse("STRATUM_BANNING_ENABLED") {
            self.banning.enabled = enabled;
        }
        if let Some(vardiff) = self.vardiff.as_mut() {
            if let Some(v) = env_parse("STRATUM_VARDIFF_TARGET_TIME") {
                vardiff.target_time = v;
            }
            if let Some(v) = env_parse("STRATUM_VARDIFF_RETARGET_TIME") {
                vardiff.retarget_time = v;
            }
            if let Some(v) = env_parse("STRATUM_VARDIFF_MIN_DIFF") {
                vardiff.min_diff = v;
            }
            if let Some(v) = env_parse("STRATUM_VARDIFF_MAX_DIFF") {
                vardiff.max_diff = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.stratum;
        if s.max_line_length == 0 {
            return Err(ConfigError::invalid("stratum.max_line_length", s.max_line_length));
        }
        if !(s.initial_difficulty.is_finite() && s.initial_difficulty > 0.0) {
            return Err(ConfigError::invalid("stratum.initial_difficulty", s.initial_difficulty));
        }
        if s.send_queue_capacity == 0 {
            return Err(ConfigError::invalid("stratum.send_queue_capacity", 0));
        }
        if s.extranonce2_size == 0 || s.extranonce2_size > 8 {
            return Err(ConfigError::invalid("stratum.extranonce2_size", s.extranonce2_size));
        }
        if let Some(vardiff) = &self.vardiff {
            vardiff.validate()?;
        }
        let b = &self.banning;
        if b.enabled {
            if b.time_secs == 0 {
                return Err(ConfigError::invalid("banning.time_secs", 0));
            }
            if b.junk_ban_secs == 0 {
                return Err(ConfigError::invalid("banning.junk_ban_secs", 0));
            }
            if !(0.0..=100.0).contains(&b.invalid_percent) {
                return Err(ConfigError::invalid("banning.invalid_percent", b.invalid_percent));
            }
        }
        if self.jobs.max_active_jobs == 0 {
            return Err(ConfigError::invalid("jobs.max_active_jobs", 0));
        }
        if self.auth.mode == AuthMode::Password && self.auth.password.is_none() {
            return Err(ConfigError::invalid("auth.password", "<unset>"));
        }
        Ok(())
    }
}
