/// Daemon RPC client
///
/// JSON-RPC over HTTP behind a failure breaker. Fetches templates and submits
/// solved blocks.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{BlockSubmitter, BlockTemplate, TemplateSource};
use crate::config::DaemonConfig;
use crate::metrics::prometheus as metrics;
use crate::shares::Share;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Stops hammering a daemon that keeps failing at the transport level.
/// After `threshold` consecutive failures every call fails fast until
/// `cooldown` has passed; the next call is then let through as a probe.
#[derive(Debug)]
enum Breaker {
    Closed { failures: u32 },
    Open { until: Instant },
}

#[derive(Debug)]
struct DaemonBreaker {
    state: Breaker,
    threshold: u32,
    cooldown: Duration,
}

impl DaemonBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Breaker::Closed { failures: 0 },
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn allow(&mut self, now: Instant) -> Result<()> {
        if let Breaker::Open { until } = self.state {
            if now < until {
                return Err(anyhow!(
                    "daemon unavailable, retrying in {}s",
                    until.saturating_duration_since(now).as_secs()
                ));
            }
            // One probe; a failure reopens immediately.
            self.state = Breaker::Closed {
                failures: self.threshold - 1,
            };
        }
        Ok(())
    }

    fn on_failure(&mut self, now: Instant) {
        let failures = match self.state {
            Breaker::Closed { failures } => failures + 1,
            Breaker::Open { .. } => return,
        };
        if failures >= self.threshold {
            tracing::error!(failures, cooldown_secs = self.cooldown.as_secs(), "daemon breaker open");
            self.state = Breaker::Open {
                until: now + self.cooldown,
            };
        } else {
            self.state = Breaker::Closed { failures };
        }
    }

    fn on_success(&mut self) {
        if matches!(self.state, Breaker::Closed { failures } if failures > 0) {
            tracing::info!("daemon reachable again");
        }
        self.state = Breaker::Closed { failures: 0 };
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(self.state, Breaker::Open { .. })
    }
}

pub struct DaemonClient {
    url: String,
    template_method: String,
    submit_method: String,
    user: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
    breaker: Mutex<DaemonBreaker>,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        tracing::info!("DaemonClient initialized: {}", config.url);

        Ok(Self {
            url: config.url.clone(),
            template_method: config.template_method.clone(),
            submit_method: config.submit_method.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            client,
            next_id: AtomicU64::new(1),
            breaker: Mutex::new(DaemonBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            )),
        })
    }

    /// Make an RPC call to the daemon
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();

        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        self.breaker.lock().allow(Instant::now())?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.lock().on_failure(Instant::now());
                return Err(anyhow!("RPC connection failed: {}", e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.breaker.lock().on_failure(Instant::now());
            return Err(anyhow!("RPC HTTP error: {}", status));
        }

        let rpc_response: RpcResponse = response
            .json()
            .await
            .with_context(|| format!("invalid {} response", method))?;

        // Application errors do not trip the breaker
        if let Some(error) = rpc_response.error.filter(|e| !e.is_null()) {
            return Err(anyhow!("RPC error from {}: {}", method, error));
        }

        self.breaker.lock().on_success();
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

/// `null` and `true` mean accepted; bitcoind-style daemons return a reject
/// reason string otherwise.
fn submit_accepted(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::Object(obj) => obj
            .get("accepted")
            .and_then(|v| v.as_bool())
            .or_else(|| {
                obj.get("status")
                    .and_then(|s| s.as_str())
                    .map(|s| s.eq_ignore_ascii_case("accepted") || s.eq_ignore_ascii_case("ok"))
            })
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl TemplateSource for DaemonClient {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        let result = self.call(&self.template_method, json!([])).await?;
        serde_json::from_value(result)
            .with_context(|| format!("unexpected {} result", self.template_method))
    }
}

#[async_trait]
impl BlockSubmitter for DaemonClient {
    async fn submit_block(&self, share: &Share, block: &[u8]) -> Result<bool> {
        let result = self
            .call(&self.submit_method, json!([hex::encode(block)]))
            .await?;

        let accepted = submit_accepted(&result);
        if !accepted {
            tracing::error!(height = share.block_height, "{} rejected: {}", self.submit_method, result);
        }
        Ok(accepted)
    }
}
