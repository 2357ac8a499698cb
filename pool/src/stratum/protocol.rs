/// Stratum v1 message types and serialization
///
/// One JSON object per line. Requests and responses carry an `id`,
/// server notifications omit it.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

pub mod methods {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
    pub const NOTIFY: &str = "mining.notify";
    pub const EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
    pub const SUGGEST_DIFFICULTY: &str = "mining.suggest_difficulty";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC version, ignored when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID (`null` when the miner omitted it)
    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default)]
    pub params: Value,
}

impl StratumRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: None,
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_null()
    }

    pub fn params(&self) -> &[Value] {
        match &self.params {
            Value::Array(items) => items.as_slice(),
            _ => &[],
        }
    }

    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params().get(index).and_then(Value::as_str)
    }

    /// Numeric parameter; some miners send numbers as strings.
    pub fn param_f64(&self, index: usize) -> Option<f64> {
        match self.params().get(index)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// Unsolicited server message (`mining.set_difficulty`, `mining.notify`).
#[derive(Debug, Clone, Serialize)]
pub struct StratumNotification {
    pub method: &'static str,
    pub params: Value,
}

impl StratumNotification {
    pub fn set_difficulty(difficulty: f64) -> Self {
        Self {
            method: methods::SET_DIFFICULTY,
            params: Value::Array(vec![serde_json::json!(difficulty)]),
        }
    }

    pub fn notify(params: Vec<Value>) -> Self {
        Self {
            method: methods::NOTIFY,
            params: Value::Array(params),
        }
    }
}

/// Encode a message as a single line (the codec appends the delimiter).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumErrorCode {
    MinusOne = -1,
    Other = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
    UnauthorizedWorker = 24,
    NotSubscribed = 25,
}

impl StratumErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Short label used for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::MinusOne => "unknown",
            Self::Other => "other",
            Self::JobNotFound => "job_not_found",
            Self::DuplicateShare => "duplicate",
            Self::LowDifficultyShare => "low_difficulty",
            Self::UnauthorizedWorker => "unauthorized",
            Self::NotSubscribed => "not_subscribed",
        }
    }
}

/// Non-fatal rejection, reported to the miner as `[code, message, null]`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({code:?})")]
pub struct StratumError {
    pub code: StratumErrorCode,
    pub message: String,
}

impl StratumError {
    pub fn new(code: StratumErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StratumErrorCode::Other, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::other(message)
    }

    pub fn job_not_found() -> Self {
        Self::new(StratumErrorCode::JobNotFound, "job not found")
    }

    pub fn ntime_out_of_range() -> Self {
        Self::new(StratumErrorCode::JobNotFound, "ntime out of range")
    }

    pub fn duplicate_share() -> Self {
        Self::new(StratumErrorCode::DuplicateShare, "duplicate share")
    }

    pub fn low_difficulty(share_difficulty: f64) -> Self {
        Self::new(
            StratumErrorCode::LowDifficultyShare,
            format!("low difficulty share ({share_difficulty})"),
        )
    }

    pub fn unauthorized_worker() -> Self {
        Self::new(StratumErrorCode::UnauthorizedWorker, "unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(StratumErrorCode::NotSubscribed, "not subscribed")
    }

    pub fn missing_id() -> Self {
        Self::new(StratumErrorCode::MinusOne, "missing request id")
    }

    pub fn unsupported_method(method: &str) -> Self {
        Self::other(format!("unsupported method {method}"))
    }
}

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.code.code())?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&Value::Null)?;
        tuple.end()
    }
}

/// `mining.submit` params: `[worker, jobId, extraNonce2, nTime, nonce]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSubmission {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

impl ShareSubmission {
    pub fn from_request(request: &StratumRequest) -> Result<Self, StratumError> {
        let field = |index: usize, name: &str| {
            request
                .param_str(index)
                .map(str::to_string)
                .ok_or_else(|| StratumError::invalid_params(format!("missing or invalid {name}")))
        };

        Ok(Self {
            worker: field(0, "worker")?,
            job_id: field(1, "job id")?,
            extranonce2: field(2, "extraNonce2")?,
            ntime: field(3, "nTime")?,
            nonce: field(4, "nonce")?,
        })
    }
}
