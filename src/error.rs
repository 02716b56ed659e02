use alloy_primitives::Bytes;
use thiserror::Error;

use crate::{leads::Checkpoint, types::BlockRange};

/// Errors surfaced by the ingestion core.
///
/// Per-call and per-field failures are never represented here; they are
/// recorded on [`crate::types::CallResult`] and
/// [`crate::history::HistoricalPoint`] instead.
#[derive(Debug, Error)]
pub enum IngestError {
    /// invalid range, limit or worker count; never retried
    #[error("configuration error: {0}")]
    Configuration(String),

    /// a single request that kept failing after the retry budget was spent
    #[error("transport failure for {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: TransportError,
    },

    /// the log scan could not complete; `unscanned` is the sub-range that was
    /// never ingested and must be re-requested
    #[error("scan failed for ranges {failed:?}, unscanned {unscanned}")]
    ScanFailure {
        failed: Vec<BlockRange>,
        unscanned: BlockRange,
        checkpoint: Option<Box<Checkpoint>>,
    },

    #[error("cancelled, unscanned {unscanned:?}")]
    Cancelled {
        unscanned: Option<BlockRange>,
        checkpoint: Option<Box<Checkpoint>>,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(context: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// The checkpoint a failed discovery pass managed to build before failing.
    pub fn resume_checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Self::ScanFailure { checkpoint, .. } | Self::Cancelled { checkpoint, .. } => {
                checkpoint.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn with_checkpoint(self, resume: Checkpoint) -> Self {
        match self {
            Self::ScanFailure {
                failed, unscanned, ..
            } => Self::ScanFailure {
                failed,
                unscanned,
                checkpoint: Some(Box::new(resume)),
            },
            Self::Cancelled { unscanned, .. } => Self::Cancelled {
                unscanned,
                checkpoint: Some(Box::new(resume)),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(value: std::io::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(value: serde_json::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Failure of one network request against a node.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("http status {status}")]
    Http { status: u16 },

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// the provider refused the block span or result size of a log query
    #[error("range too large: {0}")]
    RangeTooLarge(String),

    #[error("execution reverted")]
    Reverted(Bytes),

    /// the request ran into the node's gas or payload cap for one `eth_call`
    #[error("call too heavy: {0}")]
    CallTooHeavy(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// RPC error messages that providers use for conditions which go away on retry.
const TRANSIENT_RPC_MESSAGES: &[&str] = &[
    "header not found",
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "capacity exceeded",
    "temporarily unavailable",
    "upstream",
    "internal error",
];

/// RPC error messages that mean one `eth_call` exceeded the node's gas
/// simulation cap or request size.
const CALL_TOO_HEAVY_MESSAGES: &[&str] = &[
    "out of gas",
    "gas required exceeds",
    "exceeds block gas limit",
    "intrinsic gas too high",
    "request entity too large",
    "payload too large",
    "request too large",
];

/// RPC error messages that mean a log query covered too many blocks or results.
const RANGE_TOO_LARGE_MESSAGES: &[&str] = &[
    "block range",
    "range is too large",
    "range too large",
    "more than",
    "query returned more than",
    "response size exceeded",
    "log response size",
    "exceed maximum block range",
    "limit exceeded",
    "too many results",
];

impl TransportError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Connect(_) => true,
            Self::Http { status } => *status == 429 || *status >= 500,
            Self::Rpc { code, message } => {
                *code == -32005 || {
                    let message = message.to_lowercase();
                    TRANSIENT_RPC_MESSAGES.iter().any(|m| message.contains(m))
                }
            }
            Self::RangeTooLarge(_) |
            Self::Reverted(_) |
            Self::CallTooHeavy(_) |
            Self::Decode(_) => false,
        }
    }

    /// Classifies a JSON-RPC error object.
    pub fn from_rpc(code: i64, message: String, data: Option<Bytes>) -> Self {
        let lower = message.to_lowercase();
        if code == 3 || lower.contains("revert") {
            return Self::Reverted(data.unwrap_or_default());
        }
        if code == 413 || CALL_TOO_HEAVY_MESSAGES.iter().any(|m| lower.contains(m)) {
            return Self::CallTooHeavy(message);
        }
        if RANGE_TOO_LARGE_MESSAGES.iter().any(|m| lower.contains(m)) {
            return Self::RangeTooLarge(message);
        }
        if code == 429 {
            return Self::RateLimited;
        }
        Self::Rpc { code, message }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else if let Some(status) = value.status() {
            if status.as_u16() == 429 {
                Self::RateLimited
            } else if status.as_u16() == 413 {
                Self::CallTooHeavy(value.to_string())
            } else {
                Self::Http {
                    status: status.as_u16(),
                }
            }
        } else if value.is_connect() || value.is_request() {
            Self::Connect(value.to_string())
        } else {
            Self::Decode(value.to_string())
        }
    }
}
