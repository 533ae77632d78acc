//! Error taxonomy for the ingestion pipeline
//!
//! Failures local to one request, batch item or probe are carried as values
//! (`ItemOutcome::Failed`, `HealthStatus::Unknown`) by the layers above; only
//! configuration errors are meant to stop the process.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// HTTP status the upstream uses to signal rate limiting
pub const RATE_LIMITED_STATUS: u16 = 429;

/// Failure reported by a transport for a single upstream call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{}", describe(.status_code, .message))]
pub struct TransportError {
    /// HTTP status, `None` for network/timeout/decode failures
    pub status_code: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(Some(status_code), message)
    }

    pub fn rate_limited() -> Self {
        Self::status(RATE_LIMITED_STATUS, "rate limit exceeded")
    }

    /// True when the upstream answered 429
    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(RATE_LIMITED_STATUS)
    }
}

fn describe(status_code: &Option<u16>, message: &str) -> String {
    match status_code {
        Some(code) => format!("HTTP {}: {}", code, message),
        None => message.to_string(),
    }
}

/// Core error type for the ingestion library
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Quota wait did not converge after {iterations} iterations")]
    QuotaExceeded { iterations: u32 },

    #[error("Rate limited by upstream: {0}")]
    RateLimitedByUpstream(TransportError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("Probe {check} unavailable: {reason}")]
    ProbeUnavailable { check: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the ingestion library
pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn probe_unavailable(check: impl fmt::Display, reason: impl Into<String>) -> Self {
        IngestError::ProbeUnavailable {
            check: check.to_string(),
            reason: reason.into(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        IngestError::Persistence(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        IngestError::Config(msg.into())
    }
}

impl From<TransportError> for IngestError {
    fn from(err: TransportError) -> Self {
        if err.is_rate_limited() {
            IngestError::RateLimitedByUpstream(err)
        } else {
            IngestError::Transport(err)
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Persistence(format!("serialization failed: {}", err))
    }
}
