//! Error types shared across the benchmark runtime.
//!
//! The taxonomy mirrors how failures propagate through the system: bus and
//! lifecycle errors are fatal to the service that hit them, transport and
//! parser errors are captured into the affected `RequestRecord` and the run
//! continues, and `NoMetricValue` is an expected skip signal inside the metric
//! pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = AiperfError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AiperfError {
    /// A comms client was used before `initialize()`.
    #[error("communication client not initialized")]
    NotInitialized,

    /// A comms client was used after shutdown.
    #[error("communication client already shut down")]
    AlreadyShutdown,

    /// A bus operation (publish, push, subscribe, request, response) failed
    /// after exhausting retries.
    #[error("bus {operation} failed: {message}")]
    Bus {
        operation: &'static str,
        message: String,
    },

    /// A service was asked to do something incompatible with its current
    /// lifecycle state.
    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),

    /// One or more services failed to register with the controller in time.
    #[error("services failed to register within {timeout_secs}s: {missing:?}")]
    RegistrationTimeout {
        timeout_secs: u64,
        missing: Vec<String>,
    },

    /// A lifecycle hook raised. Always fatal to the affected service.
    #[error("{hook} hook failed for {service_id}: {message}")]
    HookFailed {
        hook: &'static str,
        service_id: String,
        message: String,
    },

    /// HTTP response with status >= 400.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// The SSE stream carried an `event: error` frame.
    #[error("SSE error response: {message}")]
    SseResponse { code: u16, message: String },

    /// An operation exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Malformed JSON, missing fields, or bad SSE framing in a response body.
    #[error("response parse error: {0}")]
    ResponseParse(String),

    /// A record metric's required inputs were absent. Expected; skip the
    /// metric for that record.
    #[error("no metric value: {0}")]
    NoMetricValue(String),

    /// Unexpected failure inside a metric computation.
    #[error("metric error: {0}")]
    Metric(String),

    /// A DCGM endpoint could not be scraped or its payload was unusable.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Invalid or inconsistent user/service configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Zmq(#[from] zeromq::ZmqError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AiperfError {
    /// Coarse kind string used for error aggregation in the final report.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotInitialized | Self::AlreadyShutdown | Self::Bus { .. } | Self::Zmq(_) => {
                "communication"
            }
            Self::InvalidState(_)
            | Self::RegistrationTimeout { .. }
            | Self::HookFailed { .. } => "lifecycle",
            Self::HttpStatus { .. } | Self::Timeout(_) | Self::Http(_) => "transport",
            Self::SseResponse { .. } => "sse_error",
            Self::ResponseParse(_) | Self::Json(_) => "parser",
            Self::NoMetricValue(_) | Self::Metric(_) => "metric",
            Self::Telemetry(_) => "telemetry",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// HTTP-like status code associated with the error, if one exists.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::SseResponse { code, .. } => Some(*code),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this is the expected "skip this metric" signal.
    pub fn is_no_metric_value(&self) -> bool {
        matches!(self, Self::NoMetricValue(_))
    }
}

/// Wire-level error model carried on records and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// HTTP-like status code, when one applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Coarse error kind (e.g. "transport", "parser").
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorDetails {
    pub fn new(code: Option<u16>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&AiperfError> for ErrorDetails {
    fn from(err: &AiperfError) -> Self {
        Self {
            code: err.code(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// A unique error signature and how many times it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetailsCount {
    pub error_details: ErrorDetails,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_error_maps_to_502_details() {
        let err = AiperfError::SseResponse {
            code: 502,
            message: "upstream exploded".to_string(),
        };
        let details = ErrorDetails::from(&err);
        assert_eq!(details.code, Some(502));
        assert_eq!(details.kind, "sse_error");
        assert!(details.message.contains("upstream exploded"));
    }

    #[test]
    fn no_metric_value_is_skippable() {
        assert!(AiperfError::NoMetricValue("missing ttft".into()).is_no_metric_value());
        assert!(!AiperfError::Metric("boom".into()).is_no_metric_value());
    }
}
