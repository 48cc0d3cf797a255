//! Request records and response parsing types.
//!
//! A `RequestRecord` is owned by the worker until pushed to a record
//! processor, which then exclusively owns its copy. All `*_perf_ns` fields are
//! monotonic perf-counter nanoseconds; `timestamp_ns` is wall clock and must
//! never enter latency arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::ErrorDetails;
use crate::models::credit::{CreditPhase, NANOS_PER_SECOND};
use crate::models::dataset::Turn;

/// One field of an SSE message, e.g. `data: {...}` or `event: error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

pub const SSE_FIELD_DATA: &str = "data";
pub const SSE_FIELD_EVENT: &str = "event";
pub const SSE_FIELD_COMMENT: &str = "comment";
pub const SSE_EVENT_ERROR: &str = "error";
pub const SSE_DONE_MARKER: &str = "[DONE]";

/// One complete SSE message, timestamped at chunk arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseMessage {
    pub perf_ns: u64,
    #[serde(default)]
    pub packets: Vec<SseField>,
}

impl SseMessage {
    /// Parse a raw (delimiter-stripped) SSE message. Permissive: unknown
    /// lines become comment fields, framing is never rejected.
    pub fn parse(raw: &str, perf_ns: u64) -> Self {
        let mut packets = Vec::new();
        for line in raw.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix(':') {
                packets.push(SseField {
                    name: SSE_FIELD_COMMENT.to_string(),
                    value: Some(comment.trim_start().to_string()),
                });
            } else if let Some((name, value)) = line.split_once(':') {
                packets.push(SseField {
                    name: name.to_string(),
                    value: Some(value.strip_prefix(' ').unwrap_or(value).to_string()),
                });
            } else {
                packets.push(SseField {
                    name: line.to_string(),
                    value: None,
                });
            }
        }
        Self { perf_ns, packets }
    }

    /// Join the data fields per the SSE spec (single `\n` between them).
    pub fn extract_data_content(&self) -> String {
        let parts: Vec<&str> = self
            .packets
            .iter()
            .filter(|p| p.name == SSE_FIELD_DATA)
            .filter_map(|p| p.value.as_deref())
            .collect();
        parts.join("\n")
    }

    pub fn is_done_marker(&self) -> bool {
        self.extract_data_content() == SSE_DONE_MARKER
    }

    pub fn has_error_event(&self) -> bool {
        self.packets
            .iter()
            .any(|p| p.name == SSE_FIELD_EVENT && p.value.as_deref() == Some(SSE_EVENT_ERROR))
    }

    pub fn comment(&self) -> Option<&str> {
        self.packets
            .iter()
            .find(|p| p.name == SSE_FIELD_COMMENT)
            .and_then(|p| p.value.as_deref())
    }
}

/// Raw unary response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub perf_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub text: String,
}

/// One raw response item: a single body for unary requests, one SSE message
/// per stream frame for streaming requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResponse {
    Sse(SseMessage),
    Text(TextResponse),
}

impl RawResponse {
    pub fn perf_ns(&self) -> u64 {
        match self {
            Self::Sse(m) => m.perf_ns,
            Self::Text(t) => t.perf_ns,
        }
    }

    /// The textual payload to hand to an endpoint adapter's parser.
    pub fn payload_text(&self) -> String {
        match self {
            Self::Sse(m) => m.extract_data_content(),
            Self::Text(t) => t.text.clone(),
        }
    }
}

/// Record of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Wall clock at request start. Reporting only.
    pub timestamp_ns: u64,
    pub start_perf_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_perf_ns: Option<u64>,
    /// When the response stream opened (first byte), for streaming requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_start_perf_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub responses: Vec<RawResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    /// Nanoseconds the request was sent late vs its scheduled instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_ns: Option<u64>,
    pub credit_phase: CreditPhase,
    /// Credit receipt to inference send, worker-internal latency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_drop_latency: Option<u64>,
    #[serde(default)]
    pub was_cancelled: bool,
    #[serde(default)]
    pub cancel_after_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_perf_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_correlation_id: Option<String>,
}

impl RequestRecord {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// A record is valid iff it has no error, at least one response, sane
    /// start/end ordering, and positive response timestamps.
    pub fn valid(&self) -> bool {
        !self.has_error()
            && !self.responses.is_empty()
            && self.end_perf_ns.is_some_and(|end| self.start_perf_ns < end)
            && self.responses.iter().all(|r| r.perf_ns() > 0)
    }

    pub fn time_to_first_response_ns(&self) -> Option<u64> {
        if !self.valid() {
            return None;
        }
        self.responses
            .first()
            .map(|r| r.perf_ns().saturating_sub(self.start_perf_ns))
    }

    pub fn time_to_second_response_ns(&self) -> Option<u64> {
        if !self.valid() || self.responses.len() < 2 {
            return None;
        }
        Some(self.responses[1].perf_ns() - self.responses[0].perf_ns())
    }
}

/// Parsed content of one response chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    Text {
        text: String,
    },
    Reasoning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    Embedding {
        embeddings: Vec<Vec<f64>>,
    },
    Rankings {
        rankings: Vec<serde_json::Value>,
    },
}

impl ResponseData {
    /// Concatenated output text of the chunk (reasoning before content).
    pub fn get_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Reasoning { content, reasoning } => {
                let mut out = String::new();
                if let Some(r) = reasoning {
                    out.push_str(r);
                }
                if let Some(c) = content {
                    out.push_str(c);
                }
                out
            }
            Self::Embedding { .. } | Self::Rankings { .. } => String::new(),
        }
    }

    /// The non-reasoning output text of the chunk, if any.
    pub fn output_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } if !text.is_empty() => Some(text),
            Self::Reasoning {
                content: Some(c), ..
            } if !c.is_empty() => Some(c),
            _ => None,
        }
    }

    pub fn reasoning_text(&self) -> Option<&str> {
        match self {
            Self::Reasoning {
                reasoning: Some(r), ..
            } if !r.is_empty() => Some(r),
            _ => None,
        }
    }
}

/// Server-reported token usage, when the endpoint returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

/// One parsed response chunk with its arrival timestamp. `data` is absent
/// for usage-only chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub perf_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A request record plus its parsed responses and derived token counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponseRecord {
    pub request: RequestRecord,
    pub responses: Vec<ParsedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_token_count: Option<u64>,
}

impl ParsedResponseRecord {
    pub fn start_perf_ns(&self) -> u64 {
        self.request.start_perf_ns
    }

    /// Request end, falling back to the last response arrival.
    pub fn end_perf_ns(&self) -> Option<u64> {
        self.request
            .end_perf_ns
            .or_else(|| self.responses.last().map(|r| r.perf_ns))
    }

    pub fn request_duration_ns(&self) -> Option<u64> {
        self.end_perf_ns()
            .map(|end| end.saturating_sub(self.start_perf_ns()))
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        let tokens = self.output_token_count?;
        let duration = self.request_duration_ns()?;
        if duration == 0 {
            return None;
        }
        Some(tokens as f64 / (duration as f64 / NANOS_PER_SECOND as f64))
    }

    pub fn has_error(&self) -> bool {
        self.request.has_error()
    }

    pub fn valid(&self) -> bool {
        !self.has_error()
            && !self.responses.is_empty()
            && self
                .end_perf_ns()
                .is_some_and(|end| self.start_perf_ns() < end)
            && self.responses.iter().all(|r| r.perf_ns > 0)
    }
}
