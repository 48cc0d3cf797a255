//! Endpoint adapters: payload shaping and response parsing per endpoint
//! type.
//!
//! An adapter owns two directions: `format_payload` builds the HTTP body
//! from the conversation turns, and `parse_response` extracts structured
//! data from one response chunk. Everything else about a request (headers,
//! transport, timing) is the worker's business.

mod chat;
mod completions;
mod embeddings;
mod rankings;

use std::sync::Arc;

use serde_json::Value;

use crate::config::{EndpointConfig, EndpointType};
use crate::error::Result;
use crate::models::dataset::Turn;
use crate::models::record::{ParsedResponse, Usage};

pub use chat::ChatAdapter;
pub use completions::CompletionsAdapter;
pub use embeddings::EmbeddingsAdapter;
pub use rankings::RankingsAdapter;

/// Static description of an endpoint type's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointMetadata {
    pub endpoint_path: &'static str,
    pub supports_streaming: bool,
    pub produces_tokens: bool,
    pub tokenizes_input: bool,
    pub supports_audio: bool,
    pub supports_images: bool,
    pub supports_videos: bool,
    pub metrics_title: &'static str,
}

/// Request context handed to `format_payload`.
pub struct RequestInfo<'a> {
    pub turns: &'a [Turn],
    pub endpoint: &'a EndpointConfig,
}

pub trait EndpointAdapter: Send + Sync {
    fn metadata(&self) -> EndpointMetadata;

    /// Build the HTTP body from the turns. The returned value is always a
    /// JSON object.
    fn format_payload(&self, request: &RequestInfo<'_>) -> Result<Value>;

    /// Extract structured data from one response chunk. `Ok(None)` means
    /// the chunk carried nothing of interest (keep-alives, empty deltas).
    fn parse_response(&self, perf_ns: u64, payload: &str) -> Result<Option<ParsedResponse>>;
}

/// Resolve the adapter for an endpoint type.
pub fn adapter_for(endpoint_type: EndpointType) -> Arc<dyn EndpointAdapter> {
    match endpoint_type {
        EndpointType::Chat => Arc::new(ChatAdapter),
        EndpointType::Completions => Arc::new(CompletionsAdapter),
        EndpointType::Embeddings => Arc::new(EmbeddingsAdapter),
        EndpointType::Rankings => Arc::new(RankingsAdapter),
    }
}

/// The model for a request: the turn's own model wins over the endpoint's
/// primary model name.
pub(crate) fn resolve_model(turn: &Turn, endpoint: &EndpointConfig) -> Option<String> {
    turn.model
        .clone()
        .or_else(|| endpoint.primary_model_name.clone())
}

/// Merge `endpoint.extra` parameters into an already-built payload object.
pub(crate) fn merge_extra(payload: &mut Value, endpoint: &EndpointConfig) {
    if endpoint.extra.is_empty() {
        return;
    }
    if let Value::Object(object) = payload {
        for (key, value) in &endpoint.extra {
            object.insert(key.clone(), value.clone());
        }
    }
}

/// Parse the OpenAI-style `usage` object, if present and non-null.
pub(crate) fn parse_usage(json: &Value) -> Option<Usage> {
    let usage = json.get("usage")?;
    if usage.is_null() {
        return None;
    }
    serde_json::from_value(usage.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataset::Media;

    #[test]
    fn turn_model_wins_over_primary() {
        let mut endpoint = EndpointConfig::new("http://h", EndpointType::Chat);
        endpoint.primary_model_name = Some("primary".into());
        let mut turn = Turn {
            texts: vec![Media::text("hi")],
            ..Default::default()
        };
        assert_eq!(resolve_model(&turn, &endpoint), Some("primary".into()));

        turn.model = Some("override".into());
        assert_eq!(resolve_model(&turn, &endpoint), Some("override".into()));
    }

    #[test]
    fn extra_params_overwrite_payload_keys() {
        let mut endpoint = EndpointConfig::new("http://h", EndpointType::Chat);
        endpoint
            .extra
            .insert("temperature".into(), serde_json::json!(0.2));
        endpoint.extra.insert("stream".into(), serde_json::json!(true));

        let mut payload = serde_json::json!({"model": "m", "stream": false});
        merge_extra(&mut payload, &endpoint);
        assert_eq!(payload["temperature"], serde_json::json!(0.2));
        assert_eq!(payload["stream"], serde_json::json!(true));
    }
}
