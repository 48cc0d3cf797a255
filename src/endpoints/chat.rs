//! OpenAI Chat Completions adapter.
//!
//! Supports multi-modal inputs (text, images, audio, video) and both
//! streaming and non-streaming responses.

use serde_json::{Value, json};

use crate::error::{AiperfError, Result};
use crate::models::dataset::Turn;
use crate::models::record::{ParsedResponse, ResponseData};

use super::{EndpointAdapter, EndpointMetadata, RequestInfo, merge_extra, parse_usage, resolve_model};

const DEFAULT_ROLE: &str = "user";

pub struct ChatAdapter;

impl EndpointAdapter for ChatAdapter {
    fn metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            endpoint_path: "/v1/chat/completions",
            supports_streaming: true,
            produces_tokens: true,
            tokenizes_input: true,
            supports_audio: true,
            supports_images: true,
            supports_videos: true,
            metrics_title: "LLM Metrics",
        }
    }

    fn format_payload(&self, request: &RequestInfo<'_>) -> Result<Value> {
        let Some(last_turn) = request.turns.last() else {
            return Err(AiperfError::Config(
                "chat endpoint requires at least one turn".to_string(),
            ));
        };

        let messages = request
            .turns
            .iter()
            .map(build_message)
            .collect::<Result<Vec<_>>>()?;

        let mut payload = json!({
            "messages": messages,
            "model": resolve_model(last_turn, request.endpoint),
            "stream": request.endpoint.streaming,
        });
        if let Some(max_tokens) = last_turn.max_tokens {
            payload["max_completion_tokens"] = json!(max_tokens);
        }
        merge_extra(&mut payload, request.endpoint);
        Ok(payload)
    }

    fn parse_response(&self, perf_ns: u64, payload: &str) -> Result<Option<ParsedResponse>> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let json: Value = serde_json::from_str(trimmed)
            .map_err(|e| AiperfError::ResponseParse(format!("invalid chat response JSON: {e}")))?;

        let data = extract_chat_data(&json)?;
        let usage = parse_usage(&json);
        if data.is_none() && usage.is_none() {
            return Ok(None);
        }
        Ok(Some(ParsedResponse {
            perf_ns,
            data,
            usage,
        }))
    }
}

fn build_message(turn: &Turn) -> Result<Value> {
    let role = turn.role.as_deref().unwrap_or(DEFAULT_ROLE);

    // Single-text single-content turns use a flat content string, since the
    // Dynamo API does not accept a content-part list.
    if turn.texts.len() == 1
        && turn.texts[0].contents.len() == 1
        && turn.images.is_empty()
        && turn.audios.is_empty()
        && turn.videos.is_empty()
    {
        let mut message = json!({
            "role": role,
            "content": turn.texts[0].contents[0],
        });
        if !turn.texts[0].name.is_empty() {
            message["name"] = json!(turn.texts[0].name);
        }
        return Ok(message);
    }

    let mut parts = Vec::new();
    for content in turn.texts.iter().flat_map(|t| &t.contents) {
        if content.is_empty() {
            continue;
        }
        parts.push(json!({"type": "text", "text": content}));
    }
    for content in turn.images.iter().flat_map(|i| &i.contents) {
        if content.is_empty() {
            continue;
        }
        parts.push(json!({"type": "image_url", "image_url": {"url": content}}));
    }
    for content in turn.audios.iter().flat_map(|a| &a.contents) {
        if content.is_empty() {
            continue;
        }
        let Some((format, b64_audio)) = content.split_once(',') else {
            return Err(AiperfError::Config(
                "audio content must be in the format 'format,b64_audio'".to_string(),
            ));
        };
        parts.push(json!({
            "type": "input_audio",
            "input_audio": {"data": b64_audio, "format": format},
        }));
    }
    for content in turn.videos.iter().flat_map(|v| &v.contents) {
        if content.is_empty() {
            continue;
        }
        parts.push(json!({"type": "video_url", "video_url": {"url": content}}));
    }

    Ok(json!({"role": role, "content": parts}))
}

/// Extract content from an OpenAI chat response object, handling both the
/// non-streaming (`chat.completion` / `message`) and streaming
/// (`chat.completion.chunk` / `delta`) shapes.
fn extract_chat_data(json: &Value) -> Result<Option<ResponseData>> {
    let data_key = match json.get("object").and_then(Value::as_str) {
        Some("chat.completion") => "message",
        Some("chat.completion.chunk") => "delta",
        other => {
            return Err(AiperfError::ResponseParse(format!(
                "unsupported OpenAI object type: {other:?}"
            )));
        }
    };

    let Some(data) = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get(data_key))
    else {
        return Ok(None);
    };

    let content = data
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    // `reasoning_content` takes precedence over `reasoning`.
    let reasoning = data
        .get("reasoning_content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            data.get("reasoning")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        });

    Ok(match (content, reasoning) {
        (None, None) => None,
        (Some(text), None) => Some(ResponseData::Text {
            text: text.to_string(),
        }),
        (content, Some(reasoning)) => Some(ResponseData::Reasoning {
            content: content.map(str::to_string),
            reasoning: Some(reasoning.to_string()),
        }),
    })
}
