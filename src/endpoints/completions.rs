//! OpenAI (legacy) Completions adapter. Single-turn only.

use serde_json::{Value, json};

use crate::error::{AiperfError, Result};
use crate::models::record::{ParsedResponse, ResponseData};

use super::{EndpointAdapter, EndpointMetadata, RequestInfo, merge_extra, parse_usage, resolve_model};

pub struct CompletionsAdapter;

impl EndpointAdapter for CompletionsAdapter {
    fn metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            endpoint_path: "/v1/completions",
            supports_streaming: true,
            produces_tokens: true,
            tokenizes_input: true,
            supports_audio: false,
            supports_images: false,
            supports_videos: false,
            metrics_title: "LLM Metrics",
        }
    }

    fn format_payload(&self, request: &RequestInfo<'_>) -> Result<Value> {
        // Multi-turn is not supported here; only the last turn is used.
        let Some(turn) = request.turns.last() else {
            return Err(AiperfError::Config(
                "completions endpoint requires at least one turn".to_string(),
            ));
        };

        let prompt = turn.text_contents().collect::<Vec<_>>().join(" ");

        let mut payload = json!({
            "prompt": prompt,
            "model": resolve_model(turn, request.endpoint),
            "stream": request.endpoint.streaming,
        });
        if let Some(max_tokens) = turn.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        merge_extra(&mut payload, request.endpoint);
        Ok(payload)
    }

    fn parse_response(&self, perf_ns: u64, payload: &str) -> Result<Option<ParsedResponse>> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let json: Value = serde_json::from_str(trimmed).map_err(|e| {
            AiperfError::ResponseParse(format!("invalid completions response JSON: {e}"))
        })?;

        let text = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("text"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());

        let usage = parse_usage(&json);
        if text.is_none() && usage.is_none() {
            return Ok(None);
        }
        Ok(Some(ParsedResponse {
            perf_ns,
            data: text.map(|t| ResponseData::Text {
                text: t.to_string(),
            }),
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, EndpointType};
    use crate::models::dataset::{Media, Turn};

    #[test]
    fn prompt_concatenates_non_empty_texts() {
        let turns = vec![Turn {
            texts: vec![
                Media::named("", vec!["once upon".into(), "".into()]),
                Media::text("a time"),
            ],
            max_tokens: Some(64),
            ..Default::default()
        }];
        let endpoint = EndpointConfig::new("http://h", EndpointType::Completions);
        let payload = CompletionsAdapter
            .format_payload(&RequestInfo {
                turns: &turns,
                endpoint: &endpoint,
            })
            .unwrap();
        assert_eq!(payload["prompt"], json!("once upon a time"));
        assert_eq!(payload["max_tokens"], json!(64));
    }

    #[test]
    fn only_last_turn_is_used() {
        let turns = vec![
            Turn {
                texts: vec![Media::text("first")],
                ..Default::default()
            },
            Turn {
                texts: vec![Media::text("second")],
                ..Default::default()
            },
        ];
        let endpoint = EndpointConfig::new("http://h", EndpointType::Completions);
        let payload = CompletionsAdapter
            .format_payload(&RequestInfo {
                turns: &turns,
                endpoint: &endpoint,
            })
            .unwrap();
        assert_eq!(payload["prompt"], json!("second"));
    }

    #[test]
    fn parse_extracts_choice_text() {
        let body = r#"{"object":"text_completion","choices":[{"text":" the end"}]}"#;
        let parsed = CompletionsAdapter.parse_response(3, body).unwrap().unwrap();
        assert_eq!(
            parsed.data,
            Some(ResponseData::Text {
                text: " the end".into()
            })
        );
    }

    #[test]
    fn parse_empty_choices_is_none() {
        let body = r#"{"object":"text_completion","choices":[]}"#;
        assert!(CompletionsAdapter.parse_response(3, body).unwrap().is_none());
    }
}
