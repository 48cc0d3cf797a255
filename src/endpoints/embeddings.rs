//! OpenAI Embeddings adapter. Single-turn, never streaming.

use serde_json::{Value, json};

use crate::error::{AiperfError, Result};
use crate::models::record::{ParsedResponse, ResponseData};

use super::{EndpointAdapter, EndpointMetadata, RequestInfo, merge_extra, parse_usage, resolve_model};

pub struct EmbeddingsAdapter;

impl EndpointAdapter for EmbeddingsAdapter {
    fn metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            endpoint_path: "/v1/embeddings",
            supports_streaming: false,
            produces_tokens: false,
            tokenizes_input: true,
            supports_audio: false,
            supports_images: false,
            supports_videos: false,
            metrics_title: "Embeddings Metrics",
        }
    }

    fn format_payload(&self, request: &RequestInfo<'_>) -> Result<Value> {
        let Some(turn) = request.turns.last() else {
            return Err(AiperfError::Config(
                "embeddings endpoint requires at least one turn".to_string(),
            ));
        };
        if turn.max_tokens.is_some() {
            return Err(AiperfError::Config(
                "embeddings endpoint does not accept max_tokens".to_string(),
            ));
        }

        let input: Vec<&str> = turn.text_contents().collect();
        let mut payload = json!({
            "input": input,
            "model": resolve_model(turn, request.endpoint),
        });
        merge_extra(&mut payload, request.endpoint);
        Ok(payload)
    }

    fn parse_response(&self, perf_ns: u64, payload: &str) -> Result<Option<ParsedResponse>> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let json: Value = serde_json::from_str(trimmed).map_err(|e| {
            AiperfError::ResponseParse(format!("invalid embeddings response JSON: {e}"))
        })?;

        let Some(items) = json.get("data").and_then(Value::as_array) else {
            return Ok(None);
        };

        let mut embeddings = Vec::new();
        for item in items {
            match item.get("object").and_then(Value::as_str) {
                Some("embedding") => {}
                other => {
                    return Err(AiperfError::ResponseParse(format!(
                        "expected embedding object, got {other:?}"
                    )));
                }
            }
            if let Some(vector) = item.get("embedding").and_then(Value::as_array) {
                embeddings.push(
                    vector
                        .iter()
                        .filter_map(Value::as_f64)
                        .collect::<Vec<f64>>(),
                );
            }
        }

        Ok(Some(ParsedResponse {
            perf_ns,
            data: Some(ResponseData::Embedding { embeddings }),
            usage: parse_usage(&json),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, EndpointType};
    use crate::models::dataset::{Media, Turn};

    fn endpoint() -> EndpointConfig {
        EndpointConfig::new("http://h", EndpointType::Embeddings)
    }

    #[test]
    fn input_is_text_list() {
        let turns = vec![Turn {
            texts: vec![Media::text("alpha"), Media::text("beta")],
            ..Default::default()
        }];
        let ep = endpoint();
        let payload = EmbeddingsAdapter
            .format_payload(&RequestInfo {
                turns: &turns,
                endpoint: &ep,
            })
            .unwrap();
        assert_eq!(payload["input"], json!(["alpha", "beta"]));
    }

    #[test]
    fn max_tokens_is_rejected() {
        let turns = vec![Turn {
            texts: vec![Media::text("alpha")],
            max_tokens: Some(8),
            ..Default::default()
        }];
        let ep = endpoint();
        assert!(
            EmbeddingsAdapter
                .format_payload(&RequestInfo {
                    turns: &turns,
                    endpoint: &ep,
                })
                .is_err()
        );
    }

    #[test]
    fn parse_collects_embedding_vectors() {
        let body = r#"{"object":"list","data":[
            {"object":"embedding","embedding":[0.1,0.2]},
            {"object":"embedding","embedding":[0.3,0.4]}]}"#;
        let parsed = EmbeddingsAdapter.parse_response(2, body).unwrap().unwrap();
        assert_eq!(
            parsed.data,
            Some(ResponseData::Embedding {
                embeddings: vec![vec![0.1, 0.2], vec![0.3, 0.4]],
            })
        );
    }

    #[test]
    fn wrong_object_type_errors() {
        let body = r#"{"object":"list","data":[{"object":"text","embedding":[0.1]}]}"#;
        assert!(EmbeddingsAdapter.parse_response(2, body).is_err());
    }
}
