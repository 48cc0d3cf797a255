//! NIM-style rankings adapter. Single-turn; texts named `query` and
//! `passages`.

use serde_json::{Value, json};

use crate::error::{AiperfError, Result};
use crate::models::record::{ParsedResponse, ResponseData};

use super::{EndpointAdapter, EndpointMetadata, RequestInfo, merge_extra, parse_usage, resolve_model};

pub struct RankingsAdapter;

impl EndpointAdapter for RankingsAdapter {
    fn metadata(&self) -> EndpointMetadata {
        EndpointMetadata {
            endpoint_path: "/v1/ranking",
            supports_streaming: false,
            produces_tokens: false,
            tokenizes_input: true,
            supports_audio: false,
            supports_images: false,
            supports_videos: false,
            metrics_title: "Rankings Metrics",
        }
    }

    fn format_payload(&self, request: &RequestInfo<'_>) -> Result<Value> {
        let Some(turn) = request.turns.last() else {
            return Err(AiperfError::Config(
                "rankings endpoint requires at least one turn".to_string(),
            ));
        };

        let query = turn
            .texts
            .iter()
            .find(|t| t.name == "query")
            .and_then(|t| t.contents.iter().find(|c| !c.is_empty()))
            .ok_or_else(|| {
                AiperfError::Config("rankings endpoint requires a 'query' text".to_string())
            })?;

        let passages: Vec<Value> = turn
            .texts
            .iter()
            .filter(|t| t.name == "passages")
            .flat_map(|t| t.contents.iter())
            .filter(|c| !c.is_empty())
            .map(|c| json!({"text": c}))
            .collect();

        let mut payload = json!({
            "query": {"text": query},
            "passages": passages,
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
            AiperfError::ResponseParse(format!("invalid rankings response JSON: {e}"))
        })?;

        let Some(rankings) = json.get("rankings").and_then(Value::as_array) else {
            return Ok(None);
        };

        Ok(Some(ParsedResponse {
            perf_ns,
            data: Some(ResponseData::Rankings {
                rankings: rankings.clone(),
            }),
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
        EndpointConfig::new("http://h", EndpointType::Rankings)
    }

    #[test]
    fn query_and_passages_are_shaped() {
        let turns = vec![Turn {
            texts: vec![
                Media::named("query", vec!["what is rust".into()]),
                Media::named("passages", vec!["a language".into(), "a fungus".into()]),
            ],
            ..Default::default()
        }];
        let ep = endpoint();
        let payload = RankingsAdapter
            .format_payload(&RequestInfo {
                turns: &turns,
                endpoint: &ep,
            })
            .unwrap();
        assert_eq!(payload["query"], json!({"text": "what is rust"}));
        assert_eq!(payload["passages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_query_errors() {
        let turns = vec![Turn {
            texts: vec![Media::named("passages", vec!["p".into()])],
            ..Default::default()
        }];
        let ep = endpoint();
        assert!(
            RankingsAdapter
                .format_payload(&RequestInfo {
                    turns: &turns,
                    endpoint: &ep,
                })
                .is_err()
        );
    }

    #[test]
    fn rankings_are_passed_through_verbatim() {
        let body = r#"{"rankings":[{"index":1,"logit":3.2},{"index":0,"logit":-1.0}]}"#;
        let parsed = RankingsAdapter.parse_response(9, body).unwrap().unwrap();
        match parsed.data {
            Some(ResponseData::Rankings { rankings }) => {
                assert_eq!(rankings.len(), 2);
                assert_eq!(rankings[0]["index"], json!(1));
            }
            other => panic!("unexpected data: {other:?}"),
        }
    }
}
