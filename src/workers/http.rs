//! HTTP transport for inference requests.
//!
//! One pooled client per worker. Unary bodies produce a single timed
//! `TextResponse`; streaming bodies are parsed through the SSE reader with
//! one timed message per stream frame. Status >= 400 is not an error at
//! this layer: the outcome carries the status and the worker captures it
//! into the record.

use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;

use crate::clock;
use crate::error::{AiperfError, Result};
use crate::models::record::{RawResponse, TextResponse};
use crate::workers::sse::{SseStreamReader, inspect_message_for_error};

/// A fully-shaped request, ready to send.
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub streaming: bool,
}

/// Timed result of one HTTP attempt.
pub struct HttpOutcome {
    pub status: u16,
    pub responses: Vec<RawResponse>,
    pub start_perf_ns: u64,
    pub end_perf_ns: u64,
    pub recv_start_perf_ns: Option<u64>,
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }

    pub async fn send(&self, request: &HttpRequest) -> Result<HttpOutcome> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let start_perf_ns = clock::perf_now_ns();
        let response = builder.send().await?;
        let status = response.status().as_u16();

        if request.streaming && status < 400 {
            self.read_streaming(response, start_perf_ns).await
        } else {
            let body = response.text().await?;
            let end_perf_ns = clock::perf_now_ns();
            let responses = if body.is_empty() {
                Vec::new()
            } else {
                vec![RawResponse::Text(TextResponse {
                    perf_ns: end_perf_ns,
                    content_type: None,
                    text: body,
                })]
            };
            Ok(HttpOutcome {
                status,
                responses,
                start_perf_ns,
                end_perf_ns,
                recv_start_perf_ns: None,
            })
        }
    }

    async fn read_streaming(
        &self,
        response: reqwest::Response,
        start_perf_ns: u64,
    ) -> Result<HttpOutcome> {
        let status = response.status().as_u16();
        let recv_start_perf_ns = clock::perf_now_ns();

        let mut reader = SseStreamReader::new();
        let mut responses = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(AiperfError::from)?;
            let chunk_perf_ns = clock::perf_now_ns();
            for message in reader.push_chunk(&chunk, chunk_perf_ns) {
                inspect_message_for_error(&message)?;
                responses.push(RawResponse::Sse(message));
            }
        }
        if let Some(message) = reader.finish(clock::perf_now_ns()) {
            inspect_message_for_error(&message)?;
            responses.push(RawResponse::Sse(message));
        }

        Ok(HttpOutcome {
            status,
            responses,
            start_perf_ns,
            end_perf_ns: clock::perf_now_ns(),
            recv_start_perf_ns: Some(recv_start_perf_ns),
        })
    }
}
