//! Record processor service: raw request records in, per-record metric
//! values out.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::comms::{PullClient, PushClient};
use crate::config::UserConfig;
use crate::endpoints::{EndpointAdapter, adapter_for};
use crate::error::{AiperfError, ErrorDetails, Result};
use crate::messages::{Message, MetricRecordsMessage, RequestRecordMessage, ServiceType};
use crate::metrics::MetricRegistry;
use crate::models::metric::MetricRecordMetadata;
use crate::models::record::{
    ParsedResponse, ParsedResponseRecord, RequestRecord, ResponseData, Usage,
};
use crate::records::tokenizer::Tokenizer;
use crate::service::{Service, ServiceContext};

pub struct RecordProcessorService {
    inner: Arc<ProcessorInner>,
    pull: OnceLock<PullClient>,
}

struct ProcessorInner {
    adapter: Arc<dyn EndpointAdapter>,
    registry: MetricRegistry,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    service_id: OnceLock<String>,
    metrics_push: OnceLock<PushClient>,
}

impl RecordProcessorService {
    pub fn new(user_config: UserConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        let adapter = adapter_for(user_config.endpoint.endpoint_type);
        Self {
            inner: Arc::new(ProcessorInner {
                adapter,
                registry: MetricRegistry::standard(),
                tokenizer,
                service_id: OnceLock::new(),
                metrics_push: OnceLock::new(),
            }),
            pull: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Service for RecordProcessorService {
    fn service_type(&self) -> ServiceType {
        ServiceType::RecordProcessor
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = self.inner.service_id.set(ctx.service_id.clone());

        let metrics_push = ctx
            .push_client(&ctx.config.comms.metric_records.frontend)
            .await?;
        let _ = self.inner.metrics_push.set(metrics_push);

        let pull = ctx
            .pull_client(
                &ctx.config.comms.raw_records.backend,
                ctx.config.pull_max_concurrency,
            )
            .await?;

        let inner = self.inner.clone();
        pull.register_pull_callback(
            "request_record",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Message::RequestRecord(message) = message {
                        if let Err(e) = inner.process(message).await {
                            tracing::error!(error = %e, "failed to process request record");
                        }
                    }
                })
            }),
        )?;
        self.pull
            .set(pull)
            .map_err(|_| AiperfError::InvalidState("record processor already initialized".into()))?;
        Ok(())
    }

    async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
        self.pull
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .start()
            .await
    }
}

impl ProcessorInner {
    async fn process(&self, message: RequestRecordMessage) -> Result<()> {
        let RequestRecordMessage { worker_id, record } = message;

        let parsed = self.parse_record(record);
        let (results, metric_errors) = self.registry.compute_all(&parsed);
        for error in &metric_errors {
            tracing::warn!(kind = %error.kind, message = %error.message, "metric computation error");
        }

        let record_processor_id = self.service_id.get().cloned().unwrap_or_default();
        let request = &parsed.request;
        let duration_ns = request
            .end_perf_ns
            .map(|end| end.saturating_sub(request.start_perf_ns))
            .unwrap_or(0);

        let metadata = MetricRecordMetadata {
            conversation_id: request.conversation_id.clone(),
            turn_index: request.turn_index,
            x_request_id: request.x_request_id.clone(),
            x_correlation_id: request.x_correlation_id.clone(),
            request_start_ns: request.timestamp_ns,
            request_end_ns: request.timestamp_ns + duration_ns,
            worker_id: worker_id.clone(),
            record_processor_id: record_processor_id.clone(),
            benchmark_phase: request.credit_phase,
            was_cancelled: request.was_cancelled,
        };

        let message = MetricRecordsMessage {
            worker_id,
            record_processor_id,
            credit_phase: request.credit_phase,
            results: vec![results],
            metadata,
            valid: parsed.valid(),
            error: parsed.request.error.clone(),
        };

        self.metrics_push
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .push(&Message::MetricRecords(message))
            .await
    }

    /// Parse raw responses through the endpoint adapter and derive token
    /// counts. Parser failures become the record's error.
    fn parse_record(&self, mut record: RequestRecord) -> ParsedResponseRecord {
        let mut responses: Vec<ParsedResponse> = Vec::new();

        for raw in &record.responses {
            let payload = raw.payload_text();
            let trimmed = payload.trim();
            if trimmed.is_empty() || trimmed == crate::models::record::SSE_DONE_MARKER {
                continue;
            }
            match self.adapter.parse_response(raw.perf_ns(), trimmed) {
                Ok(Some(parsed)) => responses.push(parsed),
                Ok(None) => {}
                Err(e) => {
                    if record.error.is_none() {
                        record.error = Some(ErrorDetails::from(&e));
                    }
                }
            }
        }

        let (input, output, reasoning) = self.token_counts(&record, &responses);
        ParsedResponseRecord {
            request: record,
            responses,
            input_token_count: input,
            output_token_count: output,
            reasoning_token_count: reasoning,
        }
    }

    /// Server-reported usage wins; otherwise tokenize locally when a
    /// tokenizer is wired. Embeddings and rankings produce no tokens.
    fn token_counts(
        &self,
        record: &RequestRecord,
        responses: &[ParsedResponse],
    ) -> (Option<u64>, Option<u64>, Option<u64>) {
        let produces_tokens = self.adapter.metadata().produces_tokens;

        let usage: Option<&Usage> = responses.iter().rev().find_map(|r| r.usage.as_ref());

        let input = usage
            .and_then(|u| u.prompt_tokens)
            .or_else(|| self.tokenize_input(record));

        if !produces_tokens {
            return (input, Some(0), Some(0));
        }

        let output = usage.and_then(|u| u.completion_tokens).or_else(|| {
            self.tokenizer.as_ref().map(|tokenizer| {
                let text: String = responses
                    .iter()
                    .filter_map(|r| r.data.as_ref())
                    .filter_map(ResponseData::output_text)
                    .collect();
                tokenizer.count_tokens(&text) as u64
            })
        });

        let reasoning = usage
            .and_then(|u| {
                u.completion_tokens_details
                    .as_ref()
                    .and_then(|d| d.reasoning_tokens)
            })
            .or_else(|| {
                self.tokenizer.as_ref().and_then(|tokenizer| {
                    let text: String = responses
                        .iter()
                        .filter_map(|r| r.data.as_ref())
                        .filter_map(ResponseData::reasoning_text)
                        .collect();
                    if text.is_empty() {
                        None
                    } else {
                        Some(tokenizer.count_tokens(&text) as u64)
                    }
                })
            });

        (input, output, reasoning)
    }

    fn tokenize_input(&self, record: &RequestRecord) -> Option<u64> {
        let tokenizer = self.tokenizer.as_ref()?;
        let turn = record.turn.as_ref()?;
        let text = turn.text_contents().collect::<Vec<_>>().join(" ");
        Some(tokenizer.count_tokens(&text) as u64)
    }
}
