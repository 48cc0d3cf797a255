//! The canonical record metric set.

use std::sync::Arc;

use crate::error::{AiperfError, Result};
use crate::models::credit::NANOS_PER_SECOND;
use crate::models::metric::MetricValue;
use crate::models::record::ParsedResponseRecord;

use super::{MetricFlags, MetricValues, RecordMetric};

pub const REQUEST_LATENCY: &str = "request_latency";
pub const TIME_TO_FIRST_TOKEN: &str = "time_to_first_token";
pub const TIME_TO_SECOND_TOKEN: &str = "time_to_second_token";
pub const TIME_TO_FIRST_OUTPUT_TOKEN: &str = "time_to_first_output_token";
pub const INTER_TOKEN_LATENCY: &str = "inter_token_latency";
pub const INTER_CHUNK_LATENCY: &str = "inter_chunk_latency";
pub const OUTPUT_TOKEN_COUNT: &str = "output_token_count";
pub const REASONING_TOKEN_COUNT: &str = "reasoning_token_count";
pub const INPUT_TOKEN_COUNT: &str = "input_token_count";
pub const TOKENS_PER_SECOND: &str = "tokens_per_second";
pub const OUTPUT_SEQUENCE_LENGTH: &str = "output_sequence_length";
pub const ERROR_REQUEST_COUNT: &str = "error_request_count";
pub const CANCELLED_REQUEST_COUNT: &str = "cancelled_request_count";
pub const REQUEST_DELAY: &str = "request_delay";
pub const MIN_REQUEST_TIMESTAMP: &str = "min_request_timestamp";

pub fn standard_metrics() -> Vec<Arc<dyn RecordMetric>> {
    vec![
        Arc::new(RequestLatencyMetric),
        Arc::new(TimeToFirstTokenMetric),
        Arc::new(TimeToSecondTokenMetric),
        Arc::new(TimeToFirstOutputTokenMetric),
        Arc::new(InterTokenLatencyMetric),
        Arc::new(InterChunkLatencyMetric),
        Arc::new(OutputTokenCountMetric),
        Arc::new(ReasoningTokenCountMetric),
        Arc::new(InputTokenCountMetric),
        Arc::new(TokensPerSecondMetric),
        Arc::new(OutputSequenceLengthMetric),
        Arc::new(ErrorRequestCountMetric),
        Arc::new(CancelledRequestCountMetric),
        Arc::new(RequestDelayMetric),
        Arc::new(MinRequestTimestampMetric),
    ]
}

fn require_valid(record: &ParsedResponseRecord) -> Result<()> {
    if record.valid() {
        Ok(())
    } else {
        Err(AiperfError::NoMetricValue("record is not valid".into()))
    }
}

/// End-to-end request latency.
pub struct RequestLatencyMetric;

impl RecordMetric for RequestLatencyMetric {
    fn tag(&self) -> &'static str {
        REQUEST_LATENCY
    }
    fn header(&self) -> &'static str {
        "Request Latency"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        let duration = record
            .request_duration_ns()
            .ok_or_else(|| AiperfError::NoMetricValue("request has no end timestamp".into()))?;
        Ok(duration.into())
    }
}

/// Time from request start to the first chunk, reasoning included.
pub struct TimeToFirstTokenMetric;

impl RecordMetric for TimeToFirstTokenMetric {
    fn tag(&self) -> &'static str {
        TIME_TO_FIRST_TOKEN
    }
    fn header(&self) -> &'static str {
        "Time to First Token"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        let first = record
            .responses
            .first()
            .ok_or_else(|| AiperfError::NoMetricValue("no responses".into()))?;
        Ok(first.perf_ns.saturating_sub(record.start_perf_ns()).into())
    }
}

/// Gap between the first and second chunks.
pub struct TimeToSecondTokenMetric;

impl RecordMetric for TimeToSecondTokenMetric {
    fn tag(&self) -> &'static str {
        TIME_TO_SECOND_TOKEN
    }
    fn header(&self) -> &'static str {
        "Time to Second Token"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::STREAMING_TOKENS_ONLY | MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        if record.responses.len() < 2 {
            return Err(AiperfError::NoMetricValue("fewer than two responses".into()));
        }
        Ok((record.responses[1].perf_ns - record.responses[0].perf_ns).into())
    }
}

/// Time from request start to the first non-reasoning output token.
///
/// For models without reasoning this equals TTFT; for reasoning models it
/// skips past reasoning-only chunks.
pub struct TimeToFirstOutputTokenMetric;

impl RecordMetric for TimeToFirstOutputTokenMetric {
    fn tag(&self) -> &'static str {
        TIME_TO_FIRST_OUTPUT_TOKEN
    }
    fn header(&self) -> &'static str {
        "Time to First Output Token"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::STREAMING_TOKENS_ONLY | MetricFlags::SUPPORTS_REASONING | MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        let first_output = record
            .responses
            .iter()
            .find(|r| {
                r.data
                    .as_ref()
                    .and_then(|d| d.output_text())
                    .is_some()
            })
            .ok_or_else(|| {
                AiperfError::NoMetricValue(
                    "record has no non-reasoning output token".to_string(),
                )
            })?;
        Ok(first_output
            .perf_ns
            .saturating_sub(record.start_perf_ns())
            .into())
    }
}

/// Average gap per output token after the first.
pub struct InterTokenLatencyMetric;

impl RecordMetric for InterTokenLatencyMetric {
    fn tag(&self) -> &'static str {
        INTER_TOKEN_LATENCY
    }
    fn header(&self) -> &'static str {
        "Inter Token Latency"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::STREAMING_TOKENS_ONLY
    }
    fn required_metrics(&self) -> &'static [&'static str] {
        &[REQUEST_LATENCY, TIME_TO_FIRST_TOKEN, OUTPUT_TOKEN_COUNT]
    }
    fn compute(&self, _: &ParsedResponseRecord, prior: &MetricValues) -> Result<MetricValue> {
        let latency = prior.scalar(REQUEST_LATENCY)?;
        let ttft = prior.scalar(TIME_TO_FIRST_TOKEN)?;
        let output_tokens = prior.scalar(OUTPUT_TOKEN_COUNT)?;
        if output_tokens < 2.0 {
            return Err(AiperfError::NoMetricValue(
                "fewer than two output tokens".to_string(),
            ));
        }
        Ok(MetricValue::Scalar((latency - ttft) / (output_tokens - 1.0)))
    }
}

/// Per-chunk arrival gaps, as a sequence.
pub struct InterChunkLatencyMetric;

impl RecordMetric for InterChunkLatencyMetric {
    fn tag(&self) -> &'static str {
        INTER_CHUNK_LATENCY
    }
    fn header(&self) -> &'static str {
        "Inter Chunk Latency"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::STREAMING_TOKENS_ONLY | MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        if record.responses.len() < 2 {
            return Err(AiperfError::NoMetricValue("fewer than two responses".into()));
        }
        let gaps: Vec<f64> = record
            .responses
            .windows(2)
            .map(|pair| (pair[1].perf_ns - pair[0].perf_ns) as f64)
            .collect();
        Ok(MetricValue::Series(gaps))
    }
}

pub struct OutputTokenCountMetric;

impl RecordMetric for OutputTokenCountMetric {
    fn tag(&self) -> &'static str {
        OUTPUT_TOKEN_COUNT
    }
    fn header(&self) -> &'static str {
        "Output Token Count"
    }
    fn unit(&self) -> &'static str {
        "tokens"
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        record
            .output_token_count
            .map(Into::into)
            .ok_or_else(|| AiperfError::NoMetricValue("output token count unavailable".into()))
    }
}

pub struct ReasoningTokenCountMetric;

impl RecordMetric for ReasoningTokenCountMetric {
    fn tag(&self) -> &'static str {
        REASONING_TOKEN_COUNT
    }
    fn header(&self) -> &'static str {
        "Reasoning Token Count"
    }
    fn unit(&self) -> &'static str {
        "tokens"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::SUPPORTS_REASONING | MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        record
            .reasoning_token_count
            .map(Into::into)
            .ok_or_else(|| AiperfError::NoMetricValue("reasoning token count unavailable".into()))
    }
}

pub struct InputTokenCountMetric;

impl RecordMetric for InputTokenCountMetric {
    fn tag(&self) -> &'static str {
        INPUT_TOKEN_COUNT
    }
    fn header(&self) -> &'static str {
        "Input Token Count"
    }
    fn unit(&self) -> &'static str {
        "tokens"
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        require_valid(record)?;
        record
            .input_token_count
            .map(Into::into)
            .ok_or_else(|| AiperfError::NoMetricValue("input token count unavailable".into()))
    }
}

/// Output tokens per wall second of request duration.
pub struct TokensPerSecondMetric;

impl RecordMetric for TokensPerSecondMetric {
    fn tag(&self) -> &'static str {
        TOKENS_PER_SECOND
    }
    fn header(&self) -> &'static str {
        "Output Token Throughput Per Request"
    }
    fn unit(&self) -> &'static str {
        "tokens/s"
    }
    fn required_metrics(&self) -> &'static [&'static str] {
        &[REQUEST_LATENCY, OUTPUT_TOKEN_COUNT]
    }
    fn compute(&self, _: &ParsedResponseRecord, prior: &MetricValues) -> Result<MetricValue> {
        let latency = prior.scalar(REQUEST_LATENCY)?;
        let tokens = prior.scalar(OUTPUT_TOKEN_COUNT)?;
        if latency <= 0.0 {
            return Err(AiperfError::NoMetricValue("zero-duration request".into()));
        }
        Ok(MetricValue::Scalar(tokens / (latency / NANOS_PER_SECOND as f64)))
    }
}

/// Total generated sequence length, reasoning included.
pub struct OutputSequenceLengthMetric;

impl RecordMetric for OutputSequenceLengthMetric {
    fn tag(&self) -> &'static str {
        OUTPUT_SEQUENCE_LENGTH
    }
    fn header(&self) -> &'static str {
        "Output Sequence Length"
    }
    fn unit(&self) -> &'static str {
        "tokens"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::NO_CONSOLE
    }
    fn required_metrics(&self) -> &'static [&'static str] {
        &[OUTPUT_TOKEN_COUNT]
    }
    fn compute(&self, record: &ParsedResponseRecord, prior: &MetricValues) -> Result<MetricValue> {
        let output = prior.scalar(OUTPUT_TOKEN_COUNT)?;
        let reasoning = record.reasoning_token_count.unwrap_or(0) as f64;
        Ok(MetricValue::Scalar(output + reasoning))
    }
}

/// 1 for errored requests; absent otherwise, so count == error count.
pub struct ErrorRequestCountMetric;

impl RecordMetric for ErrorRequestCountMetric {
    fn tag(&self) -> &'static str {
        ERROR_REQUEST_COUNT
    }
    fn header(&self) -> &'static str {
        "Error Request Count"
    }
    fn unit(&self) -> &'static str {
        "requests"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::INTERNAL
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        if record.has_error() {
            Ok(MetricValue::Scalar(1.0))
        } else {
            Err(AiperfError::NoMetricValue("request did not error".into()))
        }
    }
}

/// 1 for requests cancelled past their deadline; absent otherwise.
pub struct CancelledRequestCountMetric;

impl RecordMetric for CancelledRequestCountMetric {
    fn tag(&self) -> &'static str {
        CANCELLED_REQUEST_COUNT
    }
    fn header(&self) -> &'static str {
        "Cancelled Request Count"
    }
    fn unit(&self) -> &'static str {
        "requests"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::INTERNAL
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        if record.request.was_cancelled {
            Ok(MetricValue::Scalar(1.0))
        } else {
            Err(AiperfError::NoMetricValue("request was not cancelled".into()))
        }
    }
}

/// How late the request went out vs its scheduled instant.
pub struct RequestDelayMetric;

impl RecordMetric for RequestDelayMetric {
    fn tag(&self) -> &'static str {
        REQUEST_DELAY
    }
    fn header(&self) -> &'static str {
        "Request Delay"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        record
            .request
            .delayed_ns
            .map(Into::into)
            .ok_or_else(|| AiperfError::NoMetricValue("request had no scheduled instant".into()))
    }
}

/// Wall-clock request start, used by duration filtering.
pub struct MinRequestTimestampMetric;

impl RecordMetric for MinRequestTimestampMetric {
    fn tag(&self) -> &'static str {
        MIN_REQUEST_TIMESTAMP
    }
    fn header(&self) -> &'static str {
        "Minimum Request Timestamp"
    }
    fn unit(&self) -> &'static str {
        "ns"
    }
    fn flags(&self) -> MetricFlags {
        MetricFlags::INTERNAL | MetricFlags::NO_CONSOLE
    }
    fn compute(&self, record: &ParsedResponseRecord, _: &MetricValues) -> Result<MetricValue> {
        Ok(MetricValue::Scalar(record.request.timestamp_ns as f64))
    }
}
