//! Data model shared across services.

pub mod credit;
pub mod dataset;
pub mod metric;
pub mod record;
pub mod telemetry;
pub mod worker;

pub use credit::{
    CreditPhase, CreditPhaseConfig, CreditPhaseStats, NANOS_PER_SECOND, ProcessingStats,
};
pub use dataset::{Conversation, Media, Turn};
pub use metric::{
    MetricRecord, MetricRecordMetadata, MetricResult, MetricValue, ProcessRecordsOutput,
    ProfileResults, percentile,
};
pub use record::{
    CompletionTokensDetails, ParsedResponse, ParsedResponseRecord, RawResponse, RequestRecord,
    ResponseData, SseField, SseMessage, TextResponse, Usage,
};
pub use telemetry::{
    GpuMetadata, GpuTelemetryData, GpuTelemetrySnapshot, TELEMETRY_METRIC_FIELDS,
    TelemetryHierarchy, TelemetryMetrics, TelemetryRecord,
};
pub use worker::{ProcessHealth, WorkerHealth, WorkerPhaseTaskStats};
