//! Results processors: end-of-run aggregation.
//!
//! Record processors are per-request and streaming; results processors
//! accumulate across the whole run and summarize once at the end.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::metrics::{MetricRegistry, types};
use crate::models::credit::NANOS_PER_SECOND;
use crate::models::metric::{MetricRecord, MetricRecordMetadata, MetricResult, MetricValue};
use crate::models::telemetry::{TELEMETRY_METRIC_FIELDS, TelemetryHierarchy, TelemetryRecord};

#[async_trait]
pub trait ResultsProcessor: Send + Sync {
    async fn process_result(
        &self,
        metadata: &MetricRecordMetadata,
        result: &MetricRecord,
    ) -> Result<()>;

    async fn process_telemetry_record(&self, _record: &TelemetryRecord) -> Result<()> {
        Ok(())
    }

    async fn summarize(&self) -> Result<Vec<MetricResult>>;
}

/// The sending window of a time-bounded profiling phase, for duration
/// filtering.
#[derive(Debug, Clone, Copy)]
pub struct PhaseWindow {
    pub start_time_ns: u64,
    pub duration_sec: f64,
    pub grace_period_sec: f64,
}

struct StoredRecord {
    request_start_ns: u64,
    results: Vec<MetricRecord>,
}

/// The primary processor: per-tag statistical summaries over all records.
pub struct MetricResultsProcessor {
    registry: MetricRegistry,
    records: Mutex<Vec<StoredRecord>>,
    window: Mutex<Option<PhaseWindow>>,
}

impl MetricResultsProcessor {
    pub fn new() -> Self {
        Self {
            registry: MetricRegistry::standard(),
            records: Mutex::new(Vec::new()),
            window: Mutex::new(None),
        }
    }

    /// Configure duration filtering for a time-bounded phase.
    pub fn set_phase_window(&self, window: Option<PhaseWindow>) {
        *self.window.lock() = window;
    }

    /// A record is included iff its completion instant
    /// (`min_request_timestamp + latency`) falls within
    /// `duration + grace_period` of the phase start. Records missing the
    /// inputs are included: the filter only excludes what it can prove is
    /// out of window.
    fn included(window: &PhaseWindow, record: &StoredRecord) -> bool {
        let latency = record
            .results
            .iter()
            .find_map(|r| r.get(types::REQUEST_LATENCY))
            .and_then(MetricValue::as_scalar);
        let Some(latency_ns) = latency else {
            return true;
        };

        let completion_ns = record.request_start_ns as f64 + latency_ns;
        let window_end_ns = window.start_time_ns as f64
            + (window.duration_sec + window.grace_period_sec) * NANOS_PER_SECOND as f64;
        completion_ns <= window_end_ns
    }
}

impl Default for MetricResultsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultsProcessor for MetricResultsProcessor {
    async fn process_result(
        &self,
        metadata: &MetricRecordMetadata,
        result: &MetricRecord,
    ) -> Result<()> {
        let mut records = self.records.lock();
        // One stored entry per request; turns of the same request arrive
        // together in a single results list upstream, so each call is one
        // record.
        records.push(StoredRecord {
            request_start_ns: metadata.request_start_ns,
            results: vec![result.clone()],
        });
        Ok(())
    }

    async fn summarize(&self) -> Result<Vec<MetricResult>> {
        let window = *self.window.lock();
        let records = self.records.lock();

        let mut values_by_tag: std::collections::BTreeMap<&str, Vec<f64>> =
            std::collections::BTreeMap::new();
        for record in records.iter() {
            if let Some(window) = &window {
                if !Self::included(window, record) {
                    continue;
                }
            }
            for results in &record.results {
                for (tag, value) in results {
                    values_by_tag
                        .entry(tag.as_str())
                        .or_default()
                        .extend_from_slice(value.values());
                }
            }
        }

        let mut summaries = Vec::new();
        for (tag, values) in values_by_tag {
            let (header, unit) = match self.registry.display_info(tag) {
                Some((header, unit)) => (header, unit),
                None => (tag, ""),
            };
            if let Some(summary) = MetricResult::from_values(tag, header, unit, &values) {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }
}

/// Hierarchical GPU telemetry aggregation, one summary per
/// `(dcgm_url, gpu_uuid, metric)` triple.
pub struct TelemetryResultsProcessor {
    hierarchy: Mutex<TelemetryHierarchy>,
}

impl TelemetryResultsProcessor {
    pub fn new() -> Self {
        Self {
            hierarchy: Mutex::new(TelemetryHierarchy::default()),
        }
    }
}

impl Default for TelemetryResultsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultsProcessor for TelemetryResultsProcessor {
    async fn process_result(
        &self,
        _metadata: &MetricRecordMetadata,
        _result: &MetricRecord,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_telemetry_record(&self, record: &TelemetryRecord) -> Result<()> {
        self.hierarchy.lock().add_record(record);
        Ok(())
    }

    async fn summarize(&self) -> Result<Vec<MetricResult>> {
        let hierarchy = self.hierarchy.lock();
        let mut results = Vec::new();

        for (dcgm_url, gpus) in &hierarchy.dcgm_endpoints {
            for (gpu_uuid, data) in gpus {
                let gpu_index = data.metadata.gpu_index;
                let url_tag: String = dcgm_url
                    .chars()
                    .map(|c| if matches!(c, ':' | '/' | '.') { '_' } else { c })
                    .collect();
                let short_uuid = &gpu_uuid[..gpu_uuid.len().min(12)];

                for (metric_name, header, unit) in TELEMETRY_METRIC_FIELDS {
                    let tag = format!("{metric_name}_dcgm_{url_tag}_gpu{gpu_index}_{short_uuid}");
                    let header = format!("{header} (GPU {gpu_index}, {short_uuid})");
                    match data.to_metric_result(metric_name, &tag, &header, unit) {
                        Ok(result) => results.push(result),
                        Err(e) if e.is_no_metric_value() => {}
                        Err(e) => {
                            tracing::warn!(
                                metric = metric_name,
                                gpu = %gpu_uuid,
                                error = %e,
                                "telemetry summarization failed"
                            );
                        }
                    }
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credit::CreditPhase;
    use crate::models::telemetry::TelemetryMetrics;

    fn metadata(request_start_ns: u64) -> MetricRecordMetadata {
        MetricRecordMetadata {
            conversation_id: None,
            turn_index: None,
            x_request_id: None,
            x_correlation_id: None,
            request_start_ns,
            request_end_ns: request_start_ns + 1,
            worker_id: "worker-1".into(),
            record_processor_id: "rp-1".into(),
            benchmark_phase: CreditPhase::Profiling,
            was_cancelled: false,
        }
    }

    fn latency_record(latency_ns: f64) -> MetricRecord {
        let mut record = MetricRecord::new();
        record.insert(
            types::REQUEST_LATENCY.to_string(),
            MetricValue::Scalar(latency_ns),
        );
        record
    }

    #[tokio::test]
    async fn summarize_without_window_includes_everything() {
        let processor = MetricResultsProcessor::new();
        for latency in [100.0, 200.0, 300.0] {
            processor
                .process_result(&metadata(0), &latency_record(latency))
                .await
                .unwrap();
        }
        let results = processor.summarize().await.unwrap();
        let latency = results
            .iter()
            .find(|r| r.tag == types::REQUEST_LATENCY)
            .unwrap();
        assert_eq!(latency.count, 3);
        assert_eq!(latency.avg, 200.0);
        assert_eq!(latency.header, "Request Latency");
    }

    #[tokio::test]
    async fn duration_filter_excludes_late_completions() {
        // Phase starts at T, runs 2s with 1s grace: completions after T+3s
        // are out.
        let t = 1_000_000_000_u64;
        let processor = MetricResultsProcessor::new();
        processor.set_phase_window(Some(PhaseWindow {
            start_time_ns: t,
            duration_sec: 2.0,
            grace_period_sec: 1.0,
        }));

        // Completes at T+2.9s: included.
        processor
            .process_result(
                &metadata(t + (15 * NANOS_PER_SECOND / 10)),
                &latency_record(1.4 * NANOS_PER_SECOND as f64),
            )
            .await
            .unwrap();
        // Completes at T+3.1s: excluded.
        processor
            .process_result(
                &metadata(t + (17 * NANOS_PER_SECOND / 10)),
                &latency_record(1.4 * NANOS_PER_SECOND as f64),
            )
            .await
            .unwrap();
        // No latency metric: conservatively included.
        processor
            .process_result(&metadata(t), &MetricRecord::new())
            .await
            .unwrap();

        let results = processor.summarize().await.unwrap();
        let latency = results
            .iter()
            .find(|r| r.tag == types::REQUEST_LATENCY)
            .unwrap();
        assert_eq!(latency.count, 1);
    }

    #[tokio::test]
    async fn telemetry_summaries_are_per_gpu_and_metric() {
        let processor = TelemetryResultsProcessor::new();
        for (ts, power) in [(10, 100.0), (20, 140.0)] {
            processor
                .process_telemetry_record(&TelemetryRecord {
                    timestamp_ns: ts,
                    dcgm_url: "http://n1:9401/metrics".into(),
                    gpu_index: 0,
                    gpu_uuid: "GPU-0123456789abcdef".into(),
                    gpu_model_name: "NVIDIA H100".into(),
                    pci_bus_id: None,
                    device: None,
                    hostname: None,
                    telemetry_data: TelemetryMetrics {
                        gpu_power_usage: Some(power),
                        ..Default::default()
                    },
                })
                .await
                .unwrap();
        }

        let results = processor.summarize().await.unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.tag.starts_with("gpu_power_usage_dcgm_"));
        assert!(result.tag.contains("_gpu0_GPU-01234567"));
        assert_eq!(result.count, 2);
        assert_eq!(result.avg, 120.0);
        assert_eq!(result.unit, "W");
    }
}
