//! Records manager: aggregates per-record metric values into the final
//! statistical report.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock;
use crate::comms::{PubClient, PullClient};
use crate::config::UserConfig;
use crate::error::{AiperfError, ErrorDetails, ErrorDetailsCount, Result};
use crate::messages::{
    AllRecordsReceivedMessage, CommandKind, CommandMessage, CreditPhaseCompleteMessage,
    CreditPhaseStartMessage, Message, MetricRecordsMessage, ProcessRecordsResultMessage,
    RecordsProcessingStatsMessage, ServiceType, TelemetryRecordsMessage,
};
use crate::models::credit::{CreditPhase, ProcessingStats};
use crate::models::metric::{ProcessRecordsOutput, ProfileResults};
use crate::records::results::{
    MetricResultsProcessor, PhaseWindow, ResultsProcessor, TelemetryResultsProcessor,
};
use crate::service::{Service, ServiceContext};

pub struct RecordsManagerService {
    inner: Arc<ManagerInner>,
    pull: OnceLock<PullClient>,
}

struct ManagerInner {
    user_config: UserConfig,
    metric_processor: Arc<MetricResultsProcessor>,
    processors: Vec<Arc<dyn ResultsProcessor>>,
    state: parking_lot::Mutex<ManagerState>,
    summarized: AtomicBool,
    service_id: OnceLock<String>,
    publisher: OnceLock<Arc<PubClient>>,
}

#[derive(Default)]
struct ManagerState {
    profile_cancelled: bool,
    start_time_ns: Option<u64>,
    end_time_ns: Option<u64>,
    final_request_count: Option<u64>,
    processing_stats: ProcessingStats,
    worker_stats: BTreeMap<String, ProcessingStats>,
    error_summary: HashMap<ErrorDetails, u64>,
}

impl RecordsManagerService {
    pub fn new(user_config: UserConfig) -> Self {
        let metric_processor = Arc::new(MetricResultsProcessor::new());
        let telemetry_processor = Arc::new(TelemetryResultsProcessor::new());
        let processors: Vec<Arc<dyn ResultsProcessor>> =
            vec![metric_processor.clone(), telemetry_processor];
        Self {
            inner: Arc::new(ManagerInner {
                user_config,
                metric_processor,
                processors,
                state: parking_lot::Mutex::new(ManagerState::default()),
                summarized: AtomicBool::new(false),
                service_id: OnceLock::new(),
                publisher: OnceLock::new(),
            }),
            pull: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Service for RecordsManagerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::RecordsManager
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = self.inner.service_id.set(ctx.service_id.clone());
        let _ = self.inner.publisher.set(ctx.publisher.clone());

        let pull = ctx
            .pull_client(
                &ctx.config.comms.metric_records.backend,
                ctx.config.pull_max_concurrency,
            )
            .await?;

        let inner = self.inner.clone();
        pull.register_pull_callback(
            "metric_records",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Message::MetricRecords(message) = message {
                        inner.on_metric_records(message).await;
                    }
                })
            }),
        )?;

        let inner = self.inner.clone();
        pull.register_pull_callback(
            "telemetry_records",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Message::TelemetryRecords(message) = message {
                        inner.on_telemetry_records(message).await;
                    }
                })
            }),
        )?;

        self.pull
            .set(pull)
            .map_err(|_| AiperfError::InvalidState("records manager already initialized".into()))?;

        let inner = self.inner.clone();
        ctx.subscriber
            .subscribe(
                "credit_phase_start",
                Arc::new(move |message| {
                    let inner = inner.clone();
                    Box::pin(async move {
                        if let Message::CreditPhaseStart(message) = message {
                            inner.on_phase_start(message);
                        }
                    })
                }),
            )
            .await?;

        let inner = self.inner.clone();
        ctx.subscriber
            .subscribe(
                "credit_phase_complete",
                Arc::new(move |message| {
                    let inner = inner.clone();
                    Box::pin(async move {
                        if let Message::CreditPhaseComplete(message) = message {
                            inner.on_phase_complete(message).await;
                        }
                    })
                }),
            )
            .await?;

        Ok(())
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        self.pull
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .start()
            .await?;

        // Periodic processing-stats publication, once records are flowing.
        let inner = self.inner.clone();
        let cancel = ctx.cancel.clone();
        let interval = Duration::from_secs(ctx.config.progress_report_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let has_records = {
                            let state = inner.state.lock();
                            state.processing_stats.total_records() > 0
                        };
                        if has_records {
                            inner.publish_processing_stats().await;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_command(&self, command: &CommandMessage, _ctx: &ServiceContext) -> Result<()> {
        match &command.kind {
            CommandKind::ProcessRecords { cancelled } => {
                self.inner.process_records(*cancelled).await;
                Ok(())
            }
            CommandKind::ProfileCancel => {
                self.inner.state.lock().profile_cancelled = true;
                self.inner.process_records(true).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl ManagerInner {
    async fn on_metric_records(&self, message: MetricRecordsMessage) {
        if message.credit_phase != CreditPhase::Profiling {
            tracing::debug!(phase = %message.credit_phase, "skipping non-profiling record");
            return;
        }

        let complete = {
            let mut state = self.state.lock();
            let worker = state
                .worker_stats
                .entry(message.worker_id.clone())
                .or_default();
            if message.valid {
                worker.processed += 1;
            } else {
                worker.errors += 1;
            }
            if message.valid {
                state.processing_stats.processed += 1;
            } else {
                state.processing_stats.errors += 1;
                if let Some(error) = &message.error {
                    *state.error_summary.entry(error.clone()).or_insert(0) += 1;
                }
            }
            state
                .final_request_count
                .is_some_and(|count| state.processing_stats.total_records() >= count)
        };

        for result in &message.results {
            for processor in &self.processors {
                if let Err(e) = processor.process_result(&message.metadata, result).await {
                    tracing::error!(error = %e, "results processor failed");
                }
            }
        }

        if complete {
            let (stats, cancelled) = {
                let state = self.state.lock();
                (state.processing_stats.clone(), state.profile_cancelled)
            };
            tracing::info!(
                processed = stats.processed,
                errors = stats.errors,
                "all expected records received"
            );
            self.publish_processing_stats().await;
            self.publish(Message::AllRecordsReceived(AllRecordsReceivedMessage {
                service_id: self.id(),
                final_processing_stats: stats,
                request_ns: Some(clock::wall_now_ns()),
            }))
            .await;
            self.process_records(cancelled).await;
        }
    }

    async fn on_telemetry_records(&self, message: TelemetryRecordsMessage) {
        for record in &message.records {
            for processor in &self.processors {
                if let Err(e) = processor.process_telemetry_record(record).await {
                    tracing::error!(error = %e, "telemetry results processor failed");
                }
            }
        }
    }

    fn on_phase_start(&self, message: CreditPhaseStartMessage) {
        if message.phase != CreditPhase::Profiling {
            return;
        }
        let mut state = self.state.lock();
        state.start_time_ns = Some(message.start_ns);
        state.processing_stats.total_expected_requests = message.total_expected_requests;

        // Time-bounded phases with a grace period get duration filtering.
        if let (Some(duration_sec), Some(grace)) = (
            message.expected_duration_sec,
            self.user_config.benchmark_grace_period,
        ) {
            self.metric_processor.set_phase_window(Some(PhaseWindow {
                start_time_ns: message.start_ns,
                duration_sec,
                grace_period_sec: grace,
            }));
        }
    }

    async fn on_phase_complete(&self, message: CreditPhaseCompleteMessage) {
        if message.phase != CreditPhase::Profiling {
            return;
        }
        let ready = {
            let mut state = self.state.lock();
            state.final_request_count = Some(message.completed);
            state.end_time_ns = Some(message.end_ns);
            state.processing_stats.total_records() >= message.completed
        };
        tracing::info!(
            final_request_count = message.completed,
            "profiling phase complete"
        );
        if ready {
            let cancelled = self.state.lock().profile_cancelled;
            self.process_records(cancelled).await;
        }
    }

    /// Summarize across all results processors and publish the final
    /// results. Runs at most once.
    async fn process_records(&self, cancelled: bool) {
        if self.summarized.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(cancelled, "processing records results");

        let mut records = Vec::new();
        let mut errors = Vec::new();
        for processor in &self.processors {
            match processor.summarize().await {
                Ok(results) => records.extend(results),
                Err(e) => errors.push(ErrorDetails::from(&e)),
            }
        }

        let (total_expected, completed, start_ns, end_ns, error_summary) = {
            let state = self.state.lock();
            (
                state.processing_stats.total_expected_requests,
                state.processing_stats.total_records(),
                state.start_time_ns.unwrap_or_else(clock::wall_now_ns),
                state.end_time_ns.unwrap_or_else(clock::wall_now_ns),
                state
                    .error_summary
                    .iter()
                    .map(|(error_details, count)| ErrorDetailsCount {
                        error_details: error_details.clone(),
                        count: *count,
                    })
                    .collect::<Vec<_>>(),
            )
        };
        let results = ProfileResults {
            records,
            total_expected,
            completed,
            start_ns,
            end_ns,
            was_cancelled: cancelled,
            error_summary,
        };

        self.publish(Message::ProcessRecordsResult(ProcessRecordsResultMessage {
            service_id: self.id(),
            results: ProcessRecordsOutput { results, errors },
        }))
        .await;
    }

    async fn publish_processing_stats(&self) {
        let (stats, worker_stats) = {
            let state = self.state.lock();
            (state.processing_stats.clone(), state.worker_stats.clone())
        };
        self.publish(Message::RecordsProcessingStats(
            RecordsProcessingStatsMessage {
                service_id: self.id(),
                processing_stats: stats,
                worker_stats,
            },
        ))
        .await;
    }

    async fn publish(&self, message: Message) {
        if let Some(publisher) = self.publisher.get() {
            if let Err(e) = publisher.publish(&message).await {
                tracing::error!(error = %e, "records manager publish failed");
            }
        }
    }

    fn id(&self) -> String {
        self.service_id.get().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EndpointConfig, EndpointType, LoadConfig, LoadGeneratorConfig, RequestRateMode,
    };
    use crate::models::credit::CreditPhaseConfig;
    use crate::models::metric::{MetricRecord, MetricRecordMetadata, MetricValue};

    fn manager() -> RecordsManagerService {
        RecordsManagerService::new(UserConfig {
            endpoint: EndpointConfig::new("http://h", EndpointType::Chat),
            load: LoadConfig {
                warmup: None,
                profiling: CreditPhaseConfig::count_based(CreditPhase::Profiling, 2),
                generator: LoadGeneratorConfig::RequestRate {
                    mode: RequestRateMode::Constant,
                    rate: Some(1.0),
                    seed: None,
                },
                max_concurrency: None,
                cancel_after_ns: 0,
            },
            conversations: Vec::new(),
            workers: 1,
            record_processors: 1,
            gpu_telemetry_urls: Vec::new(),
            gpu_telemetry_enabled: false,
            benchmark_grace_period: None,
        })
    }

    fn metric_message(worker: &str, valid: bool) -> MetricRecordsMessage {
        let mut results = MetricRecord::new();
        results.insert("request_latency".into(), MetricValue::Scalar(1_000.0));
        MetricRecordsMessage {
            worker_id: worker.to_string(),
            record_processor_id: "rp".into(),
            credit_phase: CreditPhase::Profiling,
            results: vec![results],
            metadata: MetricRecordMetadata {
                conversation_id: None,
                turn_index: None,
                x_request_id: None,
                x_correlation_id: None,
                request_start_ns: 1,
                request_end_ns: 2,
                worker_id: worker.to_string(),
                record_processor_id: "rp".into(),
                benchmark_phase: CreditPhase::Profiling,
                was_cancelled: false,
            },
            valid,
            error: (!valid).then(|| ErrorDetails::new(Some(500), "transport", "boom")),
        }
    }

    #[tokio::test]
    async fn profiling_records_update_stats_per_worker() {
        let service = manager();
        service
            .inner
            .on_metric_records(metric_message("w1", true))
            .await;
        service
            .inner
            .on_metric_records(metric_message("w1", false))
            .await;
        service
            .inner
            .on_metric_records(metric_message("w2", true))
            .await;

        let state = service.inner.state.lock();
        assert_eq!(state.processing_stats.processed, 2);
        assert_eq!(state.processing_stats.errors, 1);
        assert_eq!(state.worker_stats["w1"].processed, 1);
        assert_eq!(state.worker_stats["w1"].errors, 1);
        assert_eq!(state.worker_stats["w2"].processed, 1);
        assert_eq!(state.error_summary.len(), 1);
    }

    #[tokio::test]
    async fn warmup_records_are_skipped() {
        let service = manager();
        let mut message = metric_message("w1", true);
        message.credit_phase = CreditPhase::Warmup;
        service.inner.on_metric_records(message).await;

        let state = service.inner.state.lock();
        assert_eq!(state.processing_stats.total_records(), 0);
    }

    #[tokio::test]
    async fn phase_messages_set_expectations() {
        let service = manager();
        service.inner.on_phase_start(CreditPhaseStartMessage {
            service_id: "tm".into(),
            phase: CreditPhase::Profiling,
            start_ns: 123,
            total_expected_requests: Some(2),
            expected_duration_sec: None,
        });
        {
            let state = service.inner.state.lock();
            assert_eq!(state.start_time_ns, Some(123));
            assert_eq!(state.processing_stats.total_expected_requests, Some(2));
        }

        service
            .inner
            .on_phase_complete(CreditPhaseCompleteMessage {
                service_id: "tm".into(),
                phase: CreditPhase::Profiling,
                end_ns: 456,
                completed: 2,
                was_cancelled: false,
            })
            .await;
        let state = service.inner.state.lock();
        assert_eq!(state.final_request_count, Some(2));
        assert_eq!(state.end_time_ns, Some(456));
    }

    #[tokio::test]
    async fn summarization_runs_once() {
        let service = manager();
        service
            .inner
            .on_metric_records(metric_message("w1", true))
            .await;
        service.inner.process_records(false).await;
        assert!(service.inner.summarized.load(Ordering::SeqCst));
        // Second call is a no-op rather than a duplicate publish.
        service.inner.process_records(true).await;
    }
}
