//! Worker service: turns credits into timed HTTP requests.
//!
//! Each worker hosts one PULL client with bounded concurrency. Per credit it
//! resolves the conversation turn from the dataset manager, shapes the
//! payload through its endpoint adapter, sends the request, packages a
//! `RequestRecord`, and returns the credit to the timing manager.

pub mod http;
pub mod sse;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock;
use crate::comms::{DealerClient, PubClient, PullClient, PushClient};
use crate::config::UserConfig;
use crate::endpoints::{EndpointAdapter, RequestInfo, adapter_for};
use crate::error::{AiperfError, ErrorDetails, Result};
use crate::messages::{
    ConversationTurnRequest, CreditDrop, CreditReturn, Message, RequestRecordMessage, ServiceType,
    WorkerHealthMessage,
};
use crate::models::credit::CreditPhase;
use crate::models::dataset::Turn;
use crate::models::record::RequestRecord;
use crate::models::worker::{ProcessHealth, WorkerHealth, WorkerPhaseTaskStats};
use crate::service::{Service, ServiceContext};

use http::{HttpOutcome, HttpRequest, HttpTransport};

pub struct WorkerService {
    inner: Arc<WorkerInner>,
    pull: OnceLock<PullClient>,
}

struct WorkerInner {
    user_config: UserConfig,
    adapter: Arc<dyn EndpointAdapter>,
    transport: OnceLock<HttpTransport>,
    service_id: OnceLock<String>,
    dataset: OnceLock<DealerClient>,
    records_push: OnceLock<PushClient>,
    credit_return_push: OnceLock<PushClient>,
    conversation_cursors: DashMap<String, u32>,
    phase_stats: parking_lot::Mutex<BTreeMap<CreditPhase, WorkerPhaseTaskStats>>,
}

impl WorkerService {
    pub fn new(user_config: UserConfig) -> Result<Self> {
        let adapter = adapter_for(user_config.endpoint.endpoint_type);
        Ok(Self {
            inner: Arc::new(WorkerInner {
                adapter,
                transport: OnceLock::new(),
                user_config,
                service_id: OnceLock::new(),
                dataset: OnceLock::new(),
                records_push: OnceLock::new(),
                credit_return_push: OnceLock::new(),
                conversation_cursors: DashMap::new(),
                phase_stats: parking_lot::Mutex::new(BTreeMap::new()),
            }),
            pull: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Service for WorkerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::Worker
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = self.inner.service_id.set(ctx.service_id.clone());
        let _ = self.inner.transport.set(HttpTransport::new(Duration::from_secs(
            ctx.config.http_timeout_secs,
        ))?);

        let dataset = ctx.dealer_client().await?;
        let _ = self.inner.dataset.set(dataset);

        let records_push = ctx
            .push_client(&ctx.config.comms.raw_records.frontend)
            .await?;
        let _ = self.inner.records_push.set(records_push);

        let credit_return_push = ctx
            .push_client(&ctx.config.comms.credit_return.frontend)
            .await?;
        let _ = self.inner.credit_return_push.set(credit_return_push);

        let pull = ctx
            .pull_client(
                &ctx.config.comms.credit_drop.backend,
                ctx.config.pull_max_concurrency,
            )
            .await?;

        let inner = self.inner.clone();
        pull.register_pull_callback(
            "credit_drop",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Message::CreditDrop(drop) = message {
                        inner.handle_credit(drop).await;
                    }
                })
            }),
        )?;
        self.pull
            .set(pull)
            .map_err(|_| AiperfError::InvalidState("worker already initialized".into()))?;
        Ok(())
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        self.pull
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .start()
            .await?;

        spawn_health_reporter(
            self.inner.clone(),
            ctx.publisher.clone(),
            ctx.service_id.clone(),
            Duration::from_secs(ctx.config.progress_report_interval_secs),
            ctx.cancel.clone(),
        );
        Ok(())
    }
}

impl WorkerInner {
    async fn handle_credit(self: Arc<Self>, drop: CreditDrop) {
        let credit_recv_perf_ns = clock::perf_now_ns();

        {
            let mut stats = self.phase_stats.lock();
            stats.entry(drop.phase).or_default().in_progress += 1;
        }
        // The in-progress counter comes back down even if processing
        // panics mid-request.
        let phase = drop.phase;
        let in_progress_guard = scopeguard::guard(self.clone(), move |inner| {
            let mut stats = inner.phase_stats.lock();
            let entry = stats.entry(phase).or_default();
            entry.in_progress = entry.in_progress.saturating_sub(1);
        });

        let failed = match self.process_credit(&drop, credit_recv_perf_ns).await {
            Ok(record_failed) => record_failed,
            Err(e) => {
                tracing::error!(credit_id = %drop.id, error = %e, "credit processing failed");
                true
            }
        };

        let mut stats = in_progress_guard.phase_stats.lock();
        let entry = stats.entry(drop.phase).or_default();
        if failed {
            entry.failed += 1;
        } else {
            entry.completed += 1;
        }
    }

    /// Run one credit end to end. Transport and parser failures are
    /// captured into the record; the returned flag says whether the attempt
    /// errored. Only bus failures escape as `Err`.
    async fn process_credit(&self, drop: &CreditDrop, credit_recv_perf_ns: u64) -> Result<bool> {
        // Honor the scheduled instant, then measure how late we ran.
        let mut delayed_ns = None;
        if let Some(scheduled_ns) = drop.credit_drop_ns {
            if scheduled_ns > clock::wall_now_ns() {
                clock::sleep_until_wall_ns(scheduled_ns).await;
            }
            delayed_ns = Some(clock::wall_now_ns().saturating_sub(scheduled_ns));
        }

        let resolved = self.resolve_turn(drop).await;
        let (conversation_id, turn_index, turn) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                let record = self.error_record(drop, delayed_ns, credit_recv_perf_ns, &e);
                let pre_inference_ns = record.credit_drop_latency;
                self.emit(drop, record, delayed_ns, pre_inference_ns)
                    .await?;
                return Ok(true);
            }
        };

        if let Some(delay_ms) = turn.delay {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let x_request_id = Uuid::new_v4().to_string();
        let turns = [turn.clone()];
        let request = match self.build_request(&turns, &x_request_id, &drop.id) {
            Ok(request) => request,
            Err(e) => {
                let mut record = self.error_record(drop, delayed_ns, credit_recv_perf_ns, &e);
                record.conversation_id = conversation_id;
                record.turn_index = Some(turn_index);
                let pre_inference_ns = record.credit_drop_latency;
                self.emit(drop, record, delayed_ns, pre_inference_ns)
                    .await?;
                return Ok(true);
            }
        };

        let transport = self.transport.get().ok_or(AiperfError::NotInitialized)?;
        let credit_drop_latency = clock::perf_now_ns().saturating_sub(credit_recv_perf_ns);
        let timestamp_ns = clock::wall_now_ns();
        let send_start_perf_ns = clock::perf_now_ns();

        let mut was_cancelled = false;
        let mut cancellation_perf_ns = None;
        let outcome: Option<Result<HttpOutcome>> = if drop.cancel_after_ns > 0 {
            match tokio::time::timeout(
                Duration::from_nanos(drop.cancel_after_ns),
                transport.send(&request),
            )
            .await
            {
                Ok(result) => Some(result),
                Err(_) => {
                    was_cancelled = true;
                    cancellation_perf_ns = Some(clock::perf_now_ns());
                    None
                }
            }
        } else {
            Some(transport.send(&request).await)
        };

        let mut record = RequestRecord {
            turn: Some(turn),
            credit_num: Some(drop.credit_num),
            conversation_id,
            turn_index: Some(turn_index),
            model_name: turns[0]
                .model
                .clone()
                .or_else(|| self.user_config.endpoint.primary_model_name.clone()),
            timestamp_ns,
            start_perf_ns: send_start_perf_ns,
            end_perf_ns: Some(clock::perf_now_ns()),
            recv_start_perf_ns: None,
            status: None,
            responses: Vec::new(),
            error: None,
            delayed_ns,
            credit_phase: drop.phase,
            credit_drop_latency: Some(credit_drop_latency),
            was_cancelled,
            cancel_after_ns: drop.cancel_after_ns,
            cancellation_perf_ns,
            x_request_id: Some(x_request_id),
            x_correlation_id: Some(drop.id.clone()),
        };

        match outcome {
            Some(Ok(outcome)) => {
                record.status = Some(outcome.status);
                record.start_perf_ns = outcome.start_perf_ns;
                record.end_perf_ns = Some(outcome.end_perf_ns);
                record.recv_start_perf_ns = outcome.recv_start_perf_ns;
                if outcome.status >= 400 {
                    let body = outcome
                        .responses
                        .first()
                        .map(|r| r.payload_text())
                        .unwrap_or_default();
                    record.error = Some(ErrorDetails::new(
                        Some(outcome.status),
                        "transport",
                        format!("HTTP {}: {}", outcome.status, truncate(&body, 256)),
                    ));
                } else {
                    record.responses = outcome.responses;
                }
            }
            Some(Err(e)) => {
                record.end_perf_ns = Some(clock::perf_now_ns());
                record.error = Some(ErrorDetails::from(&e));
            }
            None => {
                // Cancelled past its deadline: no result at all.
                record.end_perf_ns = Some(clock::perf_now_ns());
            }
        }

        let failed = record.error.is_some() || record.was_cancelled;
        self.emit(drop, record, delayed_ns, Some(credit_drop_latency))
            .await?;
        Ok(failed)
    }

    /// Push the record to the processor pool and return the credit.
    async fn emit(
        &self,
        drop: &CreditDrop,
        record: RequestRecord,
        delayed_ns: Option<u64>,
        pre_inference_ns: Option<u64>,
    ) -> Result<()> {
        let worker_id = self.service_id.get().cloned().unwrap_or_default();
        self.records_push
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .push(&Message::RequestRecord(RequestRecordMessage {
                worker_id,
                record,
            }))
            .await?;

        self.credit_return_push
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .push(&Message::CreditReturn(CreditReturn {
                id: drop.id.clone(),
                phase: drop.phase,
                conversation_id: drop.conversation_id.clone(),
                credit_drop_ns: drop.credit_drop_ns,
                delayed_ns,
                pre_inference_ns,
            }))
            .await
    }

    /// Resolve the turn for a credit: addressed conversation when the credit
    /// names one, dataset's own selection otherwise.
    async fn resolve_turn(&self, drop: &CreditDrop) -> Result<(Option<String>, u32, Turn)> {
        let dealer = self.dataset.get().ok_or(AiperfError::NotInitialized)?;

        let turn_index = match &drop.conversation_id {
            Some(id) => {
                let mut cursor = self.conversation_cursors.entry(id.clone()).or_insert(0);
                let index = *cursor;
                *cursor += 1;
                index
            }
            None => 0,
        };

        let request = Message::ConversationTurnRequest(ConversationTurnRequest {
            service_id: self.service_id.get().cloned().unwrap_or_default(),
            conversation_id: drop.conversation_id.clone(),
            turn_index,
            request_id: Uuid::new_v4().to_string(),
            request_ns: Some(clock::wall_now_ns()),
        });

        match dealer.request(request, None).await? {
            Message::ConversationTurnResponse(response) => Ok((
                Some(response.conversation_id),
                response.turn_index,
                response.turn,
            )),
            Message::Error(error) => Err(AiperfError::Bus {
                operation: "conversation_turn_request",
                message: error.error.message,
            }),
            other => Err(AiperfError::Bus {
                operation: "conversation_turn_request",
                message: format!("unexpected response type {}", other.message_type()),
            }),
        }
    }

    fn build_request(
        &self,
        turns: &[Turn],
        x_request_id: &str,
        correlation_id: &str,
    ) -> Result<HttpRequest> {
        let endpoint = &self.user_config.endpoint;
        let body = self.adapter.format_payload(&RequestInfo {
            turns,
            endpoint,
        })?;

        let streaming = endpoint.streaming && self.adapter.metadata().supports_streaming;
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Accept".to_string(),
                if streaming {
                    "text/event-stream".to_string()
                } else {
                    "application/json".to_string()
                },
            ),
        ];
        if let Some(api_key) = &endpoint.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }
        for (name, value) in &endpoint.headers {
            headers.push((name.clone(), value.clone()));
        }
        headers.push(("X-Request-ID".to_string(), x_request_id.to_string()));
        headers.push(("X-Correlation-ID".to_string(), correlation_id.to_string()));

        Ok(HttpRequest {
            url: self.build_url(),
            headers,
            body,
            streaming,
        })
    }

    fn build_url(&self) -> String {
        let endpoint = &self.user_config.endpoint;
        let base = endpoint.base_url.trim_end_matches('/');
        let path = endpoint
            .custom_endpoint
            .as_deref()
            .unwrap_or(self.adapter.metadata().endpoint_path);
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let mut url = format!("{base}{path}");
        if !endpoint.url_params.is_empty() {
            let query: Vec<String> = endpoint
                .url_params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    fn error_record(
        &self,
        drop: &CreditDrop,
        delayed_ns: Option<u64>,
        credit_recv_perf_ns: u64,
        error: &AiperfError,
    ) -> RequestRecord {
        RequestRecord {
            turn: None,
            credit_num: Some(drop.credit_num),
            conversation_id: drop.conversation_id.clone(),
            turn_index: None,
            model_name: self.user_config.endpoint.primary_model_name.clone(),
            timestamp_ns: clock::wall_now_ns(),
            start_perf_ns: clock::perf_now_ns(),
            end_perf_ns: Some(clock::perf_now_ns()),
            recv_start_perf_ns: None,
            status: None,
            responses: Vec::new(),
            error: Some(ErrorDetails::from(error)),
            delayed_ns,
            credit_phase: drop.phase,
            credit_drop_latency: Some(clock::perf_now_ns().saturating_sub(credit_recv_perf_ns)),
            was_cancelled: false,
            cancel_after_ns: drop.cancel_after_ns,
            cancellation_perf_ns: None,
            x_request_id: None,
            x_correlation_id: Some(drop.id.clone()),
        }
    }
}

fn spawn_health_reporter(
    inner: Arc<WorkerInner>,
    publisher: Arc<PubClient>,
    service_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    let process = system.process(pid);
                    let health = WorkerHealth {
                        process: ProcessHealth {
                            pid: pid.as_u32(),
                            memory_bytes: process.map(|p| p.memory()).unwrap_or(0),
                            cpu_percent: process.map(|p| p.cpu_usage()).unwrap_or(0.0),
                            uptime_secs: process.map(|p| p.run_time()).unwrap_or(0),
                        },
                        phase_stats: inner.phase_stats.lock().clone(),
                    };
                    let _ = publisher
                        .publish(&Message::WorkerHealth(WorkerHealthMessage {
                            service_id: service_id.clone(),
                            health,
                        }))
                        .await;
                }
            }
        }
    });
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, EndpointType, LoadConfig, LoadGeneratorConfig, RequestRateMode};
    use crate::models::credit::CreditPhaseConfig;

    fn user_config() -> UserConfig {
        let mut endpoint = EndpointConfig::new("http://localhost:8000/", EndpointType::Chat);
        endpoint.api_key = Some("sk-test".into());
        endpoint.url_params.insert("version".into(), "2".into());
        UserConfig {
            endpoint,
            load: LoadConfig {
                warmup: None,
                profiling: CreditPhaseConfig::count_based(CreditPhase::Profiling, 1),
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
        }
    }

    #[test]
    fn url_joins_base_path_and_params() {
        let worker = WorkerService::new(user_config()).unwrap();
        let url = worker.inner.build_url();
        assert_eq!(url, "http://localhost:8000/v1/chat/completions?version=2");
    }

    #[test]
    fn headers_include_auth_and_ids() {
        let worker = WorkerService::new(user_config()).unwrap();
        let turns = [Turn {
            texts: vec![crate::models::dataset::Media::text("hi")],
            ..Default::default()
        }];
        let request = worker
            .inner
            .build_request(&turns, "req-1", "credit-1")
            .unwrap();

        let find = |name: &str| {
            request
                .headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(find("Content-Type"), Some("application/json"));
        assert_eq!(find("Accept"), Some("application/json"));
        assert_eq!(find("Authorization"), Some("Bearer sk-test"));
        assert_eq!(find("X-Request-ID"), Some("req-1"));
        assert_eq!(find("X-Correlation-ID"), Some("credit-1"));
    }

    #[test]
    fn streaming_flag_switches_accept_header() {
        let mut config = user_config();
        config.endpoint.streaming = true;
        let worker = WorkerService::new(config).unwrap();
        let turns = [Turn {
            texts: vec![crate::models::dataset::Media::text("hi")],
            ..Default::default()
        }];
        let request = worker
            .inner
            .build_request(&turns, "req", "credit")
            .unwrap();
        assert!(request.streaming);
        let accept = request
            .headers
            .iter()
            .find(|(n, _)| n == "Accept")
            .map(|(_, v)| v.as_str());
        assert_eq!(accept, Some("text/event-stream"));
    }
}
