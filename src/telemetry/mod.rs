//! GPU telemetry: per-endpoint collectors and the manager that owns them.

pub mod collector;
pub mod prometheus;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::comms::PushClient;
use crate::config::{DEFAULT_DCGM_ENDPOINT, UserConfig};
use crate::error::{AiperfError, Result};
use crate::messages::{Message, ServiceType, TelemetryRecordsMessage, TelemetryStatusMessage};
use crate::service::{Service, ServiceContext};

use collector::{DEFAULT_COLLECTION_INTERVAL, TelemetryCollector};

/// Delay before a telemetry manager with zero reachable endpoints shuts
/// itself down.
const DISABLED_SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

pub struct TelemetryManagerService {
    user_config: UserConfig,
    push: OnceLock<Arc<PushClient>>,
}

impl TelemetryManagerService {
    pub fn new(user_config: UserConfig) -> Self {
        Self {
            user_config,
            push: OnceLock::new(),
        }
    }

    /// User-provided URLs, normalized and deduplicated, with the default
    /// endpoint prepended.
    fn endpoints(&self) -> Vec<String> {
        let mut endpoints = vec![DEFAULT_DCGM_ENDPOINT.to_string()];
        for url in &self.user_config.gpu_telemetry_urls {
            if let Some(normalized) = normalize_dcgm_url(url) {
                if !endpoints.contains(&normalized) {
                    endpoints.push(normalized);
                }
            }
        }
        endpoints
    }
}

/// Trim, strip trailing slashes, and ensure a `/metrics` suffix. Returns
/// `None` for unusable input.
pub fn normalize_dcgm_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() || !trimmed.starts_with("http") {
        return None;
    }
    if trimmed.ends_with("/metrics") {
        Some(trimmed.to_string())
    } else {
        Some(format!("{trimmed}/metrics"))
    }
}

/// Probe with HEAD, falling back to GET for exporters that reject HEAD.
async fn probe_endpoint(client: &reqwest::Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(response) if response.status().is_success() => return true,
        _ => {}
    }
    matches!(client.get(url).send().await, Ok(response) if response.status().is_success())
}

#[async_trait]
impl Service for TelemetryManagerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::TelemetryManager
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let push = Arc::new(
            ctx.push_client(&ctx.config.comms.metric_records.frontend)
                .await?,
        );
        self.push
            .set(push)
            .map_err(|_| AiperfError::InvalidState("telemetry manager already initialized".into()))?;
        Ok(())
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        let push = self.push.get().ok_or(AiperfError::NotInitialized)?.clone();

        let endpoints_tested = self.endpoints();
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let mut endpoints_reachable = Vec::new();
        for url in &endpoints_tested {
            if probe_endpoint(&probe_client, url).await {
                endpoints_reachable.push(url.clone());
            }
        }

        let enabled = !endpoints_reachable.is_empty();
        ctx.publish(Message::TelemetryStatus(TelemetryStatusMessage {
            service_id: ctx.service_id.clone(),
            enabled,
            reason: (!enabled).then(|| "no DCGM endpoints reachable".to_string()),
            endpoints_tested: endpoints_tested.clone(),
            endpoints_reachable: endpoints_reachable.clone(),
        }))
        .await?;

        if !enabled {
            tracing::warn!(
                tested = endpoints_tested.len(),
                "GPU telemetry disabled; scheduling shutdown"
            );
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DISABLED_SHUTDOWN_DELAY).await;
                cancel.cancel();
            });
            return Ok(());
        }

        let service_id = ctx.service_id.clone();
        for url in endpoints_reachable {
            let collector = TelemetryCollector::new(url.clone(), DEFAULT_COLLECTION_INTERVAL)?;
            let push = push.clone();
            let service_id = service_id.clone();

            let on_batch: collector::RecordBatchCallback = Arc::new(move |records| {
                let push = push.clone();
                let service_id = service_id.clone();
                Box::pin(async move {
                    let message = Message::TelemetryRecords(TelemetryRecordsMessage {
                        service_id,
                        records,
                    });
                    if let Err(e) = push.push(&message).await {
                        tracing::error!(error = %e, "failed to push telemetry records");
                    }
                })
            });
            let on_error: collector::CollectorErrorCallback = Arc::new({
                let url = url.clone();
                move |error| {
                    tracing::warn!(url = %url, kind = %error.kind, message = %error.message, "telemetry poll failed");
                }
            });

            tokio::spawn(collector.run(on_batch, on_error, ctx.cancel.clone()));
            tracing::info!(url = %url, "telemetry collector started");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EndpointConfig, EndpointType, LoadConfig, LoadGeneratorConfig, RequestRateMode,
    };
    use crate::models::credit::{CreditPhase, CreditPhaseConfig};

    #[test]
    fn normalization_rules() {
        assert_eq!(
            normalize_dcgm_url("http://localhost:9401"),
            Some("http://localhost:9401/metrics".into())
        );
        assert_eq!(
            normalize_dcgm_url("http://localhost:9401/metrics"),
            Some("http://localhost:9401/metrics".into())
        );
        assert_eq!(
            normalize_dcgm_url("http://localhost:9401/"),
            Some("http://localhost:9401/metrics".into())
        );
        assert_eq!(
            normalize_dcgm_url("http://localhost:9401/metrics/"),
            Some("http://localhost:9401/metrics".into())
        );
        assert_eq!(
            normalize_dcgm_url("http://node1:9401/dcgm/metrics"),
            Some("http://node1:9401/dcgm/metrics".into())
        );
        assert_eq!(normalize_dcgm_url("   "), None);
        assert_eq!(normalize_dcgm_url("not-a-url"), None);
    }

    #[test]
    fn endpoints_dedup_and_keep_default_first() {
        let service = TelemetryManagerService::new(UserConfig {
            endpoint: EndpointConfig::new("http://h", EndpointType::Chat),
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
            gpu_telemetry_urls: vec![
                "http://n1:9401".into(),
                "http://n1:9401/metrics".into(),
                "http://n1:9401/".into(),
            ],
            gpu_telemetry_enabled: true,
            benchmark_grace_period: None,
        });

        let endpoints = service.endpoints();
        assert_eq!(
            endpoints,
            vec![
                DEFAULT_DCGM_ENDPOINT.to_string(),
                "http://n1:9401/metrics".to_string(),
            ]
        );
    }
}
