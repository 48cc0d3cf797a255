//! Service and user configuration.
//!
//! `ServiceConfig` carries bus addresses and runtime intervals;
//! `UserConfig` carries what to benchmark and how hard. Environment variables
//! are read exactly once, at `ServiceConfig::default()` construction, into
//! plain fields.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AiperfError, Result};
use crate::models::credit::{CreditPhase, CreditPhaseConfig};
use crate::models::dataset::Conversation;

/// Env var capping pull-worker concurrency.
pub const WORKER_CONCURRENCY_ENV: &str = "AIPERF_WORKER_CONCURRENT_REQUESTS";
/// Env var overriding the HTTP send/receive timeout in seconds.
pub const HTTP_TIMEOUT_ENV: &str = "AIPERF_HTTP_TIMEOUT_SECS";

pub const DEFAULT_PULL_MAX_CONCURRENCY: usize = 500;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DEALER_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DCGM_ENDPOINT: &str = "http://localhost:9400/metrics";

/// A pair of broker-bound endpoints for one PUSH/PULL work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushChannel {
    /// Broker binds PULL here; producers connect as PUSH.
    pub frontend: String,
    /// Broker binds PUSH here; consumers connect as PULL.
    pub backend: String,
}

/// All broker endpoints. The broker is the only binder; every client
/// connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsConfig {
    /// Broker binds SUB here; services connect as PUB.
    pub pubsub_frontend: String,
    /// Broker binds PUB here; services connect as SUB.
    pub pubsub_backend: String,
    /// Broker binds ROUTER here; requesters connect as DEALER.
    pub dealer_frontend: String,
    /// Broker binds DEALER here; responders connect as ROUTER.
    pub dealer_backend: String,
    /// Timing manager -> workers.
    pub credit_drop: PushChannel,
    /// Workers -> timing manager.
    pub credit_return: PushChannel,
    /// Workers -> record processors.
    pub raw_records: PushChannel,
    /// Record processors + telemetry manager -> records manager.
    pub metric_records: PushChannel,
}

impl CommsConfig {
    /// IPC endpoints under a shared directory, for single-host runs.
    pub fn ipc(dir: &str) -> Self {
        let ep = |name: &str| format!("ipc://{dir}/{name}.sock");
        Self {
            pubsub_frontend: ep("pubsub-frontend"),
            pubsub_backend: ep("pubsub-backend"),
            dealer_frontend: ep("dealer-frontend"),
            dealer_backend: ep("dealer-backend"),
            credit_drop: PushChannel {
                frontend: ep("credit-drop-frontend"),
                backend: ep("credit-drop-backend"),
            },
            credit_return: PushChannel {
                frontend: ep("credit-return-frontend"),
                backend: ep("credit-return-backend"),
            },
            raw_records: PushChannel {
                frontend: ep("raw-records-frontend"),
                backend: ep("raw-records-backend"),
            },
            metric_records: PushChannel {
                frontend: ep("metric-records-frontend"),
                backend: ep("metric-records-backend"),
            },
        }
    }

    /// TCP endpoints on consecutive ports, for multi-host runs.
    pub fn tcp(host: &str, base_port: u16) -> Self {
        let ep = |offset: u16| format!("tcp://{host}:{}", base_port + offset);
        Self {
            pubsub_frontend: ep(0),
            pubsub_backend: ep(1),
            dealer_frontend: ep(2),
            dealer_backend: ep(3),
            credit_drop: PushChannel {
                frontend: ep(4),
                backend: ep(5),
            },
            credit_return: PushChannel {
                frontend: ep(6),
                backend: ep(7),
            },
            raw_records: PushChannel {
                frontend: ep(8),
                backend: ep(9),
            },
            metric_records: PushChannel {
                frontend: ep(10),
                backend: ep(11),
            },
        }
    }
}

/// Per-process runtime configuration shared by every service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub comms: CommsConfig,
    pub heartbeat_interval_secs: u64,
    /// Heartbeat silence after which the registry marks a service stale.
    pub stale_threshold_secs: u64,
    pub progress_report_interval_secs: u64,
    pub registration_timeout_secs: u64,
    /// Grace for in-flight credits after cancellation before giving up.
    pub shutdown_grace_secs: u64,
    pub pull_max_concurrency: usize,
    pub http_timeout_secs: u64,
    pub dealer_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let pull_max_concurrency = std::env::var(WORKER_CONCURRENCY_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PULL_MAX_CONCURRENCY);
        let http_timeout_secs = std::env::var(HTTP_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        Self {
            comms: CommsConfig::ipc("/tmp/aiperf"),
            heartbeat_interval_secs: 2,
            stale_threshold_secs: 10,
            progress_report_interval_secs: 1,
            registration_timeout_secs: 30,
            shutdown_grace_secs: 10,
            pull_max_concurrency,
            http_timeout_secs,
            dealer_timeout_secs: DEFAULT_DEALER_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Chat,
    Completions,
    Embeddings,
    Rankings,
}

/// The inference endpoint under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub endpoint_type: EndpointType,
    /// Overrides the adapter's default path when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_endpoint: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub url_params: HashMap<String, String>,
    /// Extra body parameters merged into every payload after construction.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>, endpoint_type: EndpointType) -> Self {
        Self {
            base_url: base_url.into(),
            endpoint_type,
            custom_endpoint: None,
            streaming: false,
            primary_model_name: None,
            api_key: None,
            headers: HashMap::new(),
            url_params: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestRateMode {
    Constant,
    Poisson,
    ConcurrencyBurst,
}

/// How credits are scheduled within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LoadGeneratorConfig {
    /// Replay the dataset's per-turn timestamps.
    FixedSchedule,
    RequestRate {
        mode: RequestRateMode,
        /// Requests per second; ignored for `concurrency_burst`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
        /// RNG seed for `poisson`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
}

/// Load generation parameters across all phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<CreditPhaseConfig>,
    pub profiling: CreditPhaseConfig,
    pub generator: LoadGeneratorConfig,
    /// Cap on in-flight credits; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u64>,
    /// Per-request cancellation deadline in nanoseconds; 0 disables.
    #[serde(default)]
    pub cancel_after_ns: u64,
}

/// The full user-facing run description consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub endpoint: EndpointConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub record_processors: usize,
    /// DCGM endpoints to scrape; empty disables GPU telemetry.
    #[serde(default)]
    pub gpu_telemetry_urls: Vec<String>,
    #[serde(default)]
    pub gpu_telemetry_enabled: bool,
    /// Extra seconds past a time-bounded phase's duration within which a
    /// completed request still counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark_grace_period: Option<f64>,
}

impl UserConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(warmup) = &self.load.warmup {
            warmup.validate()?;
            if warmup.phase != CreditPhase::Warmup {
                return Err(AiperfError::Config(
                    "warmup phase config must have type warmup".to_string(),
                ));
            }
        }
        self.load.profiling.validate()?;
        if self.load.profiling.phase != CreditPhase::Profiling {
            return Err(AiperfError::Config(
                "profiling phase config must have type profiling".to_string(),
            ));
        }
        if let LoadGeneratorConfig::RequestRate { mode, rate, .. } = &self.load.generator {
            let needs_rate = !matches!(mode, RequestRateMode::ConcurrencyBurst);
            if needs_rate && !rate.is_some_and(|r| r > 0.0) {
                return Err(AiperfError::Config(format!(
                    "{mode:?} request rate mode requires a positive rate"
                )));
            }
            if matches!(mode, RequestRateMode::ConcurrencyBurst)
                && self.load.max_concurrency.is_none()
            {
                return Err(AiperfError::Config(
                    "concurrency_burst mode requires max_concurrency".to_string(),
                ));
            }
        }
        if self.workers == 0 {
            return Err(AiperfError::Config("at least one worker required".into()));
        }
        if self.record_processors == 0 {
            return Err(AiperfError::Config(
                "at least one record processor required".to_string(),
            ));
        }
        Ok(())
    }

    /// Phase configs in run order: warmup (when present) then profiling.
    pub fn phase_configs(&self) -> Vec<CreditPhaseConfig> {
        let mut phases = Vec::new();
        if let Some(warmup) = &self.load.warmup {
            phases.push(warmup.clone());
        }
        phases.push(self.load.profiling.clone());
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credit::CreditPhaseConfig;

    fn base_config() -> UserConfig {
        UserConfig {
            endpoint: EndpointConfig::new("http://localhost:8000", EndpointType::Chat),
            load: LoadConfig {
                warmup: None,
                profiling: CreditPhaseConfig::count_based(CreditPhase::Profiling, 10),
                generator: LoadGeneratorConfig::RequestRate {
                    mode: RequestRateMode::Constant,
                    rate: Some(5.0),
                    seed: None,
                },
                max_concurrency: Some(2),
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
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn constant_mode_requires_rate() {
        let mut config = base_config();
        config.load.generator = LoadGeneratorConfig::RequestRate {
            mode: RequestRateMode::Constant,
            rate: None,
            seed: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn burst_mode_requires_max_concurrency() {
        let mut config = base_config();
        config.load.generator = LoadGeneratorConfig::RequestRate {
            mode: RequestRateMode::ConcurrencyBurst,
            rate: None,
            seed: None,
        };
        config.load.max_concurrency = None;
        assert!(config.validate().is_err());

        config.load.max_concurrency = Some(8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn phase_order_puts_warmup_first() {
        let mut config = base_config();
        config.load.warmup = Some(CreditPhaseConfig::count_based(CreditPhase::Warmup, 2));
        let phases = config.phase_configs();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].phase, CreditPhase::Warmup);
        assert_eq!(phases[1].phase, CreditPhase::Profiling);
    }

    #[test]
    fn tcp_endpoints_use_consecutive_ports() {
        let comms = CommsConfig::tcp("10.0.0.1", 5650);
        assert_eq!(comms.pubsub_frontend, "tcp://10.0.0.1:5650");
        assert_eq!(comms.metric_records.backend, "tcp://10.0.0.1:5661");
    }
}
