//! System controller: orchestrates one profiling run.
//!
//! Spawns the broker and every required service, waits for the fleet to
//! register, drives the PROFILE_CONFIGURE / PROFILE_START handshake, relays
//! progress to the UI collaborator, collects the final results, and tears
//! the fleet down in reverse registration order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::comms::ProxyBroker;
use crate::config::{ServiceConfig, UserConfig};
use crate::dataset::DatasetManagerService;
use crate::error::{AiperfError, Result};
use crate::messages::{
    CommandKind, CommandMessage, CommandResponseStatus, CreditPhaseProgressMessage, Message,
    ProcessRecordsResultMessage, RecordsProcessingStatsMessage, ServiceType,
    TelemetryStatusMessage, WorkerHealthMessage,
};
use crate::models::metric::ProcessRecordsOutput;
use crate::records::{RecordProcessorService, RecordsManagerService, Tokenizer};
use crate::service::{ServiceContext, ServiceRegistry, ServiceRunner};
use crate::telemetry::TelemetryManagerService;
use crate::timing::TimingManagerService;
use crate::workers::WorkerService;

/// How the fleet's processes are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Every service as a task in this process. Single-host runs and
    /// tests.
    InProcess,
    /// Every service as a child OS process of this binary.
    Subprocess,
}

/// Where run progress goes; the renderer lives outside the core.
pub trait ProgressObserver: Send + Sync {
    fn on_phase_progress(&self, _message: &CreditPhaseProgressMessage) {}
    fn on_processing_stats(&self, _message: &RecordsProcessingStatsMessage) {}
    fn on_worker_health(&self, _message: &WorkerHealthMessage) {}
    fn on_telemetry_status(&self, _message: &TelemetryStatusMessage) {}
    fn on_results(&self, _results: &ProcessRecordsOutput) {}
}

/// Default observer: structured log lines.
pub struct LogProgressObserver;

impl ProgressObserver for LogProgressObserver {
    fn on_phase_progress(&self, message: &CreditPhaseProgressMessage) {
        tracing::info!(
            phase = %message.phase,
            sent = message.sent,
            completed = message.completed,
            progress = message.progress_percent.map(|p| p.round()),
            "phase progress"
        );
    }

    fn on_processing_stats(&self, message: &RecordsProcessingStatsMessage) {
        tracing::info!(
            processed = message.processing_stats.processed,
            errors = message.processing_stats.errors,
            "records processed"
        );
    }

    fn on_telemetry_status(&self, message: &TelemetryStatusMessage) {
        tracing::info!(
            enabled = message.enabled,
            tested = message.endpoints_tested.len(),
            reachable = message.endpoints_reachable.len(),
            "telemetry status"
        );
    }

    fn on_results(&self, results: &ProcessRecordsOutput) {
        tracing::info!(
            completed = results.results.completed,
            metrics = results.results.records.len(),
            was_cancelled = results.results.was_cancelled,
            "profile results ready"
        );
    }
}

/// Outcome of a run, for exit-code mapping.
pub struct RunOutcome {
    pub results: Option<ProcessRecordsOutput>,
}

/// Map a finished run to the process exit code: 0 for clean completion
/// (cancelled included), 1 for lifecycle failures, 2 for configuration
/// errors.
pub fn exit_code(outcome: &Result<RunOutcome>) -> i32 {
    match outcome {
        Ok(_) => 0,
        Err(AiperfError::Config(_)) => 2,
        Err(_) => 1,
    }
}

pub struct SystemController {
    service_config: ServiceConfig,
    user_config: UserConfig,
    launch_mode: LaunchMode,
    observer: Arc<dyn ProgressObserver>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    /// External cancellation (e.g. ctrl-c) turns into PROFILE_CANCEL.
    cancel_requested: CancellationToken,
}

impl SystemController {
    pub fn new(service_config: ServiceConfig, user_config: UserConfig) -> Self {
        Self {
            service_config,
            user_config,
            launch_mode: LaunchMode::InProcess,
            observer: Arc::new(LogProgressObserver),
            tokenizer: None,
            cancel_requested: CancellationToken::new(),
        }
    }

    pub fn with_launch_mode(mut self, launch_mode: LaunchMode) -> Self {
        self.launch_mode = launch_mode;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Token that cancels the run gracefully when fired.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_requested.clone()
    }

    fn expected_services(&self) -> HashMap<ServiceType, usize> {
        let mut expected = HashMap::new();
        expected.insert(ServiceType::TimingManager, 1);
        expected.insert(ServiceType::DatasetManager, 1);
        expected.insert(ServiceType::Worker, self.user_config.workers);
        expected.insert(ServiceType::RecordProcessor, self.user_config.record_processors);
        expected.insert(ServiceType::RecordsManager, 1);
        if self.user_config.gpu_telemetry_enabled {
            expected.insert(ServiceType::TelemetryManager, 1);
        }
        expected
    }

    pub async fn run(self) -> Result<RunOutcome> {
        self.user_config.validate()?;

        let root = CancellationToken::new();
        let mut service_tasks: JoinSet<()> = JoinSet::new();
        let mut children: Vec<tokio::process::Child> = Vec::new();

        // The broker comes up first; clients connect with retry while its
        // endpoints bind.
        let config_path = match self.launch_mode {
            LaunchMode::InProcess => {
                let broker =
                    ProxyBroker::new(self.service_config.comms.clone(), root.child_token());
                service_tasks.spawn(async move {
                    if let Err(e) = broker.run().await {
                        tracing::error!(error = %e, "broker failed");
                    }
                });
                None
            }
            LaunchMode::Subprocess => {
                let config_path = self.write_run_config().await?;
                children.push(self.spawn_child("broker", &config_path)?);
                Some(config_path)
            }
        };

        let ctx = ServiceContext::create(
            ServiceType::SystemController,
            self.service_config.clone(),
            root.child_token(),
        )
        .await?;

        let registry = Arc::new(ServiceRegistry::new(Duration::from_secs(
            self.service_config.stale_threshold_secs,
        )));
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<(String, CommandResponseStatus)>();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<ProcessRecordsResultMessage>();
        self.wire_subscriptions(&ctx, registry.clone(), ack_tx, results_tx)
            .await?;

        // Liveness sweep: services that stop heartbeating get flagged.
        {
            let registry = registry.clone();
            let cancel = root.child_token();
            let interval = Duration::from_secs(self.service_config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            for service_id in registry.sweep_stale() {
                                tracing::warn!(service_id, "service heartbeats are overdue, marking stale");
                            }
                        }
                    }
                }
            });
        }

        match self.launch_mode {
            LaunchMode::InProcess => {
                self.spawn_in_process(&root, &mut service_tasks).await?;
            }
            LaunchMode::Subprocess => {
                let config_path = config_path.expect("config path exists in subprocess mode");
                for kind in self.service_kinds() {
                    children.push(self.spawn_child(kind, &config_path)?);
                }
            }
        }

        // Wait for the whole fleet to reach RUNNING.
        let expected = self.expected_services();
        let registration_timeout = Duration::from_secs(self.service_config.registration_timeout_secs);
        let registered = tokio::time::timeout(registration_timeout, async {
            while !registry.all_running(&expected) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if registered.is_err() {
            root.cancel();
            return Err(AiperfError::RegistrationTimeout {
                timeout_secs: self.service_config.registration_timeout_secs,
                missing: registry.missing(&expected),
            });
        }
        tracing::info!("all services registered and running");

        // Configure every service, addressed, and wait for the ACKs.
        let service_ids: Vec<String> = registry
            .services()
            .iter()
            .map(|s| s.service_id.clone())
            .collect();
        let mut pending: HashSet<String> = HashSet::new();
        for service_id in &service_ids {
            let command = CommandMessage::addressed_to(
                ctx.service_id.clone(),
                CommandKind::ProfileConfigure,
                service_id.clone(),
            );
            pending.insert(command.command_id.clone());
            ctx.publish(Message::Command(command)).await?;
        }
        let configure_deadline = tokio::time::Instant::now() + registration_timeout;
        while !pending.is_empty() {
            let remaining = configure_deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(AiperfError::Timeout("profile configure acks"))?;
            match tokio::time::timeout(remaining, ack_rx.recv()).await {
                Ok(Some((command_id, status))) => {
                    if status == CommandResponseStatus::Failure {
                        root.cancel();
                        return Err(AiperfError::InvalidState(
                            "a service failed to configure".to_string(),
                        ));
                    }
                    pending.remove(&command_id);
                }
                Ok(None) | Err(_) => return Err(AiperfError::Timeout("profile configure acks")),
            }
        }
        tracing::info!("all services configured");

        ctx.publish(Message::Command(CommandMessage::broadcast(
            ctx.service_id.clone(),
            CommandKind::ProfileStart,
        )))
        .await?;
        tracing::info!("profile started");

        // Wait for results; an external cancel request becomes
        // PROFILE_CANCEL while we keep waiting for the (partial) results.
        let mut cancel_sent = false;
        let results = loop {
            tokio::select! {
                message = results_rx.recv() => break message,
                _ = self.cancel_requested.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    tracing::warn!("cancellation requested, stopping credit issuing");
                    let _ = ctx
                        .publish(Message::Command(CommandMessage::broadcast(
                            ctx.service_id.clone(),
                            CommandKind::ProfileCancel,
                        )))
                        .await;
                }
            }
        };

        let results = results.map(|message| message.results);
        if let Some(results) = &results {
            self.observer.on_results(results);
        }

        self.teardown(&ctx, &registry).await;
        root.cancel();
        for mut child in children {
            let _ = child.kill().await;
        }
        service_tasks.shutdown().await;

        Ok(RunOutcome { results })
    }

    async fn wire_subscriptions(
        &self,
        ctx: &ServiceContext,
        registry: Arc<ServiceRegistry>,
        ack_tx: mpsc::UnboundedSender<(String, CommandResponseStatus)>,
        results_tx: mpsc::UnboundedSender<ProcessRecordsResultMessage>,
    ) -> Result<()> {
        let observer = self.observer.clone();
        let callback_registry = registry.clone();
        ctx.subscriber
            .subscribe_all(vec![
                (
                    "registration",
                    callback(move |message| {
                        if let Message::Registration(m) = message {
                            tracing::debug!(service_id = %m.service_id, "service registered");
                            callback_registry.observe_registration(&m);
                        }
                    }),
                ),
                ("heartbeat", {
                    let registry = registry.clone();
                    callback(move |message| {
                        if let Message::Heartbeat(m) = message {
                            registry.observe_heartbeat(&m);
                        }
                    })
                }),
                ("status", {
                    let registry = registry.clone();
                    callback(move |message| {
                        if let Message::Status(m) = message {
                            registry.observe_status(&m);
                        }
                    })
                }),
                (
                    "command_response",
                    callback(move |message| {
                        if let Message::CommandResponse(m) = message {
                            let _ = ack_tx.send((m.command_id, m.status));
                        }
                    }),
                ),
                (
                    "process_records_result",
                    callback(move |message| {
                        if let Message::ProcessRecordsResult(m) = message {
                            let _ = results_tx.send(m);
                        }
                    }),
                ),
                ("credit_phase_progress", {
                    let observer = observer.clone();
                    callback(move |message| {
                        if let Message::CreditPhaseProgress(m) = message {
                            observer.on_phase_progress(&m);
                        }
                    })
                }),
                ("records_processing_stats", {
                    let observer = observer.clone();
                    callback(move |message| {
                        if let Message::RecordsProcessingStats(m) = message {
                            observer.on_processing_stats(&m);
                        }
                    })
                }),
                ("worker_health", {
                    let observer = observer.clone();
                    callback(move |message| {
                        if let Message::WorkerHealth(m) = message {
                            observer.on_worker_health(&m);
                        }
                    })
                }),
                ("telemetry_status", {
                    let observer = observer.clone();
                    callback(move |message| {
                        if let Message::TelemetryStatus(m) = message {
                            observer.on_telemetry_status(&m);
                        }
                    })
                }),
                (
                    "error",
                    callback(|message| {
                        if let Message::Error(m) = message {
                            tracing::error!(
                                service_id = m.service_id.as_deref().unwrap_or("unknown"),
                                kind = %m.error.kind,
                                message = %m.error.message,
                                "service error"
                            );
                        }
                    }),
                ),
            ])
            .await
    }

    async fn spawn_in_process(
        &self,
        root: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let user_config = self.user_config.clone();

        self.spawn_service(root, tasks, TimingManagerService::new(user_config.clone()))
            .await?;
        self.spawn_service(
            root,
            tasks,
            DatasetManagerService::new(user_config.conversations.clone())?,
        )
        .await?;
        for _ in 0..user_config.workers {
            self.spawn_service(root, tasks, WorkerService::new(user_config.clone())?)
                .await?;
        }
        for _ in 0..user_config.record_processors {
            self.spawn_service(
                root,
                tasks,
                RecordProcessorService::new(user_config.clone(), self.tokenizer.clone()),
            )
            .await?;
        }
        self.spawn_service(root, tasks, RecordsManagerService::new(user_config.clone()))
            .await?;
        if user_config.gpu_telemetry_enabled {
            self.spawn_service(root, tasks, TelemetryManagerService::new(user_config))
                .await?;
        }
        Ok(())
    }

    async fn spawn_service<S: crate::service::Service>(
        &self,
        root: &CancellationToken,
        tasks: &mut JoinSet<()>,
        service: S,
    ) -> Result<()> {
        let ctx = ServiceContext::create(
            service.service_type(),
            self.service_config.clone(),
            root.child_token(),
        )
        .await?;
        let runner = ServiceRunner::new(Arc::new(service), ctx);
        tasks.spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!(error = %e, "service exited with error");
            }
        });
        Ok(())
    }

    async fn write_run_config(&self) -> Result<std::path::PathBuf> {
        let run_config = crate::RunConfig {
            service: self.service_config.clone(),
            user: self.user_config.clone(),
        };
        let config_path = std::env::temp_dir().join(format!(
            "aiperf-run-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&run_config)?).await?;
        Ok(config_path)
    }

    fn service_kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = vec!["timing-manager", "dataset-manager"];
        kinds.extend(std::iter::repeat_n("worker", self.user_config.workers));
        kinds.extend(std::iter::repeat_n(
            "record-processor",
            self.user_config.record_processors,
        ));
        kinds.push("records-manager");
        if self.user_config.gpu_telemetry_enabled {
            kinds.push("telemetry-manager");
        }
        kinds
    }

    fn spawn_child(
        &self,
        kind: &str,
        config_path: &std::path::Path,
    ) -> Result<tokio::process::Child> {
        let exe = std::env::current_exe()?;
        Ok(tokio::process::Command::new(exe)
            .arg("service")
            .arg(kind)
            .arg("--config")
            .arg(config_path)
            .kill_on_drop(true)
            .spawn()?)
    }

    /// Shut services down one by one in reverse registration order, then
    /// sweep with a broadcast and wait for everyone to report STOPPED.
    async fn teardown(&self, ctx: &ServiceContext, registry: &ServiceRegistry) {
        let mut services = registry.services();
        services.sort_by_key(|s| std::cmp::Reverse(s.first_seen));

        for service in &services {
            let _ = ctx
                .publish(Message::Command(CommandMessage {
                    require_response: false,
                    ..CommandMessage::addressed_to(
                        ctx.service_id.clone(),
                        CommandKind::Shutdown,
                        service.service_id.clone(),
                    )
                }))
                .await;
        }
        let _ = ctx
            .publish(Message::Command(CommandMessage::broadcast(
                ctx.service_id.clone(),
                CommandKind::Shutdown,
            )))
            .await;

        let grace = Duration::from_secs(self.service_config.shutdown_grace_secs);
        let stopped = tokio::time::timeout(grace, async {
            while !registry.all_stopped() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if stopped.is_err() {
            tracing::warn!("some services did not report stopped before the deadline");
        } else {
            tracing::info!("all services stopped");
        }
    }
}

fn callback<F>(f: F) -> crate::comms::pubsub::SubscriberCallback
where
    F: Fn(Message) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |message| {
        let f = f.clone();
        Box::pin(async move { f(message) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_taxonomy() {
        assert_eq!(exit_code(&Ok(RunOutcome { results: None })), 0);
        assert_eq!(
            exit_code(&Err(AiperfError::Config("bad".into()))),
            2
        );
        assert_eq!(
            exit_code(&Err(AiperfError::RegistrationTimeout {
                timeout_secs: 30,
                missing: vec![],
            })),
            1
        );
    }
}
