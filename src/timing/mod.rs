//! Timing manager: the credit engine that drives the run.
//!
//! For each configured phase it publishes the phase lifecycle messages,
//! pushes credits on schedule while respecting `max_concurrency`, and
//! advances when every in-flight credit has been returned. Cancellation
//! short-circuits sending; in-flight credits are still awaited up to a
//! shutdown deadline.

pub mod strategy;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock;
use crate::comms::{PubClient, PullClient, PushClient};
use crate::config::UserConfig;
use crate::error::{AiperfError, Result};
use crate::messages::{
    CommandKind, CommandMessage, CreditDrop, CreditPhaseCompleteMessage,
    CreditPhaseProgressMessage, CreditPhaseSendingCompleteMessage, CreditPhaseStartMessage,
    CreditReturn, CreditsCompleteMessage, Message, ServiceType,
};
use crate::models::credit::{CreditPhase, CreditPhaseStats};
use crate::service::{Service, ServiceContext};

use strategy::build_strategy;

pub struct TimingManagerService {
    inner: Arc<TimingInner>,
    pull: OnceLock<PullClient>,
}

struct TimingInner {
    user_config: UserConfig,
    state: parking_lot::Mutex<TimingState>,
    /// Woken on every credit return and on cancellation.
    returns: Notify,
    /// Woken by PROFILE_START.
    start_signal: Notify,
    drops_push: OnceLock<PushClient>,
    publisher: OnceLock<Arc<PubClient>>,
    service_id: OnceLock<String>,
}

#[derive(Default)]
struct TimingState {
    phases: Vec<CreditPhaseStats>,
    current: Option<usize>,
    cancelled: bool,
    started: bool,
    /// Count of returns that reported a positive send delay.
    delayed_returns: u64,
}

impl TimingManagerService {
    pub fn new(user_config: UserConfig) -> Self {
        Self {
            inner: Arc::new(TimingInner {
                user_config,
                state: parking_lot::Mutex::new(TimingState::default()),
                returns: Notify::new(),
                start_signal: Notify::new(),
                drops_push: OnceLock::new(),
                publisher: OnceLock::new(),
                service_id: OnceLock::new(),
            }),
            pull: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Service for TimingManagerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::TimingManager
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let _ = self.inner.service_id.set(ctx.service_id.clone());
        let _ = self.inner.publisher.set(ctx.publisher.clone());

        for phase in self.inner.user_config.phase_configs() {
            phase.validate()?;
        }

        let drops_push = ctx
            .push_client(&ctx.config.comms.credit_drop.frontend)
            .await?;
        let _ = self.inner.drops_push.set(drops_push);

        let pull = ctx
            .pull_client(&ctx.config.comms.credit_return.backend, 64)
            .await?;
        let inner = self.inner.clone();
        pull.register_pull_callback(
            "credit_return",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    if let Message::CreditReturn(credit) = message {
                        inner.on_credit_return(credit);
                    }
                })
            }),
        )?;
        self.pull
            .set(pull)
            .map_err(|_| AiperfError::InvalidState("timing manager already initialized".into()))?;
        Ok(())
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        self.pull
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .start()
            .await?;

        let inner = self.inner.clone();
        let cancel = ctx.cancel.clone();
        let progress_interval = Duration::from_secs(ctx.config.progress_report_interval_secs);
        let shutdown_grace = Duration::from_secs(ctx.config.shutdown_grace_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = inner.clone().run_phases(progress_interval, shutdown_grace, cancel.clone()) => {}
            }
        });
        Ok(())
    }

    async fn on_command(&self, command: &CommandMessage, _ctx: &ServiceContext) -> Result<()> {
        match command.kind {
            CommandKind::ProfileStart => {
                let mut state = self.inner.state.lock();
                if !state.started {
                    state.started = true;
                    self.inner.start_signal.notify_waiters();
                }
                Ok(())
            }
            CommandKind::ProfileCancel => {
                self.inner.cancel();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        self.inner.cancel();
        Ok(())
    }
}

impl TimingInner {
    fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.cancelled = true;
            tracing::info!("credit issuing cancelled");
        }
        drop(state);
        self.returns.notify_waiters();
        self.start_signal.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn on_credit_return(&self, credit: CreditReturn) {
        let mut state = self.state.lock();
        if let Some(stats) = state
            .phases
            .iter_mut()
            .find(|stats| stats.config.phase == credit.phase)
        {
            stats.completed += 1;
        }
        if credit.delayed_ns.is_some_and(|d| d > 0) {
            state.delayed_returns += 1;
        }
        drop(state);
        self.returns.notify_waiters();
    }

    async fn run_phases(
        self: Arc<Self>,
        progress_interval: Duration,
        shutdown_grace: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        // Hold until PROFILE_START. Polled with a short timeout so a
        // notification landing between the flag check and the wait is never
        // lost.
        loop {
            let (started, cancelled) = {
                let state = self.state.lock();
                (state.started, state.cancelled)
            };
            if cancelled {
                return;
            }
            if started {
                break;
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                self.start_signal.notified(),
            )
            .await;
        }

        let phase_configs = self.user_config.phase_configs();
        {
            let mut state = self.state.lock();
            state.phases = phase_configs
                .iter()
                .cloned()
                .map(CreditPhaseStats::from_config)
                .collect();
        }

        for (index, config) in phase_configs.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }
            if let Err(e) = self
                .run_phase(index, config.phase, progress_interval, shutdown_grace, &cancel)
                .await
            {
                tracing::error!(phase = %config.phase, error = %e, "credit phase failed");
                break;
            }
        }

        self.publish(Message::CreditsComplete(CreditsCompleteMessage {
            service_id: self.id(),
        }))
        .await;
    }

    async fn run_phase(
        self: &Arc<Self>,
        index: usize,
        phase: CreditPhase,
        progress_interval: Duration,
        shutdown_grace: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        let start_ns = clock::wall_now_ns();
        let (total_expected, expected_duration) = {
            let mut state = self.state.lock();
            state.current = Some(index);
            let stats = &mut state.phases[index];
            stats.start_ns = Some(start_ns);
            (
                stats.config.total_expected_requests,
                stats.config.expected_duration_sec,
            )
        };

        tracing::info!(phase = %phase, "credit phase starting");
        self.publish(Message::CreditPhaseStart(CreditPhaseStartMessage {
            service_id: self.id(),
            phase,
            start_ns,
            total_expected_requests: total_expected,
            expected_duration_sec: expected_duration,
        }))
        .await;

        let progress_task = self.spawn_progress_task(index, phase, progress_interval);

        let mut strategy =
            build_strategy(&self.user_config.load.generator, &self.user_config.conversations)?;
        let max_concurrency = self.user_config.load.max_concurrency;

        // Send loop.
        loop {
            let should_send = {
                let state = self.state.lock();
                !state.cancelled && state.phases[index].should_send()
            };
            if !should_send {
                break;
            }

            let Some(credit) = strategy.next(start_ns) else {
                break;
            };
            if let Some(due_ns) = credit.credit_drop_ns {
                clock::sleep_until_wall_ns(due_ns).await;
            }

            // Concurrency admission: block on credit returns until a slot
            // frees up.
            if let Some(max) = max_concurrency {
                loop {
                    let admitted = {
                        let state = self.state.lock();
                        state.cancelled || state.phases[index].in_flight() < max
                    };
                    if admitted {
                        break;
                    }
                    tokio::select! {
                        _ = self.returns.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                if self.is_cancelled() {
                    break;
                }
            }

            let credit_num = {
                let state = self.state.lock();
                state.phases[index].sent
            };
            let drop = CreditDrop {
                id: Uuid::new_v4().to_string(),
                phase,
                credit_num,
                conversation_id: credit.conversation_id,
                credit_drop_ns: credit.credit_drop_ns,
                cancel_after_ns: self.user_config.load.cancel_after_ns,
            };
            self.drops_push
                .get()
                .ok_or(AiperfError::NotInitialized)?
                .push(&Message::CreditDrop(drop))
                .await?;

            let mut state = self.state.lock();
            state.phases[index].sent += 1;
        }

        // Sending is done; record it and drain in-flight credits.
        let sent_end_ns = clock::wall_now_ns();
        let sent = {
            let mut state = self.state.lock();
            let stats = &mut state.phases[index];
            stats.sent_end_ns = Some(sent_end_ns);
            stats.sent
        };
        self.publish(Message::CreditPhaseSendingComplete(
            CreditPhaseSendingCompleteMessage {
                service_id: self.id(),
                phase,
                sent_end_ns,
                sent,
            },
        ))
        .await;

        let was_cancelled = self.drain_phase(index, shutdown_grace, cancel).await;

        let end_ns = clock::wall_now_ns();
        let completed = {
            let mut state = self.state.lock();
            let stats = &mut state.phases[index];
            stats.end_ns = Some(end_ns);
            stats.was_cancelled = was_cancelled;
            stats.completed
        };

        progress_task.abort();
        // Final progress snapshot so observers see the settled counts.
        self.publish(Message::CreditPhaseProgress(CreditPhaseProgressMessage {
            service_id: self.id(),
            phase,
            sent,
            completed,
            progress_percent: {
                let state = self.state.lock();
                state.phases[index].progress_percent()
            },
        }))
        .await;

        tracing::info!(phase = %phase, sent, completed, was_cancelled, "credit phase complete");
        self.publish(Message::CreditPhaseComplete(CreditPhaseCompleteMessage {
            service_id: self.id(),
            phase,
            end_ns,
            completed,
            was_cancelled,
        }))
        .await;
        Ok(())
    }

    /// Wait until every sent credit has been returned. After cancellation,
    /// wait at most the shutdown grace; unreturned credits mark the phase
    /// cancelled.
    async fn drain_phase(
        &self,
        index: usize,
        shutdown_grace: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + shutdown_grace;
        loop {
            let (drained, cancelled) = {
                let state = self.state.lock();
                (state.phases[index].in_flight() == 0, state.cancelled)
            };
            if drained {
                // Every credit came back, so nothing was abandoned.
                return false;
            }
            if cancelled && tokio::time::Instant::now() >= deadline {
                tracing::warn!("shutdown deadline reached with unreturned credits");
                return true;
            }

            tokio::select! {
                _ = self.returns.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = cancel.cancelled() => return true,
            }
        }
    }

    fn spawn_progress_task(
        self: &Arc<Self>,
        index: usize,
        phase: CreditPhase,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (sent, completed, progress) = {
                    let state = inner.state.lock();
                    let stats = &state.phases[index];
                    (stats.sent, stats.completed, stats.progress_percent())
                };
                inner
                    .publish(Message::CreditPhaseProgress(CreditPhaseProgressMessage {
                        service_id: inner.id(),
                        phase,
                        sent,
                        completed,
                        progress_percent: progress,
                    }))
                    .await;
            }
        })
    }

    async fn publish(&self, message: Message) {
        if let Some(publisher) = self.publisher.get() {
            if let Err(e) = publisher.publish(&message).await {
                tracing::error!(error = %e, "timing manager publish failed");
            }
        }
    }

    fn id(&self) -> String {
        self.service_id.get().cloned().unwrap_or_default()
    }
}
