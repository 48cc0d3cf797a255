//! Service lifecycle runtime.
//!
//! Every service moves through `CREATED -> INITIALIZING -> INITIALIZED ->
//! STARTING -> RUNNING -> STOPPING -> STOPPED`, exposing the four hook
//! points `on_init`, `on_start`, `on_stop`, `on_cleanup`. On RUNNING the
//! runner publishes a registration message and starts the heartbeat; the
//! controller's registry tracks liveness from there.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::comms::{DealerClient, PubClient, PullClient, PushClient, RouterClient, SubClient};
use crate::config::ServiceConfig;
use crate::error::{AiperfError, ErrorDetails, Result};
use crate::messages::{
    CommandKind, CommandMessage, CommandResponseMessage, CommandResponseStatus, HeartbeatMessage,
    Message, RegistrationMessage, ServiceState, ServiceType, StatusMessage,
};

pub use registry::{ServiceRegistration, ServiceRegistry};

/// Behavior hooks for one service. Concrete services use interior
/// mutability (`Arc` fields) so handlers spawned onto the runtime can share
/// state with the hooks.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn service_type(&self) -> ServiceType;

    /// Wire subscriptions and allocate resources. Runs in INITIALIZING.
    async fn on_init(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Start background work. Runs in STARTING, just before RUNNING.
    async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Handle a profile command addressed to (or broadcast at) this service.
    /// `Shutdown` never reaches here; the runner owns it.
    async fn on_command(&self, _command: &CommandMessage, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Stop background work. Runs in STOPPING.
    async fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Release resources after STOPPED.
    async fn on_cleanup(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }
}

/// Per-service runtime context: identity, config, comms clients, and the
/// cancellation token that drives shutdown.
pub struct ServiceContext {
    pub service_id: String,
    pub service_type: ServiceType,
    pub config: ServiceConfig,
    pub cancel: CancellationToken,
    pub publisher: Arc<PubClient>,
    pub subscriber: Arc<SubClient>,
}

impl ServiceContext {
    pub async fn create(
        service_type: ServiceType,
        config: ServiceConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let service_id = format!("{}-{}", service_type.as_str(), &Uuid::new_v4().simple().to_string()[..8]);
        Self::create_with_id(service_id, service_type, config, cancel).await
    }

    pub async fn create_with_id(
        service_id: String,
        service_type: ServiceType,
        config: ServiceConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let publisher =
            Arc::new(PubClient::connect(&config.comms.pubsub_frontend, cancel.clone()).await?);
        let subscriber = Arc::new(
            SubClient::connect(
                &config.comms.pubsub_backend,
                service_id.clone(),
                service_type,
                cancel.clone(),
            )
            .await?,
        );
        Ok(Self {
            service_id,
            service_type,
            config,
            cancel,
            publisher,
            subscriber,
        })
    }

    pub async fn publish(&self, message: Message) -> Result<()> {
        self.publisher.publish(&message).await
    }

    pub async fn push_client(&self, endpoint: &str) -> Result<PushClient> {
        PushClient::connect(endpoint, self.cancel.clone()).await
    }

    pub async fn pull_client(&self, endpoint: &str, max_concurrency: usize) -> Result<PullClient> {
        PullClient::connect(endpoint, max_concurrency, self.cancel.clone()).await
    }

    pub async fn dealer_client(&self) -> Result<DealerClient> {
        DealerClient::connect(
            &self.config.comms.dealer_frontend,
            Duration::from_secs(self.config.dealer_timeout_secs),
            self.cancel.clone(),
        )
        .await
    }

    pub async fn router_client(&self) -> Result<RouterClient> {
        RouterClient::connect(
            &self.config.comms.dealer_backend,
            self.service_id.clone(),
            self.cancel.clone(),
        )
        .await
    }
}

/// Drives one service through its lifecycle until shutdown.
pub struct ServiceRunner<S: Service> {
    service: Arc<S>,
    ctx: Arc<ServiceContext>,
    state_tx: watch::Sender<ServiceState>,
}

impl<S: Service> ServiceRunner<S> {
    pub fn new(service: Arc<S>, ctx: ServiceContext) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::Created);
        Self {
            service,
            ctx: Arc::new(ctx),
            state_tx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ServiceState) {
        tracing::debug!(
            service_id = %self.ctx.service_id,
            state = %state,
            "lifecycle transition"
        );
        let _ = self.state_tx.send(state);
    }

    async fn run_hook<F>(&self, hook: &'static str, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        fut.await.map_err(|e| AiperfError::HookFailed {
            hook,
            service_id: self.ctx.service_id.clone(),
            message: e.to_string(),
        })
    }

    /// Initialize, register, and run until the cancellation token fires,
    /// then stop and clean up. Hook failures are fatal to the service.
    pub async fn run(self) -> Result<()> {
        let ctx = self.ctx.clone();

        self.set_state(ServiceState::Initializing);
        self.run_hook("on_init", self.service.on_init(&ctx)).await?;
        self.wire_command_dispatch().await?;
        self.set_state(ServiceState::Initialized);

        self.set_state(ServiceState::Starting);
        self.run_hook("on_start", self.service.on_start(&ctx)).await?;
        self.set_state(ServiceState::Running);

        ctx.publish(Message::Registration(RegistrationMessage {
            service_id: ctx.service_id.clone(),
            service_type: ctx.service_type,
            state: ServiceState::Running,
            request_ns: Some(crate::clock::wall_now_ns()),
        }))
        .await?;
        self.spawn_heartbeat();

        tracing::info!(
            service_id = %ctx.service_id,
            service_type = %ctx.service_type,
            "service running"
        );

        ctx.cancel.cancelled().await;

        self.set_state(ServiceState::Stopping);
        if let Err(e) = self.service.on_stop(&ctx).await {
            tracing::error!(service_id = %ctx.service_id, error = %e, "on_stop hook failed");
        }
        self.set_state(ServiceState::Stopped);

        // Best effort: the bus may already be tearing down.
        let _ = ctx
            .publish(Message::Status(StatusMessage {
                service_id: ctx.service_id.clone(),
                service_type: ctx.service_type,
                state: ServiceState::Stopped,
                request_ns: Some(crate::clock::wall_now_ns()),
            }))
            .await;

        if let Err(e) = self.service.on_cleanup(&ctx).await {
            tracing::error!(service_id = %ctx.service_id, error = %e, "on_cleanup hook failed");
        }
        Ok(())
    }

    /// Subscribe to command messages and route them to the service.
    async fn wire_command_dispatch(&self) -> Result<()> {
        let service = self.service.clone();
        let ctx = self.ctx.clone();

        let callback: crate::comms::pubsub::SubscriberCallback = Arc::new(move |message| {
            let service = service.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                let Message::Command(command) = message else {
                    return;
                };
                if !command_is_for(&command, &ctx.service_id, ctx.service_type) {
                    return;
                }
                handle_command(service.as_ref(), &command, &ctx).await;
            })
        });

        self.ctx.subscriber.subscribe("command", callback).await
    }

    fn spawn_heartbeat(&self) {
        let ctx = self.ctx.clone();
        let state_rx = self.state_tx.subscribe();
        let interval = Duration::from_secs(ctx.config.heartbeat_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let state = *state_rx.borrow();
                        let _ = ctx
                            .publish(Message::Heartbeat(HeartbeatMessage {
                                service_id: ctx.service_id.clone(),
                                service_type: ctx.service_type,
                                state,
                                request_ns: Some(crate::clock::wall_now_ns()),
                            }))
                            .await;
                    }
                }
            }
        });
    }
}

fn command_is_for(command: &CommandMessage, service_id: &str, service_type: ServiceType) -> bool {
    match (&command.target_service_id, &command.target_service_type) {
        (Some(id), _) => id == service_id,
        (None, Some(ty)) => *ty == service_type,
        (None, None) => true,
    }
}

async fn handle_command<S: Service>(service: &S, command: &CommandMessage, ctx: &ServiceContext) {
    tracing::debug!(
        service_id = %ctx.service_id,
        command = command.kind.name(),
        "handling command"
    );

    let result = if matches!(command.kind, CommandKind::Shutdown) {
        Ok(())
    } else {
        service.on_command(command, ctx).await
    };

    if command.require_response {
        let (status, error) = match &result {
            Ok(()) => (CommandResponseStatus::Acknowledged, None),
            Err(e) => (CommandResponseStatus::Failure, Some(ErrorDetails::from(e))),
        };
        let _ = ctx
            .publish(Message::CommandResponse(CommandResponseMessage {
                service_id: ctx.service_id.clone(),
                command: command.kind.name().to_string(),
                command_id: command.command_id.clone(),
                status,
                error,
                request_ns: Some(crate::clock::wall_now_ns()),
                request_id: command.request_id.clone(),
            }))
            .await;
    }

    if let Err(e) = result {
        tracing::error!(
            service_id = %ctx.service_id,
            command = command.kind.name(),
            error = %e,
            "command handler failed"
        );
    }

    if matches!(command.kind, CommandKind::Shutdown) {
        ctx.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targeting() {
        let mut command = CommandMessage::broadcast("ctl", CommandKind::ProfileStart);
        assert!(command_is_for(&command, "worker-1", ServiceType::Worker));

        command.target_service_type = Some(ServiceType::Worker);
        assert!(command_is_for(&command, "worker-1", ServiceType::Worker));
        assert!(!command_is_for(
            &command,
            "records_manager-1",
            ServiceType::RecordsManager
        ));

        command.target_service_id = Some("worker-2".into());
        assert!(!command_is_for(&command, "worker-1", ServiceType::Worker));
        assert!(command_is_for(&command, "worker-2", ServiceType::Worker));
    }
}
