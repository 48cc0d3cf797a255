//! The communication broker: three proxy patterns in one process.
//!
//! The broker is the only component that binds sockets; every service
//! connects to a broker endpoint. The pub/sub proxy is a bound SUB
//! (subscribed to everything) forwarding into a bound PUB, since the
//! pure-Rust `zeromq` crate provides no XPUB/XSUB socket types. This also
//! makes subscriber registration purely local: the frontend forwards all
//! topics unconditionally, so no subscription settle delay exists anywhere.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use zeromq::prelude::*;
use zeromq::{DealerSocket, PubSocket, PullSocket, PushSocket, RouterSocket, SubSocket};

use crate::config::{CommsConfig, PushChannel};
use crate::error::Result;

const PROXY_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Hosts the XPUB/XSUB-style, ROUTER/DEALER, and PULL/PUSH proxies.
pub struct ProxyBroker {
    config: CommsConfig,
    cancel: CancellationToken,
}

impl ProxyBroker {
    pub fn new(config: CommsConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Bind every endpoint, spawn the pump loops, and run until cancelled.
    ///
    /// All binds complete before any pump starts, so a client that can
    /// connect can immediately traffic.
    pub async fn run(self) -> Result<()> {
        let mut tasks: JoinSet<()> = JoinSet::new();

        // -- PUB/SUB proxy --
        let mut pubsub_frontend = SubSocket::new();
        pubsub_frontend.bind(&self.config.pubsub_frontend).await?;
        pubsub_frontend.subscribe("").await?;
        let mut pubsub_backend = PubSocket::new();
        pubsub_backend.bind(&self.config.pubsub_backend).await?;
        tracing::info!(
            frontend = %self.config.pubsub_frontend,
            backend = %self.config.pubsub_backend,
            "pub/sub proxy bound"
        );
        tasks.spawn(pubsub_pump(
            pubsub_frontend,
            pubsub_backend,
            self.cancel.clone(),
        ));

        // -- ROUTER/DEALER proxy --
        let mut dealer_frontend = RouterSocket::new();
        dealer_frontend.bind(&self.config.dealer_frontend).await?;
        let mut dealer_backend = DealerSocket::new();
        dealer_backend.bind(&self.config.dealer_backend).await?;
        tracing::info!(
            frontend = %self.config.dealer_frontend,
            backend = %self.config.dealer_backend,
            "router/dealer proxy bound"
        );
        tasks.spawn(dealer_pump(
            dealer_frontend,
            dealer_backend,
            self.cancel.clone(),
        ));

        // -- PULL/PUSH work queues --
        for (name, channel) in [
            ("credit_drop", &self.config.credit_drop),
            ("credit_return", &self.config.credit_return),
            ("raw_records", &self.config.raw_records),
            ("metric_records", &self.config.metric_records),
        ] {
            let (frontend, backend) = bind_push_channel(channel).await?;
            tracing::info!(
                channel = name,
                frontend = %channel.frontend,
                backend = %channel.backend,
                "pull/push proxy bound"
            );
            tasks.spawn(push_pump(frontend, backend, self.cancel.clone()));
        }

        self.cancel.cancelled().await;
        tracing::info!("broker shutting down");
        tasks.shutdown().await;
        Ok(())
    }
}

async fn bind_push_channel(channel: &PushChannel) -> Result<(PullSocket, PushSocket)> {
    let mut frontend = PullSocket::new();
    frontend.bind(&channel.frontend).await?;
    let mut backend = PushSocket::new();
    backend.bind(&channel.backend).await?;
    Ok((frontend, backend))
}

/// One-direction pump: bound SUB -> bound PUB.
async fn pubsub_pump(mut frontend: SubSocket, mut backend: PubSocket, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match tokio::time::timeout(PROXY_POLL_TIMEOUT, frontend.recv()).await {
            Ok(Ok(frames)) => {
                if let Err(e) = backend.send(frames).await {
                    tracing::warn!(error = %e, "pub/sub backend send error");
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "pub/sub frontend recv error"),
            Err(_) => {} // timeout, re-check shutdown
        }
    }
}

/// Bidirectional pump: bound ROUTER (requesters) <-> bound DEALER
/// (responders). Routing envelopes pass through untouched.
async fn dealer_pump(
    mut frontend: RouterSocket,
    mut backend: DealerSocket,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = frontend.recv() => match request {
                Ok(frames) => {
                    if let Err(e) = backend.send(frames).await {
                        tracing::warn!(error = %e, "dealer proxy backend send error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dealer proxy frontend recv error"),
            },
            response = backend.recv() => match response {
                Ok(frames) => {
                    if let Err(e) = frontend.send(frames).await {
                        tracing::warn!(error = %e, "dealer proxy frontend send error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dealer proxy backend recv error"),
            },
        }
    }
}

/// One-direction pump: bound PULL (producers) -> bound PUSH (consumers).
async fn push_pump(mut frontend: PullSocket, mut backend: PushSocket, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match tokio::time::timeout(PROXY_POLL_TIMEOUT, frontend.recv()).await {
            Ok(Ok(frames)) => {
                if let Err(e) = backend.send(frames).await {
                    tracing::warn!(error = %e, "pull/push backend send error");
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "pull/push frontend recv error"),
            Err(_) => {}
        }
    }
}
