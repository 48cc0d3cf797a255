//! PUSH and PULL clients for load-balanced work queues.
//!
//! Wire format is a single UTF-8 JSON frame.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use zeromq::prelude::*;
use zeromq::{PullSocket, PushSocket, ZmqMessage};

use crate::comms::{RECV_POLL_TIMEOUT, SEND_BACKOFF, SEND_MAX_ATTEMPTS, connect_with_retry};
use crate::error::{AiperfError, Result};
use crate::messages::Message;

/// Callback invoked for each pulled message of a registered type.
pub type PullCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Work producer. Each pushed message is delivered to exactly one consumer.
pub struct PushClient {
    socket: Mutex<PushSocket>,
    cancel: CancellationToken,
}

impl PushClient {
    pub async fn connect(endpoint: &str, cancel: CancellationToken) -> Result<Self> {
        let mut socket = PushSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
            cancel,
        })
    }

    pub async fn push(&self, message: &Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let payload = message.to_json()?;

        let mut socket = self.socket.lock().await;
        let mut attempt = 0;
        loop {
            match socket.send(payload.clone().into()).await {
                Ok(()) => return Ok(()),
                Err(_) if self.cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= SEND_MAX_ATTEMPTS {
                        return Err(AiperfError::Bus {
                            operation: "push",
                            message: e.to_string(),
                        });
                    }
                    tokio::time::sleep(SEND_BACKOFF * attempt).await;
                }
            }
        }
    }
}

/// Work consumer with bounded concurrency.
///
/// The semaphore is acquired once per message *before* the receive so the
/// push side load-balances fairly across busy and idle consumers, and is
/// released exactly once when the processing task finishes, times out, or
/// the receive errors.
pub struct PullClient {
    socket: Mutex<Option<PullSocket>>,
    callbacks: Arc<DashMap<String, PullCallback>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl PullClient {
    pub async fn connect(
        endpoint: &str,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut socket = PullSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            callbacks: Arc::new(DashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            cancel,
        })
    }

    /// Register the callback for one message type. Exactly one callback may
    /// be registered per type.
    pub fn register_pull_callback(&self, message_type: &str, callback: PullCallback) -> Result<()> {
        if self
            .callbacks
            .insert(message_type.to_string(), callback)
            .is_some()
        {
            return Err(AiperfError::Bus {
                operation: "register_pull_callback",
                message: format!("callback already registered for {message_type}"),
            });
        }
        Ok(())
    }

    /// Start the background receive loop. Call after callbacks are
    /// registered.
    pub async fn start(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .await
            .take()
            .ok_or(AiperfError::InvalidState("pull client already started".into()))?;

        tokio::spawn(receive_loop(
            socket,
            self.callbacks.clone(),
            self.semaphore.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }
}

async fn receive_loop(
    mut socket: PullSocket,
    callbacks: Arc<DashMap<String, PullCallback>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        // Acquire before receiving; the fabric only hands this consumer a
        // message once it has capacity to run it.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => {
                drop(permit);
                break;
            }
            received = tokio::time::timeout(RECV_POLL_TIMEOUT, socket.recv()) => received,
        };

        match received {
            Err(_elapsed) => {
                // Timed out without a message; the permit was never used.
                drop(permit);
            }
            Ok(Err(e)) => {
                drop(permit);
                tracing::warn!(error = %e, "pull receive error");
                if cancel.is_cancelled() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            Ok(Ok(frames)) => {
                let callbacks = callbacks.clone();
                tokio::spawn(async move {
                    // Permit is dropped when this task ends, covering
                    // success, callback panic unwind, and parse failures.
                    let _permit = permit;
                    process_message(&callbacks, frames).await;
                });
            }
        }
    }
}

async fn process_message(callbacks: &DashMap<String, PullCallback>, frames: ZmqMessage) {
    let Some(payload) = frames.get(0) else {
        return;
    };
    let message = match std::str::from_utf8(payload)
        .map_err(|e| AiperfError::ResponseParse(e.to_string()))
        .and_then(Message::from_json)
    {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "failed to deserialize pulled payload");
            return;
        }
    };

    let callback = callbacks.get(message.message_type()).map(|c| c.clone());
    match callback {
        Some(callback) => callback(message).await,
        None => {
            tracing::warn!(
                message_type = message.message_type(),
                "pulled message without a registered callback"
            );
        }
    }
}
