//! PUB and SUB clients.
//!
//! Wire format is two frames: topic bytes, then UTF-8 JSON payload bytes.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::comms::{SEND_BACKOFF, SEND_MAX_ATTEMPTS, connect_with_retry, topic};
use crate::error::{AiperfError, Result};
use crate::messages::{Message, ServiceType};

/// Callback invoked for each received message of a subscribed type.
pub type SubscriberCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fire-and-forget publisher. `publish` does not wait for any confirmation,
/// and bus shutdown swallows errors silently.
pub struct PubClient {
    socket: Mutex<PubSocket>,
    cancel: CancellationToken,
}

impl PubClient {
    pub async fn connect(endpoint: &str, cancel: CancellationToken) -> Result<Self> {
        let mut socket = PubSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
            cancel,
        })
    }

    /// Publish a message under its type topic, or under an addressed topic
    /// when the message carries a target.
    pub async fn publish(&self, message: &Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let target = message.target();
        let topic = topic::encode(message.message_type(), target.as_deref());
        let payload = message.to_json()?;

        let mut socket = self.socket.lock().await;
        let mut attempt = 0;
        loop {
            let mut frames: ZmqMessage = topic.clone().into();
            frames.push_back(Bytes::from(payload.clone().into_bytes()));

            match socket.send(frames).await {
                Ok(()) => return Ok(()),
                Err(_) if self.cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= SEND_MAX_ATTEMPTS {
                        return Err(AiperfError::Bus {
                            operation: "publish",
                            message: e.to_string(),
                        });
                    }
                    tokio::time::sleep(SEND_BACKOFF * attempt).await;
                }
            }
        }
    }
}

enum SubCommand {
    Subscribe(String, oneshot::Sender<Result<()>>),
}

/// Subscriber with a background receive loop that deserializes and
/// dispatches to every registered callback for the message type. Callback
/// failures are logged and never stop the loop.
pub struct SubClient {
    callbacks: Arc<DashMap<String, Vec<SubscriberCallback>>>,
    commands: mpsc::Sender<SubCommand>,
    service_id: String,
    service_type: ServiceType,
}

impl SubClient {
    pub async fn connect(
        endpoint: &str,
        service_id: impl Into<String>,
        service_type: ServiceType,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut socket = SubSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;

        let callbacks: Arc<DashMap<String, Vec<SubscriberCallback>>> = Arc::new(DashMap::new());
        let (commands_tx, commands_rx) = mpsc::channel(32);

        tokio::spawn(receive_loop(socket, callbacks.clone(), commands_rx, cancel));

        Ok(Self {
            callbacks,
            commands: commands_tx,
            service_id: service_id.into(),
            service_type,
        })
    }

    /// Subscribe a callback to one message type. Covers the broadcast topic
    /// and both addressed forms (by service id and by service type), since a
    /// subscriber accepting either must subscribe to each encoding.
    pub async fn subscribe(&self, message_type: &str, callback: SubscriberCallback) -> Result<()> {
        let first_for_type = {
            let mut entry = self.callbacks.entry(message_type.to_string()).or_default();
            entry.push(callback);
            entry.len() == 1
        };

        // Socket-level subscriptions only need to be issued once per type.
        if first_for_type {
            self.add_subscription(topic::broadcast_subscription(message_type))
                .await?;
            self.add_subscription(topic::addressed_subscription(message_type, &self.service_id))
                .await?;
            self.add_subscription(topic::addressed_subscription(
                message_type,
                self.service_type.as_str(),
            ))
            .await?;
        }
        Ok(())
    }

    /// Subscribe several message types at once.
    pub async fn subscribe_all(
        &self,
        map: Vec<(&str, SubscriberCallback)>,
    ) -> Result<()> {
        for (message_type, callback) in map {
            self.subscribe(message_type, callback).await?;
        }
        Ok(())
    }

    async fn add_subscription(&self, prefix: String) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(SubCommand::Subscribe(prefix, ack_tx))
            .await
            .map_err(|_| AiperfError::AlreadyShutdown)?;
        ack_rx.await.map_err(|_| AiperfError::AlreadyShutdown)?
    }
}

async fn receive_loop(
    mut socket: SubSocket,
    callbacks: Arc<DashMap<String, Vec<SubscriberCallback>>>,
    mut commands: mpsc::Receiver<SubCommand>,
    cancel: CancellationToken,
) {
    let mut commands_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv(), if commands_open => match command {
                Some(SubCommand::Subscribe(prefix, ack)) => {
                    let result = socket
                        .subscribe(&prefix)
                        .await
                        .map_err(AiperfError::from);
                    let _ = ack.send(result);
                }
                None => commands_open = false,
            },
            received = socket.recv() => match received {
                Ok(frames) => dispatch(&callbacks, frames),
                Err(e) => {
                    tracing::warn!(error = %e, "sub receive error");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            },
        }
    }
}

fn dispatch(callbacks: &DashMap<String, Vec<SubscriberCallback>>, frames: ZmqMessage) {
    // Frame 0 is the topic, frame 1 the JSON payload.
    let Some(payload) = frames.get(1) else {
        tracing::warn!(frames = frames.len(), "dropping malformed pub/sub message");
        return;
    };

    let message = match std::str::from_utf8(payload)
        .map_err(|e| AiperfError::ResponseParse(e.to_string()))
        .and_then(Message::from_json)
    {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "failed to deserialize pub/sub payload");
            return;
        }
    };

    let Some(registered) = callbacks.get(message.message_type()) else {
        return;
    };

    // All callbacks for the topic run concurrently; a failing callback only
    // affects its own task.
    for callback in registered.iter() {
        let callback = callback.clone();
        let message = message.clone();
        tokio::spawn(async move { callback(message).await });
    }
}
