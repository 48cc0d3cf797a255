//! DEALER and ROUTER clients for async request/reply.
//!
//! Response ordering is not guaranteed to match request order; correlation
//! is by `request_id`. The router side never leaks a routing envelope: every
//! received request with a `request_id` produces exactly one reply frame,
//! either the handler's response, an error message, or a no-response error
//! message.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::comms::connect_with_retry;
use crate::error::{AiperfError, ErrorDetails, Result};
use crate::messages::{ErrorMessage, Message, NO_RESPONSE_KIND};

/// Handler invoked for each routed request of a registered type. Returning
/// `Ok(None)` produces a no-response error back to the requester.
pub type RequestHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Message>>> + Send + Sync>;

/// Requester side. Many requests may be outstanding at once.
pub struct DealerClient {
    pending: Arc<DashMap<String, oneshot::Sender<Message>>>,
    outgoing: mpsc::Sender<ZmqMessage>,
    default_timeout: Duration,
}

impl DealerClient {
    pub async fn connect(
        endpoint: &str,
        default_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut socket = DealerSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;

        let pending: Arc<DashMap<String, oneshot::Sender<Message>>> = Arc::new(DashMap::new());
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);

        tokio::spawn(dealer_loop(socket, pending.clone(), outgoing_rx, cancel));

        Ok(Self {
            pending,
            outgoing: outgoing_tx,
            default_timeout,
        })
    }

    /// Send a request and return its correlation id plus a receiver that
    /// resolves with the response. The caller owns the wait.
    pub async fn request_async(
        &self,
        mut message: Message,
    ) -> Result<(String, oneshot::Receiver<Message>)> {
        let request_id = match message.request_id() {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                message.set_request_id(id.clone());
                id
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), response_tx);

        let payload = message.to_json()?;
        if self.outgoing.send(payload.into()).await.is_err() {
            self.pending.remove(&request_id);
            return Err(AiperfError::AlreadyShutdown);
        }
        Ok((request_id, response_rx))
    }

    /// Send a request and await its response, bounded by `timeout` (the
    /// client default when `None`).
    pub async fn request(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        let (request_id, response_rx) = self.request_async(message).await?;

        let deadline = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(deadline, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AiperfError::AlreadyShutdown),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(AiperfError::Timeout("dealer response"))
            }
        }
    }
}

async fn dealer_loop(
    mut socket: DealerSocket,
    pending: Arc<DashMap<String, oneshot::Sender<Message>>>,
    mut outgoing: mpsc::Receiver<ZmqMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frames) = outgoing.recv() => {
                if let Err(e) = socket.send(frames).await {
                    tracing::warn!(error = %e, "dealer send error");
                }
            }
            received = socket.recv() => match received {
                Ok(frames) => dispatch_response(&pending, frames),
                Err(e) => {
                    tracing::warn!(error = %e, "dealer receive error");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            },
        }
    }
}

fn dispatch_response(pending: &DashMap<String, oneshot::Sender<Message>>, frames: ZmqMessage) {
    // The payload is the last frame; any broker routing residue precedes it.
    let Some(payload) = frames.get(frames.len() - 1) else {
        return;
    };
    let message = match std::str::from_utf8(payload)
        .map_err(|e| AiperfError::ResponseParse(e.to_string()))
        .and_then(Message::from_json)
    {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "failed to deserialize dealer response");
            return;
        }
    };

    let Some(request_id) = message.request_id().map(str::to_string) else {
        tracing::warn!("dealer response without request_id, dropping");
        return;
    };

    match pending.remove(&request_id) {
        Some((_, response_tx)) => {
            let _ = response_tx.send(message);
        }
        None => tracing::debug!(request_id, "response for unknown or timed-out request"),
    }
}

/// Responder side. One handler per message type.
pub struct RouterClient {
    handlers: Arc<DashMap<String, RequestHandler>>,
    service_id: String,
    started: std::sync::atomic::AtomicBool,
    socket: tokio::sync::Mutex<Option<RouterSocket>>,
    replies: mpsc::Sender<ZmqMessage>,
    replies_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ZmqMessage>>>,
    cancel: CancellationToken,
}

impl RouterClient {
    pub async fn connect(
        endpoint: &str,
        service_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut socket = RouterSocket::new();
        connect_with_retry(&mut socket, endpoint).await?;
        let (replies_tx, replies_rx) = mpsc::channel(64);

        Ok(Self {
            handlers: Arc::new(DashMap::new()),
            service_id: service_id.into(),
            started: std::sync::atomic::AtomicBool::new(false),
            socket: tokio::sync::Mutex::new(Some(socket)),
            replies: replies_tx,
            replies_rx: tokio::sync::Mutex::new(Some(replies_rx)),
            cancel,
        })
    }

    /// Register the handler for one message type (1:1).
    pub fn register_request_handler(
        &self,
        message_type: &str,
        handler: RequestHandler,
    ) -> Result<()> {
        if self
            .handlers
            .insert(message_type.to_string(), handler)
            .is_some()
        {
            return Err(AiperfError::Bus {
                operation: "register_request_handler",
                message: format!("handler already registered for {message_type}"),
            });
        }
        Ok(())
    }

    /// Start the background receive loop. Call after handlers are
    /// registered.
    pub async fn start(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AiperfError::InvalidState("router client already started".into()));
        }
        let socket = self
            .socket
            .lock()
            .await
            .take()
            .ok_or(AiperfError::InvalidState("router socket missing".into()))?;
        let replies_rx = self
            .replies_rx
            .lock()
            .await
            .take()
            .ok_or(AiperfError::InvalidState("router replies missing".into()))?;

        tokio::spawn(router_loop(
            socket,
            self.handlers.clone(),
            self.replies.clone(),
            replies_rx,
            self.service_id.clone(),
            self.cancel.clone(),
        ));
        Ok(())
    }
}

async fn router_loop(
    mut socket: RouterSocket,
    handlers: Arc<DashMap<String, RequestHandler>>,
    replies_tx: mpsc::Sender<ZmqMessage>,
    mut replies_rx: mpsc::Receiver<ZmqMessage>,
    service_id: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(frames) = replies_rx.recv() => {
                if let Err(e) = socket.send(frames).await {
                    tracing::warn!(error = %e, "router reply send error");
                }
            }
            received = socket.recv() => match received {
                Ok(frames) => handle_request(&handlers, &replies_tx, &service_id, frames),
                Err(e) => {
                    tracing::warn!(error = %e, "router receive error");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            },
        }
    }
}

fn handle_request(
    handlers: &DashMap<String, RequestHandler>,
    replies_tx: &mpsc::Sender<ZmqMessage>,
    service_id: &str,
    frames: ZmqMessage,
) {
    if frames.len() < 2 {
        tracing::warn!(frames = frames.len(), "router request without envelope");
        return;
    }

    // Every frame before the payload is the routing envelope and must be
    // echoed back verbatim.
    let envelope: Vec<Bytes> = frames
        .iter()
        .take(frames.len() - 1)
        .cloned()
        .collect();
    let payload = frames.get(frames.len() - 1).cloned();

    let parsed = payload
        .as_deref()
        .map(|bytes| {
            std::str::from_utf8(bytes)
                .map_err(|e| AiperfError::ResponseParse(e.to_string()))
                .and_then(Message::from_json)
        })
        .unwrap_or(Err(AiperfError::ResponseParse("empty payload".into())));

    let message = match parsed {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "failed to deserialize router request");
            return;
        }
    };

    let request_id = message.request_id().map(str::to_string);
    let handler = handlers.get(message.message_type()).map(|h| h.clone());
    let replies_tx = replies_tx.clone();
    let service_id = service_id.to_string();
    let message_type = message.message_type();

    tokio::spawn(async move {
        let outcome = match handler {
            Some(handler) => handler(message).await,
            None => Err(AiperfError::Bus {
                operation: "route",
                message: format!("no handler registered for {message_type}"),
            }),
        };

        let mut response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => Message::Error(ErrorMessage {
                service_id: Some(service_id),
                error: ErrorDetails::new(None, NO_RESPONSE_KIND, "handler returned no response"),
                request_ns: None,
                request_id: None,
            }),
            Err(e) => Message::Error(ErrorMessage {
                service_id: Some(service_id),
                error: ErrorDetails::from(&e),
                request_ns: None,
                request_id: None,
            }),
        };
        if let Some(request_id) = request_id {
            response.set_request_id(request_id);
        }

        let payload = match response.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize router response");
                return;
            }
        };

        let mut reply: ZmqMessage = match envelope.first() {
            Some(first) => ZmqMessage::from(first.clone()),
            None => return,
        };
        for frame in envelope.iter().skip(1) {
            reply.push_back(frame.clone());
        }
        reply.push_back(Bytes::from(payload.into_bytes()));

        let _ = replies_tx.send(reply).await;
    });
}
