//! ZeroMQ message fabric.
//!
//! Four interaction patterns, all through the broker's bound endpoints:
//! fan-out PUB/SUB, load-balanced PUSH/PULL, and async request/reply over
//! DEALER/ROUTER. Clients only ever connect; the broker is the sole binder.
//!
//! The pure-Rust `zeromq` crate exposes no socket-option knobs, so the
//! classical socket options are realized differently: every receive that must
//! observe shutdown is wrapped in a timeout, and closing a socket never
//! blocks (the crate's drop semantics match `LINGER=0`).

pub mod dealer;
pub mod proxy;
pub mod pubsub;
pub mod pushpull;
pub mod topic;

use std::time::Duration;

use zeromq::prelude::*;

use crate::error::{AiperfError, Result};

pub use dealer::{DealerClient, RouterClient};
pub use proxy::ProxyBroker;
pub use pubsub::{PubClient, SubClient};
pub use pushpull::{PullClient, PushClient};

/// Timeout applied to receive loops so cancellation is observed.
pub(crate) const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Send retry policy for publish/push failures.
pub(crate) const SEND_MAX_ATTEMPTS: u32 = 3;
pub(crate) const SEND_BACKOFF: Duration = Duration::from_millis(50);

/// Connect a client socket to a broker endpoint, retrying while the broker
/// comes up.
pub(crate) async fn connect_with_retry<S: Socket>(socket: &mut S, endpoint: &str) -> Result<()> {
    const MAX_ATTEMPTS: u32 = 50;
    const BACKOFF: Duration = Duration::from_millis(100);

    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match socket.connect(endpoint).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(endpoint, attempt, error = %e, "connect failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(BACKOFF).await;
            }
        }
    }
    Err(AiperfError::Bus {
        operation: "connect",
        message: format!(
            "{} unreachable after {} attempts: {}",
            endpoint,
            MAX_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}
