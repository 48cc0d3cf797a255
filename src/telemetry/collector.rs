//! One collector per reachable DCGM endpoint.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::error::{AiperfError, ErrorDetails, Result};
use crate::models::telemetry::TelemetryRecord;
use crate::telemetry::prometheus::parse_exposition;

/// Default scrape cadence, ~3 polls per second.
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_millis(330);

pub type RecordBatchCallback =
    Arc<dyn Fn(Vec<TelemetryRecord>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CollectorErrorCallback = Arc<dyn Fn(ErrorDetails) + Send + Sync>;

/// Polls one DCGM Prometheus endpoint on an interval and hands each batch
/// of per-GPU records to the callback. One collector failure never affects
/// the others; errors go to the error callback and polling continues.
pub struct TelemetryCollector {
    url: String,
    client: reqwest::Client,
    interval: Duration,
}

impl TelemetryCollector {
    pub fn new(url: String, interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            url,
            client,
            interval,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn run(
        self,
        on_batch: RecordBatchCallback,
        on_error: CollectorErrorCallback,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(records) if !records.is_empty() => on_batch(records).await,
                        Ok(_) => {}
                        Err(e) => on_error(ErrorDetails::from(&e)),
                    }
                }
            }
        }
        tracing::debug!(url = %self.url, "telemetry collector stopped");
    }

    async fn poll_once(&self) -> Result<Vec<TelemetryRecord>> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(AiperfError::Telemetry(format!(
                "{} returned HTTP {}",
                self.url,
                response.status().as_u16()
            )));
        }
        let body = response.text().await?;
        Ok(parse_exposition(&body, &self.url, clock::wall_now_ns()))
    }
}
