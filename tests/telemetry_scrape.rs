//! Telemetry collector against a live mock DCGM exporter.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aiperf::telemetry::collector::TelemetryCollector;

const EXPOSITION: &str = concat!(
    "# HELP DCGM_FI_DEV_GPU_UTIL GPU utilization (in %).\n",
    "# TYPE DCGM_FI_DEV_GPU_UTIL gauge\n",
    "DCGM_FI_DEV_GPU_UTIL{gpu=\"0\",UUID=\"GPU-e2e\",pci_bus_id=\"00000000:02:00.0\",device=\"nvidia0\",modelName=\"NVIDIA H100\",Hostname=\"node1\"} 77\n",
    "DCGM_FI_DEV_POWER_USAGE{gpu=\"0\",UUID=\"GPU-e2e\",modelName=\"NVIDIA H100\"} 250.5\n",
    "DCGM_FI_DEV_FB_USED{gpu=\"0\",UUID=\"GPU-e2e\"} 2048\n",
);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collector_scrapes_and_batches_records() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let app = axum::Router::new().route("/metrics", get(|| async { EXPOSITION }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("http://{addr}/metrics");
        let collector =
            TelemetryCollector::new(url.clone(), Duration::from_millis(50)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let on_batch: aiperf::telemetry::collector::RecordBatchCallback = Arc::new(move |records| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(records);
            })
        });
        let on_error: aiperf::telemetry::collector::CollectorErrorCallback =
            Arc::new(|error| panic!("unexpected collector error: {error:?}"));

        tokio::spawn(collector.run(on_batch, on_error, cancel.clone()));

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first batch should arrive")
            .expect("channel open");
        cancel.cancel();

        assert_eq!(batch.len(), 1);
        let record = &batch[0];
        assert_eq!(record.gpu_uuid, "GPU-e2e");
        assert_eq!(record.gpu_index, 0);
        assert_eq!(record.dcgm_url, url);
        assert_eq!(record.gpu_model_name, "NVIDIA H100");
        assert_eq!(record.hostname.as_deref(), Some("node1"));
        assert_eq!(record.telemetry_data.gpu_utilization, Some(77.0));
        assert_eq!(record.telemetry_data.gpu_power_usage, Some(250.5));
        let memory = record.telemetry_data.gpu_memory_used.unwrap();
        assert!((memory - 2.147483648).abs() < 1e-9);
    })
    .await
    .expect("test timed out");
}
