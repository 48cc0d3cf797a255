//! Full-system runs against a mock OpenAI server: broker, controller, and
//! the whole service fleet in one process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use serde_json::{Value, json};

use aiperf::config::{
    CommsConfig, EndpointConfig, EndpointType, LoadConfig, LoadGeneratorConfig, RequestRateMode,
    ServiceConfig, UserConfig,
};
use aiperf::controller::{ProgressObserver, SystemController};
use aiperf::messages::CreditPhaseProgressMessage;
use aiperf::metrics::types;
use aiperf::models::credit::{CreditPhase, CreditPhaseConfig};
use aiperf::models::dataset::{Conversation, Media, Turn};

const TEST_TIMEOUT: Duration = Duration::from_secs(120);

async fn start_mock_server() -> String {
    async fn chat_handler(Json(body): Json<Value>) -> axum::response::Response {
        if body["stream"].as_bool().unwrap_or(false) {
            let sse = concat!(
                "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"delta\":{\"content\":\" World\"}}]}\n\n",
                "data: {\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
                "data: [DONE]\n\n",
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
        } else {
            Json(json!({
                "id": "cmpl-1",
                "object": "chat.completion",
                "created": 0,
                "model": body["model"],
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "This is a mock response."},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 8}
            }))
            .into_response()
        }
    }

    let app = axum::Router::new().route("/v1/chat/completions", post(chat_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_service_config() -> ServiceConfig {
    let dir = std::env::temp_dir().join(format!("aiperf-e2e-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).expect("create ipc dir");
    ServiceConfig {
        comms: CommsConfig::ipc(dir.to_str().unwrap()),
        heartbeat_interval_secs: 1,
        stale_threshold_secs: 10,
        progress_report_interval_secs: 1,
        registration_timeout_secs: 30,
        shutdown_grace_secs: 5,
        pull_max_concurrency: 64,
        http_timeout_secs: 30,
        dealer_timeout_secs: 5,
    }
}

fn test_user_config(base_url: &str, profiling: CreditPhaseConfig) -> UserConfig {
    let mut endpoint = EndpointConfig::new(base_url, EndpointType::Chat);
    endpoint.primary_model_name = Some("mock-model".into());
    UserConfig {
        endpoint,
        load: LoadConfig {
            warmup: None,
            profiling,
            generator: LoadGeneratorConfig::RequestRate {
                mode: RequestRateMode::ConcurrencyBurst,
                rate: None,
                seed: None,
            },
            max_concurrency: Some(2),
            cancel_after_ns: 0,
        },
        conversations: vec![Conversation {
            session_id: "conv-a".into(),
            turns: vec![Turn {
                texts: vec![Media::text("tell me about benchmarking")],
                ..Default::default()
            }],
        }],
        workers: 2,
        record_processors: 1,
        gpu_telemetry_urls: Vec::new(),
        gpu_telemetry_enabled: false,
        benchmark_grace_period: None,
    }
}

#[derive(Default)]
struct CapturingObserver {
    progress: Mutex<Vec<CreditPhaseProgressMessage>>,
}

impl ProgressObserver for CapturingObserver {
    fn on_phase_progress(&self, message: &CreditPhaseProgressMessage) {
        self.progress.lock().unwrap().push(message.clone());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn count_based_profiling_run_completes() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let base_url = start_mock_server().await;
        let user_config = test_user_config(
            &base_url,
            CreditPhaseConfig::count_based(CreditPhase::Profiling, 4),
        );
        let observer = Arc::new(CapturingObserver::default());

        let controller = SystemController::new(test_service_config(), user_config)
            .with_observer(observer.clone());
        let outcome = controller.run().await.expect("run should succeed");

        let results = outcome.results.expect("results should arrive").results;
        assert_eq!(results.completed, 4);
        assert!(!results.was_cancelled);
        assert!(results.error_summary.is_empty());

        let latency = results
            .get(types::REQUEST_LATENCY)
            .expect("request latency summarized");
        assert_eq!(latency.count, 4);
        assert!(latency.min > 0.0);

        // Server-reported usage flows through to token counts.
        let output_tokens = results
            .get(types::OUTPUT_TOKEN_COUNT)
            .expect("output token count summarized");
        assert_eq!(output_tokens.count, 4);
        assert_eq!(output_tokens.avg, 8.0);

        // The settled progress snapshot reports all credits returned.
        let progress = observer.progress.lock().unwrap();
        assert!(
            progress.iter().any(|p| p.sent == 4 && p.completed == 4),
            "expected a progress message with sent=4 completed=4, got {progress:?}"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn streaming_run_parses_sse_chunks() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let base_url = start_mock_server().await;
        let mut user_config = test_user_config(
            &base_url,
            CreditPhaseConfig::count_based(CreditPhase::Profiling, 2),
        );
        user_config.endpoint.streaming = true;

        let controller = SystemController::new(test_service_config(), user_config);
        let outcome = controller.run().await.expect("run should succeed");

        let results = outcome.results.expect("results should arrive").results;
        assert_eq!(results.completed, 2);
        assert!(results.error_summary.is_empty());

        let ttft = results
            .get(types::TIME_TO_FIRST_TOKEN)
            .expect("ttft summarized");
        assert_eq!(ttft.count, 2);

        // Usage arrives on the final chunk: two output tokens per request.
        let output_tokens = results
            .get(types::OUTPUT_TOKEN_COUNT)
            .expect("output token count summarized");
        assert_eq!(output_tokens.avg, 2.0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cancellation_yields_partial_cancelled_results() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let base_url = start_mock_server().await;
        let mut user_config = test_user_config(
            &base_url,
            CreditPhaseConfig::time_based(CreditPhase::Profiling, 60.0),
        );
        user_config.load.generator = LoadGeneratorConfig::RequestRate {
            mode: RequestRateMode::Constant,
            rate: Some(5.0),
            seed: None,
        };

        let controller = SystemController::new(test_service_config(), user_config);
        let cancel = controller.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });

        let outcome = controller.run().await.expect("cancelled runs still succeed");
        let outcome_result = Ok(outcome);

        // Exit code 0 for clean completion, cancellation included.
        assert_eq!(aiperf::exit_code(&outcome_result), 0);

        let outcome = outcome_result.expect("cancelled runs still succeed");
        let results = outcome.results.expect("partial results should arrive").results;
        assert!(results.was_cancelled);
    })
    .await
    .expect("test timed out");
}
