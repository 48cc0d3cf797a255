//! Message fabric integration tests: every client pattern through a live
//! broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aiperf::comms::{DealerClient, ProxyBroker, PubClient, PullClient, PushClient, RouterClient, SubClient};
use aiperf::config::CommsConfig;
use aiperf::error::AiperfError;
use aiperf::messages::{
    ConversationTurnRequest, ConversationTurnResponse, CreditDrop, HeartbeatMessage, Message,
    ServiceState, ServiceType,
};
use aiperf::models::credit::CreditPhase;
use aiperf::models::dataset::Turn;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fresh IPC endpoints plus a running broker.
async fn start_broker() -> (CommsConfig, CancellationToken) {
    let dir = std::env::temp_dir().join(format!("aiperf-test-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).expect("create ipc dir");
    let comms = CommsConfig::ipc(dir.to_str().unwrap());

    let cancel = CancellationToken::new();
    let broker = ProxyBroker::new(comms.clone(), cancel.child_token());
    tokio::spawn(async move {
        broker.run().await.expect("broker run");
    });
    // Give the broker a moment to bind everything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (comms, cancel)
}

fn heartbeat(service_id: &str) -> Message {
    Message::Heartbeat(HeartbeatMessage {
        service_id: service_id.to_string(),
        service_type: ServiceType::Worker,
        state: ServiceState::Running,
        request_ns: Some(1),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pub_sub_delivers_to_matching_subscribers() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (comms, cancel) = start_broker().await;

        let subscriber = SubClient::connect(
            &comms.pubsub_backend,
            "listener-1",
            ServiceType::SystemController,
            cancel.child_token(),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe(
                "heartbeat",
                Arc::new(move |message| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(message);
                    })
                }),
            )
            .await
            .unwrap();

        let publisher = PubClient::connect(&comms.pubsub_frontend, cancel.child_token())
            .await
            .unwrap();
        // Publish until the subscriber sees a message: the SUB connection
        // may still be settling when the first publish goes out.
        let received = loop {
            publisher.publish(&heartbeat("worker-9")).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(message)) => break message,
                _ => continue,
            }
        };

        match received {
            Message::Heartbeat(m) => assert_eq!(m.service_id, "worker-9"),
            other => panic!("unexpected message {other:?}"),
        }
        cancel.cancel();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_pull_balances_each_message_to_one_consumer() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (comms, cancel) = start_broker().await;

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, u64)>();
        let mut pulls = Vec::new();
        for consumer in 0..2usize {
            let pull = PullClient::connect(
                &comms.credit_drop.backend,
                8,
                cancel.child_token(),
            )
            .await
            .unwrap();
            let tx = tx.clone();
            pull.register_pull_callback(
                "credit_drop",
                Arc::new(move |message| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        if let Message::CreditDrop(drop) = message {
                            let _ = tx.send((consumer, drop.credit_num));
                        }
                    })
                }),
            )
            .unwrap();
            pull.start().await.unwrap();
            pulls.push(pull);
        }
        drop(tx);

        let push = PushClient::connect(&comms.credit_drop.frontend, cancel.child_token())
            .await
            .unwrap();
        // Let the pull connections finish registering with the broker.
        tokio::time::sleep(Duration::from_millis(200)).await;

        const TOTAL: u64 = 20;
        for credit_num in 0..TOTAL {
            push.push(&Message::CreditDrop(CreditDrop {
                id: format!("credit-{credit_num}"),
                phase: CreditPhase::Profiling,
                credit_num,
                conversation_id: None,
                credit_drop_ns: None,
                cancel_after_ns: 0,
            }))
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < TOTAL as usize {
            let (consumer, credit_num) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("pull delivery timed out")
                .expect("channel closed");
            seen.push((consumer, credit_num));
        }

        // Every message was delivered exactly once.
        let mut nums: Vec<u64> = seen.iter().map(|(_, n)| *n).collect();
        nums.sort();
        assert_eq!(nums, (0..TOTAL).collect::<Vec<_>>());
        cancel.cancel();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dealer_router_round_trip_correlates_by_request_id() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (comms, cancel) = start_broker().await;

        let router = RouterClient::connect(&comms.dealer_backend, "dataset-1", cancel.child_token())
            .await
            .unwrap();
        router
            .register_request_handler(
                "conversation_turn_request",
                Arc::new(|message| {
                    Box::pin(async move {
                        let Message::ConversationTurnRequest(request) = message else {
                            return Ok(None);
                        };
                        Ok(Some(Message::ConversationTurnResponse(
                            ConversationTurnResponse {
                                conversation_id: request
                                    .conversation_id
                                    .unwrap_or_else(|| "anon".into()),
                                turn_index: request.turn_index,
                                turn: Turn::default(),
                                request_id: None,
                            },
                        )))
                    })
                }),
            )
            .unwrap();
        router.start().await.unwrap();

        let dealer = DealerClient::connect(
            &comms.dealer_frontend,
            Duration::from_secs(5),
            cancel.child_token(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = dealer
            .request(
                Message::ConversationTurnRequest(ConversationTurnRequest {
                    service_id: "worker-1".into(),
                    conversation_id: Some("conv-7".into()),
                    turn_index: 3,
                    request_id: "req-abc".into(),
                    request_ns: None,
                }),
                None,
            )
            .await
            .unwrap();

        match response {
            Message::ConversationTurnResponse(r) => {
                assert_eq!(r.conversation_id, "conv-7");
                assert_eq!(r.turn_index, 3);
                // The router stamped the correlation id back on.
                assert_eq!(r.request_id.as_deref(), Some("req-abc"));
            }
            other => panic!("unexpected response {other:?}"),
        }
        cancel.cancel();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn router_handler_failure_returns_error_message() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (comms, cancel) = start_broker().await;

        let router = RouterClient::connect(&comms.dealer_backend, "dataset-1", cancel.child_token())
            .await
            .unwrap();
        router
            .register_request_handler(
                "conversation_turn_request",
                Arc::new(|_message| {
                    Box::pin(async move { Err(AiperfError::Config("bad turn index".into())) })
                }),
            )
            .unwrap();
        router.start().await.unwrap();

        let dealer = DealerClient::connect(
            &comms.dealer_frontend,
            Duration::from_secs(5),
            cancel.child_token(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = dealer
            .request(
                Message::ConversationTurnRequest(ConversationTurnRequest {
                    service_id: "worker-1".into(),
                    conversation_id: None,
                    turn_index: 0,
                    request_id: "req-err".into(),
                    request_ns: None,
                }),
                None,
            )
            .await
            .unwrap();

        match response {
            Message::Error(m) => {
                assert_eq!(m.error.kind, "config");
                assert!(m.error.message.contains("bad turn index"));
                assert_eq!(m.request_id.as_deref(), Some("req-err"));
            }
            other => panic!("expected error message, got {other:?}"),
        }
        cancel.cancel();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn addressed_commands_reach_only_their_target() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (comms, cancel) = start_broker().await;

        let make_listener = |service_id: &str| {
            let comms = comms.clone();
            let cancel = cancel.child_token();
            let service_id = service_id.to_string();
            async move {
                let subscriber = SubClient::connect(
                    &comms.pubsub_backend,
                    service_id.clone(),
                    ServiceType::Worker,
                    cancel,
                )
                .await
                .unwrap();
                let (tx, rx) = mpsc::unbounded_channel();
                subscriber
                    .subscribe(
                        "command",
                        Arc::new(move |message| {
                            let tx = tx.clone();
                            Box::pin(async move {
                                let _ = tx.send(message);
                            })
                        }),
                    )
                    .await
                    .unwrap();
                rx
            }
        };

        let mut rx_a = make_listener("worker-a").await;
        let mut rx_b = make_listener("worker-b").await;

        let publisher = PubClient::connect(&comms.pubsub_frontend, cancel.child_token())
            .await
            .unwrap();

        // Sync barrier: broadcast until both listeners see traffic, so
        // slow-joiner drops are behind us before the assertions below.
        let mut a_ready = false;
        let mut b_ready = false;
        while !(a_ready && b_ready) {
            publisher
                .publish(&Message::Command(
                    aiperf::messages::CommandMessage::broadcast(
                        "controller",
                        aiperf::messages::CommandKind::ProfileStart,
                    ),
                ))
                .await
                .unwrap();
            if tokio::time::timeout(Duration::from_millis(100), rx_a.recv())
                .await
                .is_ok()
            {
                a_ready = true;
            }
            if tokio::time::timeout(Duration::from_millis(100), rx_b.recv())
                .await
                .is_ok()
            {
                b_ready = true;
            }
        }
        // Drain queued broadcasts, then wait out any still in flight.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        // Addressed to worker-a: worker-b's subscription prefixes must not
        // match.
        let addressed = aiperf::messages::CommandMessage::addressed_to(
            "controller",
            aiperf::messages::CommandKind::ProfileConfigure,
            "worker-a",
        );
        publisher
            .publish(&Message::Command(addressed))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .expect("worker-a should receive")
            .unwrap();
        assert!(matches!(received, Message::Command(_)));

        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx_b.recv())
                .await
                .is_err(),
            "worker-b must not see a command addressed to worker-a"
        );

        cancel.cancel();
    })
    .await
    .expect("test timed out");
}
