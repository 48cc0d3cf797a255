//! Dataset manager: serves conversation turns over the request/reply
//! fabric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::comms::RouterClient;
use crate::error::{AiperfError, Result};
use crate::messages::{ConversationTurnRequest, ConversationTurnResponse, Message, ServiceType};
use crate::models::dataset::{Conversation, Turn};
use crate::service::{Service, ServiceContext};

pub struct DatasetManagerService {
    inner: Arc<DatasetInner>,
    router: OnceLock<RouterClient>,
}

struct DatasetInner {
    by_session: HashMap<String, Conversation>,
    /// Flattened `(session_id, turn_index)` pairs for anonymous requests.
    all_turns: Vec<(String, u32)>,
    cursor: AtomicUsize,
}

impl DatasetManagerService {
    pub fn new(conversations: Vec<Conversation>) -> Result<Self> {
        if conversations.is_empty() || conversations.iter().all(|c| c.turns.is_empty()) {
            return Err(AiperfError::Config(
                "dataset manager requires at least one conversation with turns".to_string(),
            ));
        }

        let mut all_turns = Vec::new();
        let mut by_session = HashMap::new();
        for conversation in conversations {
            for index in 0..conversation.turns.len() {
                all_turns.push((conversation.session_id.clone(), index as u32));
            }
            by_session.insert(conversation.session_id.clone(), conversation);
        }

        Ok(Self {
            inner: Arc::new(DatasetInner {
                by_session,
                all_turns,
                cursor: AtomicUsize::new(0),
            }),
            router: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Service for DatasetManagerService {
    fn service_type(&self) -> ServiceType {
        ServiceType::DatasetManager
    }

    async fn on_init(&self, ctx: &ServiceContext) -> Result<()> {
        let router = ctx.router_client().await?;

        let inner = self.inner.clone();
        router.register_request_handler(
            "conversation_turn_request",
            Arc::new(move |message| {
                let inner = inner.clone();
                Box::pin(async move {
                    let Message::ConversationTurnRequest(request) = message else {
                        return Ok(None);
                    };
                    inner.resolve(&request).map(Some)
                })
            }),
        )?;

        self.router
            .set(router)
            .map_err(|_| AiperfError::InvalidState("dataset manager already initialized".into()))?;
        Ok(())
    }

    async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
        self.router
            .get()
            .ok_or(AiperfError::NotInitialized)?
            .start()
            .await
    }
}

impl DatasetInner {
    fn resolve(&self, request: &ConversationTurnRequest) -> Result<Message> {
        let (session_id, turn_index, turn) = match &request.conversation_id {
            Some(session_id) => {
                let conversation = self.by_session.get(session_id).ok_or_else(|| {
                    AiperfError::Config(format!("unknown conversation {session_id}"))
                })?;
                let turn = conversation
                    .turns
                    .get(request.turn_index as usize)
                    .ok_or_else(|| {
                        AiperfError::Config(format!(
                            "conversation {session_id} has no turn {}",
                            request.turn_index
                        ))
                    })?;
                (session_id.clone(), request.turn_index, turn.clone())
            }
            // Anonymous credit: round-robin across every turn in the
            // dataset.
            None => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.all_turns.len();
                let (session_id, turn_index) = &self.all_turns[slot];
                let turn: Turn = self.by_session[session_id].turns[*turn_index as usize].clone();
                (session_id.clone(), *turn_index, turn)
            }
        };

        Ok(Message::ConversationTurnResponse(ConversationTurnResponse {
            conversation_id: session_id,
            turn_index,
            turn,
            request_id: Some(request.request_id.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataset::Media;

    fn dataset() -> DatasetManagerService {
        DatasetManagerService::new(vec![
            Conversation {
                session_id: "s1".into(),
                turns: vec![
                    Turn {
                        texts: vec![Media::text("s1 t0")],
                        ..Default::default()
                    },
                    Turn {
                        texts: vec![Media::text("s1 t1")],
                        ..Default::default()
                    },
                ],
            },
            Conversation {
                session_id: "s2".into(),
                turns: vec![Turn {
                    texts: vec![Media::text("s2 t0")],
                    ..Default::default()
                }],
            },
        ])
        .unwrap()
    }

    fn request(conversation_id: Option<&str>, turn_index: u32) -> ConversationTurnRequest {
        ConversationTurnRequest {
            service_id: "worker-1".into(),
            conversation_id: conversation_id.map(str::to_string),
            turn_index,
            request_id: "req".into(),
            request_ns: None,
        }
    }

    #[test]
    fn addressed_requests_return_the_exact_turn() {
        let service = dataset();
        let response = service.inner.resolve(&request(Some("s1"), 1)).unwrap();
        match response {
            Message::ConversationTurnResponse(r) => {
                assert_eq!(r.conversation_id, "s1");
                assert_eq!(r.turn_index, 1);
                assert_eq!(r.turn.texts[0].contents[0], "s1 t1");
                assert_eq!(r.request_id.as_deref(), Some("req"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn out_of_range_turn_errors() {
        let service = dataset();
        assert!(service.inner.resolve(&request(Some("s1"), 5)).is_err());
        assert!(service.inner.resolve(&request(Some("nope"), 0)).is_err());
    }

    #[test]
    fn anonymous_requests_round_robin_all_turns() {
        let service = dataset();
        let mut seen = Vec::new();
        for _ in 0..3 {
            match service.inner.resolve(&request(None, 0)).unwrap() {
                Message::ConversationTurnResponse(r) => {
                    seen.push((r.conversation_id, r.turn_index));
                }
                other => panic!("unexpected response {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("s1".to_string(), 0),
                ("s1".to_string(), 1),
                ("s2".to_string(), 0),
            ]
        );
    }

    #[test]
    fn empty_dataset_is_rejected() {
        assert!(DatasetManagerService::new(Vec::new()).is_err());
    }
}
