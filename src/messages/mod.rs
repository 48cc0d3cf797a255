//! Inter-service message envelope.
//!
//! Every payload on the bus is a discriminated union keyed by the string tag
//! `message_type`, with command messages further routed by the nested
//! `command` tag. The serde-tagged enum is the registry: adding a variant
//! registers its constructor at compile time, and deserialization resolves
//! the concrete type in a single parse.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorDetails, Result};
use crate::models::credit::{CreditPhase, ProcessingStats};
use crate::models::dataset::Turn;
use crate::models::metric::{MetricRecord, MetricRecordMetadata, ProcessRecordsOutput};
use crate::models::record::RequestRecord;
use crate::models::telemetry::TelemetryRecord;
use crate::models::worker::WorkerHealth;

/// Error kind used when a router handler returns no response.
pub const NO_RESPONSE_KIND: &str = "no_response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    SystemController,
    TimingManager,
    DatasetManager,
    Worker,
    RecordProcessor,
    RecordsManager,
    TelemetryManager,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemController => "system_controller",
            Self::TimingManager => "timing_manager",
            Self::DatasetManager => "dataset_manager",
            Self::Worker => "worker",
            Self::RecordProcessor => "record_processor",
            Self::RecordsManager => "records_manager",
            Self::TelemetryManager => "telemetry_manager",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Nested command discriminator inside [`CommandMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    ProfileConfigure,
    ProfileStart,
    ProfileCancel,
    ProcessRecords {
        #[serde(default)]
        cancelled: bool,
    },
    Shutdown,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProfileConfigure => "profile_configure",
            Self::ProfileStart => "profile_start",
            Self::ProfileCancel => "profile_cancel",
            Self::ProcessRecords { .. } => "process_records",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponseStatus {
    Acknowledged,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    pub service_id: String,
    pub service_type: ServiceType,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub service_id: String,
    pub service_type: ServiceType,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
}

/// State-change notification, including the final `stopped` transition the
/// controller waits on during teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub service_id: String,
    pub service_type: ServiceType,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Sender of the command.
    pub service_id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub command_id: String,
    #[serde(default)]
    pub require_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_type: Option<ServiceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl CommandMessage {
    pub fn broadcast(sender: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            service_id: sender.into(),
            kind,
            command_id: Uuid::new_v4().to_string(),
            require_response: false,
            target_service_id: None,
            target_service_type: None,
            request_ns: Some(crate::clock::wall_now_ns()),
            request_id: None,
        }
    }

    pub fn addressed_to(
        sender: impl Into<String>,
        kind: CommandKind,
        target_service_id: impl Into<String>,
    ) -> Self {
        Self {
            target_service_id: Some(target_service_id.into()),
            require_response: true,
            ..Self::broadcast(sender, kind)
        }
    }

    /// The address suffix for topic routing, when this command is addressed.
    pub fn target(&self) -> Option<String> {
        self.target_service_id
            .clone()
            .or_else(|| self.target_service_type.map(|t| t.as_str().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponseMessage {
    pub service_id: String,
    pub command: String,
    pub command_id: String,
    pub status: CommandResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub error: ErrorDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One token of work authorization: "send one request now".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditDrop {
    /// Credit identity; becomes the request's X-Correlation-ID.
    pub id: String,
    pub phase: CreditPhase,
    /// Sequential number of this credit within its phase.
    pub credit_num: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Wall-clock instant the request is scheduled for; absent means ASAP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_drop_ns: Option<u64>,
    #[serde(default)]
    pub cancel_after_ns: u64,
}

/// Returned when the authorized request has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditReturn {
    pub id: String,
    pub phase: CreditPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_drop_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_ns: Option<u64>,
    /// Credit receipt to inference send, worker-internal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_inference_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseStartMessage {
    pub service_id: String,
    pub phase: CreditPhase,
    pub start_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_sec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseProgressMessage {
    pub service_id: String,
    pub phase: CreditPhase,
    pub sent: u64,
    pub completed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseSendingCompleteMessage {
    pub service_id: String,
    pub phase: CreditPhase,
    pub sent_end_ns: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPhaseCompleteMessage {
    pub service_id: String,
    pub phase: CreditPhase,
    pub end_ns: u64,
    pub completed: u64,
    #[serde(default)]
    pub was_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditsCompleteMessage {
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurnRequest {
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub turn_index: u32,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurnResponse {
    pub conversation_id: String,
    pub turn_index: u32,
    pub turn: Turn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Raw request record pushed from a worker to the record-processor pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecordMessage {
    pub worker_id: String,
    pub record: RequestRecord,
}

/// Per-record metric values pushed from a record processor to the records
/// manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecordsMessage {
    pub worker_id: String,
    pub record_processor_id: String,
    pub credit_phase: CreditPhase,
    pub results: Vec<MetricRecord>,
    pub metadata: MetricRecordMetadata,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecordsMessage {
    pub service_id: String,
    pub records: Vec<TelemetryRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryStatusMessage {
    pub service_id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub endpoints_tested: Vec<String>,
    #[serde(default)]
    pub endpoints_reachable: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordsProcessingStatsMessage {
    pub service_id: String,
    pub processing_stats: ProcessingStats,
    #[serde(default)]
    pub worker_stats: std::collections::BTreeMap<String, ProcessingStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllRecordsReceivedMessage {
    pub service_id: String,
    pub final_processing_stats: ProcessingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecordsResultMessage {
    pub service_id: String,
    pub results: ProcessRecordsOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthMessage {
    pub service_id: String,
    pub health: WorkerHealth,
}

/// The full set of bus payloads, discriminated by `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    Registration(RegistrationMessage),
    Heartbeat(HeartbeatMessage),
    Status(StatusMessage),
    Command(CommandMessage),
    CommandResponse(CommandResponseMessage),
    Error(ErrorMessage),
    CreditDrop(CreditDrop),
    CreditReturn(CreditReturn),
    CreditPhaseStart(CreditPhaseStartMessage),
    CreditPhaseProgress(CreditPhaseProgressMessage),
    CreditPhaseSendingComplete(CreditPhaseSendingCompleteMessage),
    CreditPhaseComplete(CreditPhaseCompleteMessage),
    CreditsComplete(CreditsCompleteMessage),
    ConversationTurnRequest(ConversationTurnRequest),
    ConversationTurnResponse(ConversationTurnResponse),
    RequestRecord(RequestRecordMessage),
    MetricRecords(MetricRecordsMessage),
    TelemetryRecords(TelemetryRecordsMessage),
    TelemetryStatus(TelemetryStatusMessage),
    RecordsProcessingStats(RecordsProcessingStatsMessage),
    AllRecordsReceived(AllRecordsReceivedMessage),
    ProcessRecordsResult(ProcessRecordsResultMessage),
    WorkerHealth(WorkerHealthMessage),
}

impl Message {
    /// The `message_type` discriminator, as it appears on the wire.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Registration(_) => "registration",
            Self::Heartbeat(_) => "heartbeat",
            Self::Status(_) => "status",
            Self::Command(_) => "command",
            Self::CommandResponse(_) => "command_response",
            Self::Error(_) => "error",
            Self::CreditDrop(_) => "credit_drop",
            Self::CreditReturn(_) => "credit_return",
            Self::CreditPhaseStart(_) => "credit_phase_start",
            Self::CreditPhaseProgress(_) => "credit_phase_progress",
            Self::CreditPhaseSendingComplete(_) => "credit_phase_sending_complete",
            Self::CreditPhaseComplete(_) => "credit_phase_complete",
            Self::CreditsComplete(_) => "credits_complete",
            Self::ConversationTurnRequest(_) => "conversation_turn_request",
            Self::ConversationTurnResponse(_) => "conversation_turn_response",
            Self::RequestRecord(_) => "request_record",
            Self::MetricRecords(_) => "metric_records",
            Self::TelemetryRecords(_) => "telemetry_records",
            Self::TelemetryStatus(_) => "telemetry_status",
            Self::RecordsProcessingStats(_) => "records_processing_stats",
            Self::AllRecordsReceived(_) => "all_records_received",
            Self::ProcessRecordsResult(_) => "process_records_result",
            Self::WorkerHealth(_) => "worker_health",
        }
    }

    /// Correlation id for DEALER/ROUTER request-reply matching.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Command(m) => m.request_id.as_deref(),
            Self::CommandResponse(m) => m.request_id.as_deref(),
            Self::Error(m) => m.request_id.as_deref(),
            Self::ConversationTurnRequest(m) => Some(&m.request_id),
            Self::ConversationTurnResponse(m) => m.request_id.as_deref(),
            _ => None,
        }
    }

    /// Stamp the correlation id onto a response before sending it back.
    pub fn set_request_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match self {
            Self::Command(m) => m.request_id = Some(id),
            Self::CommandResponse(m) => m.request_id = Some(id),
            Self::Error(m) => m.request_id = Some(id),
            Self::ConversationTurnRequest(m) => m.request_id = id,
            Self::ConversationTurnResponse(m) => m.request_id = Some(id),
            _ => {}
        }
    }

    /// The address suffix for topic routing, when this message is addressed.
    pub fn target(&self) -> Option<String> {
        match self {
            Self::Command(m) => m.target(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credit::CreditPhase;

    fn round_trip(message: Message) {
        let json = message.to_json().expect("serialize");
        let back = Message::from_json(&json).expect("deserialize");
        assert_eq!(back, message);
    }

    #[test]
    fn registration_round_trip() {
        round_trip(Message::Registration(RegistrationMessage {
            service_id: "worker-1".into(),
            service_type: ServiceType::Worker,
            state: ServiceState::Running,
            request_ns: Some(123),
        }));
    }

    #[test]
    fn command_round_trip_with_nested_discriminator() {
        let message = Message::Command(CommandMessage::addressed_to(
            "system_controller",
            CommandKind::ProcessRecords { cancelled: true },
            "records_manager-1",
        ));
        let json = message.to_json().unwrap();
        assert!(json.contains(r#""message_type":"command""#));
        assert!(json.contains(r#""command":"process_records""#));
        round_trip(message);
    }

    #[test]
    fn credit_drop_round_trip() {
        round_trip(Message::CreditDrop(CreditDrop {
            id: "credit-1".into(),
            phase: CreditPhase::Profiling,
            credit_num: 7,
            conversation_id: Some("conv-1".into()),
            credit_drop_ns: Some(999),
            cancel_after_ns: 0,
        }));
    }

    #[test]
    fn turn_request_carries_request_id() {
        let mut message = Message::ConversationTurnRequest(ConversationTurnRequest {
            service_id: "worker-1".into(),
            conversation_id: None,
            turn_index: 0,
            request_id: "req-1".into(),
            request_ns: None,
        });
        assert_eq!(message.request_id(), Some("req-1"));
        message.set_request_id("req-2");
        assert_eq!(message.request_id(), Some("req-2"));
        round_trip(message);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = Message::from_json(r#"{"message_type":"bogus"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn addressed_command_targets_service_id_over_type() {
        let mut cmd =
            CommandMessage::addressed_to("ctl", CommandKind::ProfileConfigure, "worker-3");
        cmd.target_service_type = Some(ServiceType::Worker);
        assert_eq!(cmd.target(), Some("worker-3".to_string()));

        cmd.target_service_id = None;
        assert_eq!(cmd.target(), Some("worker".to_string()));
    }
}
