use serde::{Deserialize, Serialize};

/// One NDJSON record from the streaming response endpoint.
///
/// Records are tagged by a `type` field; unknown tags and a legacy untagged
/// final envelope are handled by the decoder, not here.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Meta(MetaEvent),
    Delta(DeltaEvent),
    Control(ControlEvent),
    Citations(CitationsEvent),
    Final(FinalEvent),
    Error(ErrorEvent),
}

/// Identifiers for the in-flight request, emitted before any content.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetaEvent {
    pub conversation_id: Option<String>,
    pub visitor_id: Option<String>,
    pub message_id: Option<String>,
    pub request_id: Option<String>,
}

/// Incremental assistant text fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaEvent {
    pub delta: Option<String>,
}

/// Early escalation hint. Not authoritative; the `final` record decides.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlEvent {
    pub escalate: Option<bool>,
    pub reason: Option<String>,
}

/// Reference strings for the answer under construction.
#[derive(Debug, Clone, Deserialize)]
pub struct CitationsEvent {
    pub citations: Option<Vec<String>>,
}

/// Carrier for the authoritative final response.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalEvent {
    pub response: Option<FinalResponse>,
}

/// Server-reported failure inside the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEvent {
    pub error: Option<String>,
    pub message: Option<String>,
}

/// The authoritative complete response, also the shape of the legacy
/// untagged final envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalResponse {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_status: Option<ConversationStatus>,
    /// Backend identifier used for feedback on this answer.
    #[serde(rename = "responseId", skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Older deployments report the feedback id here instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lead_generation: bool,
}

impl FinalResponse {
    /// The canonical id to attach feedback to, falling back to the legacy field.
    pub fn feedback_id(&self) -> Option<&str> {
        self.response_id.as_deref().or(self.message_id.as_deref())
    }
}

/// Backend-reported lifecycle of the conversation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationStatus {
    Active,
    Closed,
    #[serde(other)]
    Unknown,
}

/// A request for human takeover, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub status: EscalationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ordered escalation lattice plus terminal outcomes. Statuses the backend
/// adds later deserialize as `Unknown` rather than failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Requested,
    WaitingForAgent,
    Assigned,
    HumanActive,
    Resolved,
    Cancelled,
    TimedOut,
    #[serde(other)]
    Unknown,
}

impl EscalationStatus {
    /// Terminal statuses end the escalation; the socket session is no longer useful.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscalationStatus::Resolved | EscalationStatus::Cancelled | EscalationStatus::TimedOut
        )
    }
}

/// Who authored a socket chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenderType {
    User,
    Agent,
    #[serde(other)]
    Unknown,
}

/// Frames the widget sends to the socket server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SocketOutbound {
    Join {
        room: String,
    },
    Message {
        room: String,
        data: OutboundUserMessage,
    },
}

/// Payload of an outbound user message frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundUserMessage {
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Frames the socket server sends to the widget.
///
/// Broadcasts carry `roomId`/`eventType`/`data`; anything else with a string
/// `status` is a direct command response. Order matters for untagged
/// deserialization: command responses have no `eventType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SocketInbound {
    Broadcast(BroadcastFrame),
    Command(CommandResponse),
}

/// Direct acknowledgement of a `join` or `message` command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResponse {
    pub status: String,
    /// Assigned room id, present on a successful join.
    pub room: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Broadcast envelope addressed to every member of a room.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastFrame {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(flatten)]
    pub event: BroadcastEvent,
}

/// The broadcast payload, discriminated by `eventType`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum BroadcastEvent {
    #[serde(rename = "STATE_UPDATE")]
    StateUpdate(StateUpdatePayload),
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatMessagePayload),
    #[serde(rename = "ERROR")]
    Error(SocketErrorPayload),
}

/// Escalation / agent-assignment snapshot pushed by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdatePayload {
    pub conversation_id: String,
    pub escalation_id: String,
    pub status: EscalationStatus,
    #[serde(default)]
    pub requested_at: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub assigned_agent_user_id: Option<String>,
    #[serde(default)]
    pub assigned_agent_display_name: Option<String>,
    #[serde(default)]
    pub assigned_agent_avatar_url: Option<String>,
}

/// Human-origin message, or the echo of the widget's own user message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub conversation_id: String,
    pub sender_type: SenderType,
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sent_at_unix: Option<i64>,
}

/// Error broadcast from the socket server.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketErrorPayload {
    pub code: Option<String>,
    pub message: Option<String>,
}
