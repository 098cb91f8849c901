use crate::protocol::{
    ChatMessagePayload, ConversationStatus, Escalation, EscalationStatus, FinalResponse,
    SenderType, StateUpdatePayload,
};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Stable id for the configured greeting bubble, so hydration can tell it
/// apart from real assistant turns.
pub const INITIAL_GREETING_ID: &str = "initial-assistant";

/// Who authored a message, as rendered in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Agent,
}

/// Delivery lifecycle of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Streaming,
    Delivered,
    Error,
}

/// One transcript entry. Append-only: entries are never mutated except to
/// append streamed content or change `status`.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: Option<MessageStatus>,
    pub citations: Vec<String>,
    /// Backend identifier linking an assistant message to feedback.
    pub response_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            status: None,
            citations: Vec::new(),
            response_id: None,
        }
    }
}

/// Where the conversation stands between AI-only and human-handled.
///
/// Derived from streaming results and socket events; never assigned ad hoc
/// except via explicit reset/close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WidgetState {
    AiOnly,
    AiEscalated,
    HumanSocketConnected,
    HumanActive,
    Closed,
}

/// Coarser read-only view for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationPhase {
    BotActive,
    WaitingForAgent,
    HumanActive,
    Closed,
}

impl WidgetState {
    pub fn phase(self) -> ConversationPhase {
        match self {
            WidgetState::AiOnly => ConversationPhase::BotActive,
            WidgetState::AiEscalated | WidgetState::HumanSocketConnected => {
                ConversationPhase::WaitingForAgent
            }
            WidgetState::HumanActive => ConversationPhase::HumanActive,
            WidgetState::Closed => ConversationPhase::Closed,
        }
    }

    /// Once a human has engaged, automated routing must not silently resume.
    fn is_human_engaged(self) -> bool {
        matches!(
            self,
            WidgetState::HumanSocketConnected | WidgetState::HumanActive
        )
    }
}

/// Which transport an outgoing user message takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Streaming HTTP request to the automated agent.
    Http,
    /// Socket frame to the human agent's room.
    Socket,
}

/// Socket connection lifecycle mirrored into conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Runtime view of the socket session; exists only while one is desired.
#[derive(Debug, Clone)]
pub struct SocketRuntime {
    pub connection_state: ConnectionState,
    pub room_id: Option<String>,
    pub last_error: Option<String>,
}

impl Default for SocketRuntime {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            room_id: None,
            last_error: None,
        }
    }
}

/// Agent identity attached to the current escalation, from STATE_UPDATE.
#[derive(Debug, Clone, Default)]
pub struct AssignedAgent {
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Owned container for everything the widget core knows about one
/// conversation. Created on widget mount, destroyed on unmount; there is no
/// ambient global. Fields are mutated only through these transition methods.
#[derive(Debug)]
pub struct ConversationState {
    messages: Vec<Message>,
    conversation_id: Option<String>,
    escalation: Option<Escalation>,
    widget_state: WidgetState,
    socket: SocketRuntime,
    socket_escalation_status: Option<EscalationStatus>,
    assigned_agent: Option<AssignedAgent>,
    initial_greeting: Option<String>,
}

impl ConversationState {
    pub fn new(initial_greeting: Option<String>) -> Self {
        let mut state = Self {
            messages: Vec::new(),
            conversation_id: None,
            escalation: None,
            widget_state: WidgetState::AiOnly,
            socket: SocketRuntime::default(),
            socket_escalation_status: None,
            assigned_agent: None,
            initial_greeting,
        };
        state.seed_greeting();
        state
    }

    fn seed_greeting(&mut self) {
        if let Some(greeting) = self.initial_greeting.clone() {
            let mut message = Message::new(Role::Assistant, greeting);
            message.id = INITIAL_GREETING_ID.to_string();
            self.messages.push(message);
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation.as_ref()
    }

    pub fn widget_state(&self) -> WidgetState {
        self.widget_state
    }

    pub fn phase(&self) -> ConversationPhase {
        self.widget_state.phase()
    }

    pub fn socket(&self) -> &SocketRuntime {
        &self.socket
    }

    pub fn assigned_agent(&self) -> Option<&AssignedAgent> {
        self.assigned_agent.as_ref()
    }

    /// Latest escalation status seen over the socket, which can run ahead of
    /// what the HTTP responses report.
    pub fn socket_escalation_status(&self) -> Option<EscalationStatus> {
        self.socket_escalation_status
    }

    /// The single most important behavioral contract of the core: while a
    /// human is active, user text goes over the socket and nowhere else.
    pub fn route(&self) -> Route {
        if self.widget_state == WidgetState::HumanActive {
            Route::Socket
        } else {
            Route::Http
        }
    }

    /// A human's reply cannot be regenerated, and neither can a turn in a
    /// closed conversation.
    pub fn can_regenerate(&self) -> bool {
        !matches!(
            self.widget_state,
            WidgetState::HumanActive | WidgetState::Closed
        ) && self.messages.iter().any(|m| m.role == Role::User)
    }

    /// The socket session is wanted only once escalated with a known
    /// conversation, and never after close.
    pub fn socket_desired(&self) -> bool {
        self.escalation.is_some()
            && self.conversation_id.is_some()
            && self.widget_state != WidgetState::Closed
    }

    /// Room addressing convention for this conversation.
    pub fn room_id(&self) -> Option<String> {
        self.conversation_id
            .as_deref()
            .map(|id| format!("conversation:{id}"))
    }

    /// Whether the visitor has actually chatted (anything beyond the greeting).
    pub fn has_user_activity(&self) -> bool {
        self.messages.iter().any(|m| {
            m.role == Role::User || (m.role == Role::Assistant && m.id != INITIAL_GREETING_ID)
        })
    }

    // ---- transcript mutations ------------------------------------------

    pub fn push_user_message(&mut self, text: &str) -> String {
        let mut message = Message::new(Role::User, text);
        message.status = Some(MessageStatus::Sent);
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// Create the streaming assistant placeholder if it does not exist yet.
    pub fn ensure_stream_placeholder(&mut self, id: &mut Option<String>) -> String {
        if let Some(existing) = id {
            return existing.clone();
        }
        let mut message = Message::new(Role::Assistant, "");
        message.status = Some(MessageStatus::Streaming);
        let new_id = message.id.clone();
        self.messages.push(message);
        *id = Some(new_id.clone());
        new_id
    }

    pub fn append_delta(&mut self, id: &str, delta: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.content.push_str(delta);
        }
    }

    pub fn set_citations(&mut self, id: &str, citations: &[String]) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.citations = citations.to_vec();
        }
    }

    /// Finalize the placeholder (or append a fresh assistant message) from the
    /// authoritative final response. Keeps the stable UI id but attaches the
    /// canonical response id for feedback.
    pub fn finalize_assistant(&mut self, placeholder: Option<&str>, response: &FinalResponse) {
        let response_id = response.feedback_id().map(str::to_string);
        match placeholder.and_then(|id| self.messages.iter_mut().find(|m| m.id == id)) {
            Some(message) => {
                message.content = response.response.clone();
                message.citations = response.citations.clone();
                message.response_id = response_id;
                message.status = Some(MessageStatus::Delivered);
            }
            None => {
                let mut message = Message::new(Role::Assistant, response.response.clone());
                if let Some(id) = &response_id {
                    message.id = id.clone();
                }
                message.citations = response.citations.clone();
                message.response_id = response_id;
                message.status = Some(MessageStatus::Delivered);
                self.messages.push(message);
            }
        }
    }

    pub fn remove_message(&mut self, id: &str) {
        self.messages.retain(|m| m.id != id);
    }

    pub fn set_message_status(&mut self, id: &str, status: MessageStatus) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.status = Some(status);
        }
    }

    /// Drop trailing non-user messages so the last user turn can be answered
    /// again.
    pub fn truncate_to_last_user(&mut self) {
        while self
            .messages
            .last()
            .is_some_and(|m| m.role != Role::User)
        {
            self.messages.pop();
        }
    }

    /// Replace the transcript from a fetched history (hydration). Falls back
    /// to the greeting when the history is empty.
    pub fn set_transcript(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            self.messages.clear();
            self.seed_greeting();
        } else {
            self.messages = messages;
        }
    }

    // ---- state machine transitions -------------------------------------

    /// Fold the authoritative final response (or a history snapshot in the
    /// same envelope shape) into identity, escalation, and widget state.
    pub fn apply_response_meta(&mut self, response: &FinalResponse) {
        if let Some(conversation_id) = &response.conversation_id {
            if !conversation_id.is_empty() {
                self.conversation_id = Some(conversation_id.clone());
            }
        }

        // A closed conversation overrides everything else.
        if response.conversation_status == Some(ConversationStatus::Closed) {
            self.close();
            return;
        }

        match &response.escalation {
            Some(escalation) => {
                self.escalation = Some(escalation.clone());
                if self.widget_state == WidgetState::AiOnly {
                    self.widget_state = WidgetState::AiEscalated;
                }
            }
            None => {
                // Backend says no escalation; return to AI-only unless a
                // human is already engaged.
                if !self.widget_state.is_human_engaged()
                    && self.widget_state != WidgetState::Closed
                {
                    self.escalation = None;
                    self.widget_state = WidgetState::AiOnly;
                }
            }
        }
    }

    /// An early `control` escalation hint: show the waiting state before the
    /// final response confirms it.
    pub fn apply_escalation_hint(&mut self, reason: Option<&str>) {
        if self.escalation.is_none() {
            self.escalation = Some(Escalation {
                id: "pending".to_string(),
                status: EscalationStatus::Requested,
                reason: reason.map(str::to_string),
            });
        }
        if self.widget_state == WidgetState::AiOnly {
            self.widget_state = WidgetState::AiEscalated;
        }
    }

    /// The socket server acknowledged our join for this conversation's room.
    pub fn on_join_acknowledged(&mut self, room: &str) {
        self.socket.room_id = Some(room.to_string());
        if self.widget_state == WidgetState::AiEscalated {
            self.widget_state = WidgetState::HumanSocketConnected;
        }
    }

    /// Escalation/agent-assignment snapshot pushed over the socket.
    pub fn on_state_update(&mut self, payload: &StateUpdatePayload) {
        self.socket_escalation_status = Some(payload.status);
        self.assigned_agent = Some(AssignedAgent {
            user_id: payload.assigned_agent_user_id.clone(),
            display_name: payload.assigned_agent_display_name.clone(),
            avatar_url: payload.assigned_agent_avatar_url.clone(),
        });
        if payload.status == EscalationStatus::HumanActive
            && self.widget_state != WidgetState::Closed
        {
            self.widget_state = WidgetState::HumanActive;
        }
    }

    /// Inbound socket chat message. Returns the appended transcript entry.
    ///
    /// The widget's own user messages come back as USER echoes and are
    /// dropped (they were appended locally at send time); only an AGENT
    /// message triggers the human takeover.
    pub fn on_chat_message(&mut self, payload: &ChatMessagePayload) -> Option<&Message> {
        if payload.sender_type != SenderType::Agent {
            return None;
        }

        let mut message = Message::new(Role::Agent, payload.text.clone());
        if let Some(id) = &payload.message_id {
            message.id = id.clone();
        }
        if let Some(unix) = payload.sent_at_unix {
            if let Some(at) = Utc.timestamp_opt(unix, 0).single() {
                message.created_at = at;
            }
        }
        message.status = Some(MessageStatus::Delivered);
        self.messages.push(message);

        if self.widget_state != WidgetState::Closed {
            self.widget_state = WidgetState::HumanActive;
        }
        self.messages.last()
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.socket.connection_state = state;
    }

    pub fn set_socket_error(&mut self, error: Option<String>) {
        self.socket.last_error = error;
    }

    /// Record a hydrated conversation id (e.g. from the identity cache).
    pub fn set_conversation_id(&mut self, conversation_id: Option<String>) {
        self.conversation_id = conversation_id.filter(|id| !id.trim().is_empty());
    }

    pub fn apply_escalation_snapshot(&mut self, escalation: Option<Escalation>) {
        if let Some(escalation) = escalation {
            self.escalation = Some(escalation);
            if self.widget_state == WidgetState::AiOnly {
                self.widget_state = WidgetState::AiEscalated;
            }
        }
    }

    /// Terminal close; only an explicit reset leaves this state.
    pub fn close(&mut self) {
        self.widget_state = WidgetState::Closed;
    }

    /// Explicit reset back to a fresh AI-only conversation. The only way the
    /// machine moves backward out of a human takeover.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.conversation_id = None;
        self.escalation = None;
        self.widget_state = WidgetState::AiOnly;
        self.socket = SocketRuntime::default();
        self.socket_escalation_status = None;
        self.assigned_agent = None;
        self.seed_greeting();
    }
}
