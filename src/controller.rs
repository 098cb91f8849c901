use crate::error::WidgetError;
use crate::identity::IdentityStore;
use crate::protocol::{
    BroadcastEvent, FinalResponse, OutboundUserMessage, SenderType, SocketInbound,
};
use crate::socket::{ConversationSocketClient, SocketEvent};
use crate::state::{ConversationState, Message, MessageStatus, Role, Route, WidgetState};
use crate::stream::{
    FeedbackVerdict, ResponseRequest, StreamObserver, StreamingResponseClient, Transcript,
    WireChatMessage,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// The streaming response service as the controller sees it. The production
/// implementation is [`StreamingResponseClient`]; tests script their own.
#[allow(async_fn_in_trait)]
pub trait ResponseTransport {
    async fn stream(
        &self,
        request: &ResponseRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<FinalResponse, WidgetError>;

    async fn history(&self, conversation_id: &str) -> Result<Transcript, WidgetError>;

    async fn feedback(
        &self,
        response_id: &str,
        verdict: FeedbackVerdict,
        comment: Option<&str>,
    ) -> Result<(), WidgetError>;
}

impl ResponseTransport for StreamingResponseClient {
    async fn stream(
        &self,
        request: &ResponseRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<FinalResponse, WidgetError> {
        self.send(request, observer).await
    }

    async fn history(&self, conversation_id: &str) -> Result<Transcript, WidgetError> {
        self.fetch_history(conversation_id).await
    }

    async fn feedback(
        &self,
        response_id: &str,
        verdict: FeedbackVerdict,
        comment: Option<&str>,
    ) -> Result<(), WidgetError> {
        self.submit_feedback(response_id, verdict, comment).await
    }
}

/// Shared handles delegate, so a transport can be held by the controller and
/// inspected elsewhere at the same time.
impl<T: ResponseTransport> ResponseTransport for Arc<T> {
    async fn stream(
        &self,
        request: &ResponseRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<FinalResponse, WidgetError> {
        (**self).stream(request, observer).await
    }

    async fn history(&self, conversation_id: &str) -> Result<Transcript, WidgetError> {
        (**self).history(conversation_id).await
    }

    async fn feedback(
        &self,
        response_id: &str,
        verdict: FeedbackVerdict,
        comment: Option<&str>,
    ) -> Result<(), WidgetError> {
        (**self).feedback(response_id, verdict, comment).await
    }
}

/// The human-handoff socket as the controller sees it.
pub trait SocketPort {
    fn connect(&self, room: &str);
    fn disconnect(&self);
    fn send(&self, data: OutboundUserMessage) -> Result<(), WidgetError>;
}

impl SocketPort for ConversationSocketClient {
    fn connect(&self, room: &str) {
        ConversationSocketClient::connect(self, room);
    }

    fn disconnect(&self) {
        ConversationSocketClient::disconnect(self);
    }

    fn send(&self, data: OutboundUserMessage) -> Result<(), WidgetError> {
        ConversationSocketClient::send(self, data)
    }
}

impl<S: SocketPort> SocketPort for Arc<S> {
    fn connect(&self, room: &str) {
        (**self).connect(room);
    }

    fn disconnect(&self) {
        (**self).disconnect();
    }

    fn send(&self, data: OutboundUserMessage) -> Result<(), WidgetError> {
        (**self).send(data)
    }
}

/// How a user message left the widget.
#[derive(Debug)]
pub enum SendOutcome {
    /// Answered by the automated agent; the transcript holds the final text.
    Answered(FinalResponse),
    /// Handed to the human agent over the socket.
    DeliveredToAgent,
    /// The stored conversation was no longer valid; the session was reset
    /// locally and the message discarded. Not an error: the caller shows a
    /// fresh conversation, nothing to retry.
    SessionReset,
}

/// Orchestrates one conversation: routes user messages between the streaming
/// HTTP transport and the handoff socket, folds transport results into
/// [`ConversationState`], and keeps the persisted identity in sync.
pub struct ChatController<T: ResponseTransport, S: SocketPort> {
    transport: T,
    socket: S,
    identity: IdentityStore,
    state: ConversationState,
    origin_url: Option<String>,
    socket_active: bool,
}

impl<T: ResponseTransport, S: SocketPort> ChatController<T, S> {
    pub fn new(
        transport: T,
        socket: S,
        identity: IdentityStore,
        initial_greeting: Option<String>,
        origin_url: Option<String>,
    ) -> Self {
        let mut state = ConversationState::new(initial_greeting);
        state.set_conversation_id(identity.conversation_id());
        Self {
            transport,
            socket,
            identity,
            state,
            origin_url,
            socket_active: false,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Send one user message, routed by the current widget state: over the
    /// socket while a human is active, otherwise as a streaming HTTP request.
    pub async fn send_message<O>(
        &mut self,
        text: &str,
        ui: &mut O,
    ) -> Result<SendOutcome, WidgetError>
    where
        O: StreamObserver + ?Sized,
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(WidgetError::Backend {
                code: "empty_message".to_string(),
                message: "message text is empty".to_string(),
            });
        }
        if self.state.widget_state() == WidgetState::Closed {
            return Err(WidgetError::Backend {
                code: "conversation_closed".to_string(),
                message: "conversation is closed".to_string(),
            });
        }

        let message_id = self.state.push_user_message(text);
        match self.state.route() {
            Route::Socket => self.send_over_socket(text, &message_id),
            Route::Http => self.run_http_turn(Some(&message_id), ui).await,
        }
    }

    /// Re-answer the last user turn. Refused once a human has taken over.
    pub async fn regenerate<O>(&mut self, ui: &mut O) -> Result<SendOutcome, WidgetError>
    where
        O: StreamObserver + ?Sized,
    {
        if !self.state.can_regenerate() {
            return Err(WidgetError::Backend {
                code: "cannot_regenerate".to_string(),
                message: "nothing to regenerate".to_string(),
            });
        }
        self.state.truncate_to_last_user();
        self.run_http_turn(None, ui).await
    }

    fn send_over_socket(
        &mut self,
        text: &str,
        message_id: &str,
    ) -> Result<SendOutcome, WidgetError> {
        let data = OutboundUserMessage {
            conversation_id: self
                .state
                .conversation_id()
                .map(str::to_string)
                .unwrap_or_default(),
            sender_type: SenderType::User,
            text: text.to_string(),
            message_id: Some(message_id.to_string()),
        };
        match self.socket.send(data) {
            Ok(()) => {
                self.state
                    .set_message_status(message_id, MessageStatus::Delivered);
                Ok(SendOutcome::DeliveredToAgent)
            }
            Err(err) => {
                self.state
                    .set_message_status(message_id, MessageStatus::Error);
                Err(err)
            }
        }
    }

    async fn run_http_turn<O>(
        &mut self,
        user_message_id: Option<&str>,
        ui: &mut O,
    ) -> Result<SendOutcome, WidgetError>
    where
        O: StreamObserver + ?Sized,
    {
        let request = ResponseRequest {
            messages: self.wire_messages(),
            conversation_id: self.state.conversation_id().map(str::to_string),
            origin_url: self.origin_url.clone(),
        };

        let mut placeholder = None;
        let result = {
            let mut observer = TurnObserver {
                state: &mut self.state,
                placeholder: &mut placeholder,
                ui,
            };
            self.transport.stream(&request, &mut observer).await
        };

        match result {
            Ok(response) => {
                self.state.finalize_assistant(placeholder.as_deref(), &response);
                self.state.apply_response_meta(&response);
                if let Some(id) = self.state.conversation_id() {
                    if let Err(err) = self.identity.set_conversation_id(id) {
                        warn!("failed to persist conversation id: {err:#}");
                    }
                }
                self.sync_socket();
                Ok(SendOutcome::Answered(response))
            }
            Err(err) if err.requires_reset() => {
                debug!("conversation invalidated by backend, resetting session");
                self.reset_session();
                Ok(SendOutcome::SessionReset)
            }
            Err(err) => {
                if let Some(id) = placeholder.as_deref() {
                    self.state.remove_message(id);
                }
                if let Some(id) = user_message_id {
                    self.state.set_message_status(id, MessageStatus::Error);
                }
                Err(err)
            }
        }
    }

    /// Replay an existing conversation from the backend, resuming its
    /// escalation state. Skipped once the user has already started typing
    /// into a fresh transcript, so a slow fetch cannot clobber live turns.
    pub async fn hydrate(&mut self) -> Result<(), WidgetError> {
        let Some(conversation_id) = self.identity.conversation_id() else {
            return Ok(());
        };
        match self.transport.history(&conversation_id).await {
            Ok(transcript) => {
                if self.state.has_user_activity() {
                    debug!("dropping stale history fetch");
                    return Ok(());
                }
                let messages = transcript
                    .messages
                    .into_iter()
                    .map(|m| Message {
                        id: m.message_id,
                        role: m.role,
                        content: m.content,
                        created_at: m.created_at,
                        status: Some(MessageStatus::Delivered),
                        citations: m.citations,
                        response_id: None,
                    })
                    .collect();
                self.state.set_transcript(messages);
                self.state
                    .set_conversation_id(Some(transcript.conversation_id));
                self.state.apply_escalation_snapshot(transcript.escalation);
                if transcript.closed {
                    self.state.close();
                }
                self.sync_socket();
                Ok(())
            }
            Err(err) if err.requires_reset() => {
                self.reset_session();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Forget the conversation and start over as AI-only. The only path out
    /// of a closed or human-handled conversation.
    pub fn reset_session(&mut self) {
        if let Err(err) = self.identity.clear_conversation() {
            warn!("failed to clear stored conversation: {err:#}");
        }
        if self.socket_active {
            self.socket.disconnect();
            self.socket_active = false;
        }
        self.state.reset();
    }

    /// Fold one socket event into conversation state. Returns the appended
    /// agent message when the event carried one, so the embedding layer can
    /// raise a notification.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> Option<Message> {
        match event {
            SocketEvent::ConnectionState(connection) => {
                self.state.set_connection_state(connection);
                None
            }
            SocketEvent::Error(message) => {
                warn!("socket error: {message}");
                self.state.set_socket_error(Some(message));
                None
            }
            SocketEvent::Inbound(SocketInbound::Command(cmd)) => {
                if cmd.status.eq_ignore_ascii_case("ok")
                    || cmd.status.eq_ignore_ascii_case("joined")
                {
                    if let Some(room) = cmd.room.as_deref() {
                        self.state.on_join_acknowledged(room);
                    }
                } else {
                    self.state.set_socket_error(cmd.message.or(cmd.code));
                }
                None
            }
            SocketEvent::Inbound(SocketInbound::Broadcast(frame)) => {
                if self
                    .state
                    .room_id()
                    .is_some_and(|room| room != frame.room_id)
                {
                    debug!(room = %frame.room_id, "ignoring broadcast for another room");
                    return None;
                }
                match frame.event {
                    BroadcastEvent::StateUpdate(payload) => {
                        self.state.on_state_update(&payload);
                        if payload.status.is_terminal() && self.socket_active {
                            self.socket.disconnect();
                            self.socket_active = false;
                        }
                        None
                    }
                    BroadcastEvent::ChatMessage(payload) => {
                        self.state.on_chat_message(&payload).cloned()
                    }
                    BroadcastEvent::Error(err) => {
                        self.state.set_socket_error(err.message.or(err.code));
                        None
                    }
                }
            }
        }
    }

    pub async fn submit_feedback(
        &self,
        response_id: &str,
        verdict: FeedbackVerdict,
        comment: Option<&str>,
    ) -> Result<(), WidgetError> {
        self.transport.feedback(response_id, verdict, comment).await
    }

    /// Bring the socket session in line with whether one is wanted.
    fn sync_socket(&mut self) {
        if self.state.socket_desired() {
            if let Some(room) = self.state.room_id() {
                self.socket.connect(&room);
                self.socket_active = true;
            }
        } else if self.socket_active {
            self.socket.disconnect();
            self.socket_active = false;
        }
    }

    /// The conversation as the backend wants it: settled turns only, latest
    /// last, human and automated answers both presented as the assistant.
    fn wire_messages(&self) -> Vec<WireChatMessage> {
        self.state
            .messages()
            .iter()
            .filter(|m| {
                !matches!(
                    m.status,
                    Some(MessageStatus::Streaming) | Some(MessageStatus::Error)
                ) && !m.content.is_empty()
            })
            .map(|m| WireChatMessage {
                role: match m.role {
                    Role::User => "user".to_string(),
                    _ => "assistant".to_string(),
                },
                content: m.content.clone(),
            })
            .collect()
    }
}

/// Observer that mirrors stream events into the transcript while they are
/// still in flight, then hands each one to the caller's observer.
struct TurnObserver<'a, O: StreamObserver + ?Sized> {
    state: &'a mut ConversationState,
    placeholder: &'a mut Option<String>,
    ui: &'a mut O,
}

impl<O: StreamObserver + ?Sized> StreamObserver for TurnObserver<'_, O> {
    fn on_meta(&mut self, meta: &crate::protocol::MetaEvent) {
        self.ui.on_meta(meta);
    }

    fn on_delta(&mut self, delta: &str, accumulated: &str) {
        let id = self.state.ensure_stream_placeholder(self.placeholder);
        self.state.append_delta(&id, delta);
        self.ui.on_delta(delta, accumulated);
    }

    fn on_control(&mut self, escalate: bool, reason: Option<&str>) {
        if escalate {
            self.state.apply_escalation_hint(reason);
        }
        self.ui.on_control(escalate, reason);
    }

    fn on_citations(&mut self, citations: &[String]) {
        let id = self.state.ensure_stream_placeholder(self.placeholder);
        self.state.set_citations(&id, citations);
        self.ui.on_citations(citations);
    }

    fn on_final(&mut self, response: &FinalResponse) {
        self.ui.on_final(response);
    }

    fn on_error(&mut self, code: &str, message: Option<&str>) {
        self.ui.on_error(code, message);
    }

    fn on_parse_error(&mut self, line: &str, reason: &str) {
        self.ui.on_parse_error(line, reason);
    }
}
