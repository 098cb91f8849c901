//! Routing and handoff behavior of `ChatController`, driven through scripted
//! transport and socket fakes.

use chrono::Utc;
use embedchat::controller::{ChatController, ResponseTransport, SendOutcome, SocketPort};
use embedchat::error::WidgetError;
use embedchat::identity::IdentityStore;
use embedchat::protocol::{
    BroadcastEvent, BroadcastFrame, ChatMessagePayload, CommandResponse, ConversationStatus,
    Escalation, EscalationStatus, FinalResponse, OutboundUserMessage, SenderType, SocketInbound,
    StateUpdatePayload,
};
use embedchat::socket::SocketEvent;
use embedchat::state::{MessageStatus, Role, WidgetState};
use embedchat::stream::{
    FeedbackVerdict, NoopObserver, ResponseRequest, StreamObserver, Transcript,
    TranscriptMessage,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Script {
    Stream {
        deltas: Vec<&'static str>,
        response: FinalResponse,
    },
    Fail(WidgetError),
}

#[derive(Default)]
struct FakeTransport {
    scripts: Mutex<VecDeque<Script>>,
    history: Mutex<Option<Result<Transcript, WidgetError>>>,
    requests: Mutex<Vec<ResponseRequest>>,
}

impl FakeTransport {
    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

impl ResponseTransport for FakeTransport {
    async fn stream(
        &self,
        request: &ResponseRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<FinalResponse, WidgetError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted stream call");
        match script {
            Script::Stream { deltas, response } => {
                let mut accumulated = String::new();
                for delta in deltas {
                    accumulated.push_str(delta);
                    observer.on_delta(delta, &accumulated);
                }
                observer.on_final(&response);
                Ok(response)
            }
            Script::Fail(err) => Err(err),
        }
    }

    async fn history(&self, _conversation_id: &str) -> Result<Transcript, WidgetError> {
        self.history
            .lock()
            .unwrap()
            .take()
            .expect("unscripted history call")
    }

    async fn feedback(
        &self,
        _response_id: &str,
        _verdict: FeedbackVerdict,
        _comment: Option<&str>,
    ) -> Result<(), WidgetError> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeSocket {
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<usize>,
    sent: Mutex<Vec<OutboundUserMessage>>,
    fail_send: Mutex<bool>,
}

impl SocketPort for FakeSocket {
    fn connect(&self, room: &str) {
        self.connects.lock().unwrap().push(room.to_string());
    }

    fn disconnect(&self) {
        *self.disconnects.lock().unwrap() += 1;
    }

    fn send(&self, data: OutboundUserMessage) -> Result<(), WidgetError> {
        if *self.fail_send.lock().unwrap() {
            return Err(WidgetError::SocketNotConnected);
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }
}

struct Harness {
    controller: ChatController<Arc<FakeTransport>, Arc<FakeSocket>>,
    transport: Arc<FakeTransport>,
    socket: Arc<FakeSocket>,
    identity: IdentityStore,
    _dir: tempfile::TempDir,
}

fn harness(greeting: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let identity = IdentityStore::with_dir(dir.path().to_path_buf(), "tenant-1");
    let transport = Arc::new(FakeTransport::default());
    let socket = Arc::new(FakeSocket::default());
    let controller = ChatController::new(
        transport.clone(),
        socket.clone(),
        identity.clone(),
        greeting.map(str::to_string),
        Some("https://customer.example".to_string()),
    );
    Harness {
        controller,
        transport,
        socket,
        identity,
        _dir: dir,
    }
}

fn answered(text: &str, conversation_id: &str) -> FinalResponse {
    FinalResponse {
        success: true,
        response: text.to_string(),
        conversation_id: Some(conversation_id.to_string()),
        ..FinalResponse::default()
    }
}

fn escalated(text: &str, conversation_id: &str) -> FinalResponse {
    FinalResponse {
        escalation: Some(Escalation {
            id: "e1".to_string(),
            status: EscalationStatus::Requested,
            reason: None,
        }),
        ..answered(text, conversation_id)
    }
}

fn join_ack(room: &str) -> SocketEvent {
    SocketEvent::Inbound(SocketInbound::Command(CommandResponse {
        status: "ok".to_string(),
        room: Some(room.to_string()),
        code: None,
        message: None,
    }))
}

fn agent_broadcast(room: &str, text: &str) -> SocketEvent {
    SocketEvent::Inbound(SocketInbound::Broadcast(BroadcastFrame {
        room_id: room.to_string(),
        event: BroadcastEvent::ChatMessage(ChatMessagePayload {
            conversation_id: "c1".to_string(),
            sender_type: SenderType::Agent,
            text: text.to_string(),
            message_id: None,
            sent_at_unix: None,
        }),
    }))
}

#[tokio::test]
async fn http_turn_streams_into_the_transcript_and_persists_identity() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec!["Our ", "policy..."],
        response: answered("Our policy...", "c1"),
    });

    let outcome = h
        .controller
        .send_message("what is your refund policy?", &mut NoopObserver)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Answered(_)));

    let messages = h.controller.state().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Our policy...");
    assert_eq!(messages[1].status, Some(MessageStatus::Delivered));

    assert_eq!(h.identity.conversation_id().as_deref(), Some("c1"));
    assert!(h.socket.connects.lock().unwrap().is_empty());

    // The wire request carried the settled transcript.
    let requests = h.transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].role, "user");
}

#[tokio::test]
async fn escalation_opens_the_socket_and_agent_takeover_switches_routing() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec!["Connecting you now."],
        response: escalated("Connecting you now.", "c1"),
    });

    h.controller
        .send_message("I need a human", &mut NoopObserver)
        .await
        .unwrap();
    assert_eq!(h.controller.state().widget_state(), WidgetState::AiEscalated);
    assert_eq!(
        h.socket.connects.lock().unwrap().as_slice(),
        ["conversation:c1".to_string()]
    );

    h.controller.handle_socket_event(join_ack("conversation:c1"));
    assert_eq!(
        h.controller.state().widget_state(),
        WidgetState::HumanSocketConnected
    );

    let appended = h
        .controller
        .handle_socket_event(agent_broadcast("conversation:c1", "Hi, Sam here"))
        .expect("agent message should be surfaced");
    assert_eq!(appended.role, Role::Agent);
    assert_eq!(h.controller.state().widget_state(), WidgetState::HumanActive);

    // The next user message must go over the socket, not HTTP.
    let outcome = h
        .controller
        .send_message("thanks!", &mut NoopObserver)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::DeliveredToAgent));
    let sent = h.socket.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "thanks!");
    assert_eq!(sent[0].conversation_id, "c1");
    assert_eq!(h.transport.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn broadcasts_for_other_rooms_are_ignored() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: escalated("ok", "c1"),
    });
    h.controller
        .send_message("human please", &mut NoopObserver)
        .await
        .unwrap();

    let appended = h
        .controller
        .handle_socket_event(agent_broadcast("conversation:other", "wrong room"));
    assert!(appended.is_none());
    assert_eq!(h.controller.state().widget_state(), WidgetState::AiEscalated);
}

#[tokio::test]
async fn invalid_conversation_resets_the_session_instead_of_erroring() {
    let mut h = harness(Some("Hello!"));
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: answered("first", "c1"),
    });
    h.controller
        .send_message("hi", &mut NoopObserver)
        .await
        .unwrap();
    assert_eq!(h.identity.conversation_id().as_deref(), Some("c1"));

    h.transport.push(Script::Fail(WidgetError::InvalidConversation));
    let outcome = h
        .controller
        .send_message("still there?", &mut NoopObserver)
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::SessionReset));

    assert!(h.identity.conversation_id().is_none());
    assert_eq!(h.controller.state().widget_state(), WidgetState::AiOnly);
    // Transcript is back to the greeting.
    assert_eq!(h.controller.state().messages().len(), 1);
    assert_eq!(h.controller.state().messages()[0].content, "Hello!");
}

#[tokio::test]
async fn transport_failure_marks_the_user_message_and_propagates() {
    let mut h = harness(None);
    h.transport.push(Script::Fail(WidgetError::Http {
        status: 503,
        message: "unavailable".to_string(),
    }));

    let err = h
        .controller
        .send_message("hi", &mut NoopObserver)
        .await
        .unwrap_err();
    assert!(matches!(err, WidgetError::Http { status: 503, .. }));

    let messages = h.controller.state().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, Some(MessageStatus::Error));
}

#[tokio::test]
async fn regenerate_is_refused_once_a_human_is_active() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: escalated("ok", "c1"),
    });
    h.controller
        .send_message("human please", &mut NoopObserver)
        .await
        .unwrap();
    h.controller
        .handle_socket_event(agent_broadcast("conversation:c1", "here"));

    let err = h.controller.regenerate(&mut NoopObserver).await.unwrap_err();
    assert_eq!(err.code(), "cannot_regenerate");
}

#[tokio::test]
async fn regenerate_is_refused_once_the_conversation_is_closed() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: FinalResponse {
            conversation_status: Some(ConversationStatus::Closed),
            ..answered("goodbye", "c1")
        },
    });
    h.controller
        .send_message("bye", &mut NoopObserver)
        .await
        .unwrap();
    assert_eq!(h.controller.state().widget_state(), WidgetState::Closed);

    let err = h.controller.regenerate(&mut NoopObserver).await.unwrap_err();
    assert_eq!(err.code(), "cannot_regenerate");
    // No second request reached the transport.
    assert_eq!(h.transport.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn regenerate_replays_the_last_user_turn() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: answered("first answer", "c1"),
    });
    h.controller
        .send_message("question", &mut NoopObserver)
        .await
        .unwrap();

    h.transport.push(Script::Stream {
        deltas: vec![],
        response: answered("second answer", "c1"),
    });
    let outcome = h.controller.regenerate(&mut NoopObserver).await.unwrap();
    assert!(matches!(outcome, SendOutcome::Answered(_)));

    let messages = h.controller.state().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "second answer");

    // The replayed request must not contain the discarded answer.
    let requests = h.transport.requests.lock().unwrap();
    assert_eq!(requests[1].messages.len(), 1);
    assert_eq!(requests[1].messages[0].content, "question");
}

#[tokio::test]
async fn hydrate_replays_history_and_resumes_the_escalation() {
    let h = harness(Some("Hello!"));
    h.identity.set_visitor_id("v1").unwrap();
    h.identity.set_conversation_id("c1").unwrap();
    let mut controller = h.controller;

    *h.transport.history.lock().unwrap() = Some(Ok(Transcript {
        conversation_id: "c1".to_string(),
        messages: vec![
            TranscriptMessage {
                message_id: "m1".to_string(),
                role: Role::User,
                content: "help".to_string(),
                citations: vec![],
                created_at: Utc::now(),
            },
            TranscriptMessage {
                message_id: "m2".to_string(),
                role: Role::Assistant,
                content: "escalating".to_string(),
                citations: vec![],
                created_at: Utc::now(),
            },
        ],
        escalation: Some(Escalation {
            id: "e1".to_string(),
            status: EscalationStatus::WaitingForAgent,
            reason: None,
        }),
        closed: false,
    }));

    controller.hydrate().await.unwrap();

    assert_eq!(controller.state().messages().len(), 2);
    assert_eq!(controller.state().widget_state(), WidgetState::AiEscalated);
    assert_eq!(
        h.socket.connects.lock().unwrap().as_slice(),
        ["conversation:c1".to_string()]
    );
}

#[tokio::test]
async fn hydrate_of_a_closed_conversation_blocks_sending() {
    let h = harness(None);
    h.identity.set_visitor_id("v1").unwrap();
    h.identity.set_conversation_id("c1").unwrap();
    let mut controller = h.controller;

    *h.transport.history.lock().unwrap() = Some(Ok(Transcript {
        conversation_id: "c1".to_string(),
        messages: vec![],
        escalation: None,
        closed: true,
    }));

    controller.hydrate().await.unwrap();
    assert_eq!(controller.state().widget_state(), WidgetState::Closed);

    let err = controller
        .send_message("hello?", &mut NoopObserver)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conversation_closed");
}

#[tokio::test]
async fn hydrate_with_invalid_conversation_resets_silently() {
    let h = harness(None);
    h.identity.set_visitor_id("v1").unwrap();
    h.identity.set_conversation_id("c1").unwrap();
    let mut controller = h.controller;

    *h.transport.history.lock().unwrap() = Some(Err(WidgetError::InvalidConversation));
    controller.hydrate().await.unwrap();

    assert!(h.identity.conversation_id().is_none());
    assert_eq!(controller.state().widget_state(), WidgetState::AiOnly);
}

#[tokio::test]
async fn stale_history_does_not_clobber_live_turns() {
    let h = harness(None);
    h.identity.set_visitor_id("v1").unwrap();
    h.identity.set_conversation_id("c1").unwrap();
    let mut controller = h.controller;

    h.transport.push(Script::Stream {
        deltas: vec![],
        response: answered("live answer", "c1"),
    });
    controller
        .send_message("live question", &mut NoopObserver)
        .await
        .unwrap();

    *h.transport.history.lock().unwrap() = Some(Ok(Transcript {
        conversation_id: "c1".to_string(),
        messages: vec![TranscriptMessage {
            message_id: "old".to_string(),
            role: Role::User,
            content: "old question".to_string(),
            citations: vec![],
            created_at: Utc::now(),
        }],
        escalation: None,
        closed: false,
    }));
    controller.hydrate().await.unwrap();

    let messages = controller.state().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "live question");
}

#[tokio::test]
async fn terminal_escalation_tears_the_socket_down_without_downgrading() {
    let mut h = harness(None);
    h.transport.push(Script::Stream {
        deltas: vec![],
        response: escalated("ok", "c1"),
    });
    h.controller
        .send_message("human please", &mut NoopObserver)
        .await
        .unwrap();
    h.controller
        .handle_socket_event(agent_broadcast("conversation:c1", "resolved it"));
    assert_eq!(h.controller.state().widget_state(), WidgetState::HumanActive);

    h.controller
        .handle_socket_event(SocketEvent::Inbound(SocketInbound::Broadcast(
            BroadcastFrame {
                room_id: "conversation:c1".to_string(),
                event: BroadcastEvent::StateUpdate(StateUpdatePayload {
                    conversation_id: "c1".to_string(),
                    escalation_id: "e1".to_string(),
                    status: EscalationStatus::Resolved,
                    requested_at: None,
                    reason: None,
                    assigned_agent_user_id: None,
                    assigned_agent_display_name: None,
                    assigned_agent_avatar_url: None,
                }),
            },
        )));

    assert_eq!(*h.socket.disconnects.lock().unwrap(), 1);
    // No automatic downgrade; only reset leaves the human state.
    assert_eq!(h.controller.state().widget_state(), WidgetState::HumanActive);
}
