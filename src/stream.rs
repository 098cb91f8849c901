use crate::config::WidgetConfig;
use crate::decode::{DecodedLine, NdjsonDecoder};
use crate::error::WidgetError;
use crate::identity::IdentityStore;
use crate::protocol::{
    ConversationStatus, Escalation, FinalResponse, MetaEvent, StreamEvent,
};
use crate::state::Role;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{debug, warn};

/// Header carrying the backend-issued visitor id, both directions.
pub const VISITOR_ID_HEADER: &str = "X-Visitor-Id";
/// Header identifying the tenant (the embedded chatbot) on every request.
pub const CHATBOT_ID_HEADER: &str = "X-Chatbot-Id";

const NDJSON_ACCEPT: &str = "application/x-ndjson, application/json";

/// Consumer of streaming events. All methods default to no-ops so callers
/// implement only what they render.
///
/// `on_delta` receives both the fragment and the accumulated text so far, so
/// a consumer can always render from scratch without re-deriving state.
pub trait StreamObserver {
    fn on_meta(&mut self, _meta: &MetaEvent) {}
    fn on_delta(&mut self, _delta: &str, _accumulated: &str) {}
    fn on_control(&mut self, _escalate: bool, _reason: Option<&str>) {}
    fn on_citations(&mut self, _citations: &[String]) {}
    fn on_final(&mut self, _response: &FinalResponse) {}
    fn on_error(&mut self, _code: &str, _message: Option<&str>) {}
    fn on_parse_error(&mut self, _line: &str, _reason: &str) {}
}

/// Observer that ignores every event; `send` still resolves with the final.
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

/// One turn of conversation history on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct WireChatMessage {
    pub role: String,
    pub content: String,
}

/// Input to a streaming chat request.
#[derive(Debug, Clone, Default)]
pub struct ResponseRequest {
    /// Full conversation so far, latest user turn last.
    pub messages: Vec<WireChatMessage>,
    pub conversation_id: Option<String>,
    /// URL of the page embedding the widget, if known.
    pub origin_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequestBody<'a> {
    /// The backend expects the message list as a JSON-encoded string.
    query: String,
    mode: &'static str,
    user: WireUser<'a>,
    metadata: WireMetadata<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    chatbot_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireUser<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    unique_client_id: Option<&'a str>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    origin_url: Option<&'a str>,
}

/// Canonical transcript shape, normalized from either history envelope.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub conversation_id: String,
    pub messages: Vec<TranscriptMessage>,
    pub escalation: Option<Escalation>,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub message_id: String,
    pub role: Role,
    pub content: String,
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Feedback verdict for an assistant answer.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackVerdict {
    Positive,
    Negative,
}

/// HTTP client for the streaming response service.
///
/// `send` issues one chat request and incrementally decodes the NDJSON body;
/// cancellation is dropping the returned future.
#[derive(Clone)]
pub struct StreamingResponseClient {
    http: reqwest::Client,
    base_url: String,
    tenant_id: String,
    identity: IdentityStore,
}

impl StreamingResponseClient {
    pub fn new(config: &WidgetConfig, identity: IdentityStore) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id.clone(),
            identity,
        }
    }

    /// Send a chat request and decode its NDJSON stream.
    ///
    /// Resolves only when a `final` record with `success: true` arrives. A
    /// stream that ends without one fails with `StreamEndedWithoutFinal`
    /// (or the server-reported error, when an `error` record explained it).
    pub async fn send<O: StreamObserver + ?Sized>(
        &self,
        request: &ResponseRequest,
        observer: &mut O,
    ) -> Result<FinalResponse, WidgetError> {
        let url = format!("{}/response/stream", self.base_url);
        let body = WireRequestBody {
            query: serde_json::to_string(&request.messages).unwrap_or_else(|_| "[]".to_string()),
            mode: "default",
            user: WireUser {
                unique_client_id: None,
                metadata: serde_json::Map::new(),
            },
            metadata: WireMetadata {
                origin_url: request.origin_url.as_deref(),
            },
            conversation_id: request.conversation_id.as_deref(),
            chatbot_id: &self.tenant_id,
        };

        let mut builder = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, NDJSON_ACCEPT)
            .header(CHATBOT_ID_HEADER, &self.tenant_id)
            .json(&body);
        if let Some(visitor_id) = self.identity.visitor_id() {
            builder = builder.header(VISITOR_ID_HEADER, visitor_id);
        }

        let res = builder.send().await?;

        // Persist the visitor id as soon as the server assigns it, so the
        // conversation id lands under the right key.
        if let Some(visitor_id) = res
            .headers()
            .get(VISITOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if !visitor_id.trim().is_empty() {
                if let Err(err) = self.identity.set_visitor_id(visitor_id) {
                    warn!("failed to persist visitor id: {err:#}");
                }
            }
        }

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &text));
        }

        if res.content_length() == Some(0) {
            return Err(WidgetError::NoResponseBody);
        }

        let body = Box::pin(
            res.bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(WidgetError::from)),
        );
        let mut observer = PersistVisitorId {
            inner: observer,
            identity: &self.identity,
        };
        run_stream(body, &mut observer).await
    }

    /// Fetch the full transcript of an existing conversation, normalizing the
    /// terminal-service envelope and the legacy flat envelope into one shape.
    pub async fn fetch_history(&self, conversation_id: &str) -> Result<Transcript, WidgetError> {
        let url = format!("{}/activity/history", self.base_url);
        let res = self
            .http
            .post(&url)
            .header(CHATBOT_ID_HEADER, &self.tenant_id)
            .query(&[
                ("conversationId", conversation_id),
                ("chatbotId", &self.tenant_id),
            ])
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_from_body(status.as_u16(), &text));
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
            WidgetError::Backend {
                code: "malformed_history".to_string(),
                message: err.to_string(),
            }
        })?;
        normalize_history(value)
    }

    /// Submit feedback for an assistant answer via its backend response id.
    pub async fn submit_feedback(
        &self,
        response_id: &str,
        verdict: FeedbackVerdict,
        comment: Option<&str>,
    ) -> Result<(), WidgetError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct FeedbackBody<'a> {
            response_id: &'a str,
            feedback: FeedbackVerdict,
            #[serde(skip_serializing_if = "Option::is_none")]
            comment: Option<&'a str>,
        }

        #[derive(Deserialize)]
        struct FeedbackEnvelope {
            success: bool,
            #[serde(default)]
            message: Option<String>,
        }

        let url = format!("{}/response/feedback", self.base_url);
        let res = self
            .http
            .post(&url)
            .header(CHATBOT_ID_HEADER, &self.tenant_id)
            .json(&FeedbackBody {
                response_id,
                feedback: verdict,
                comment,
            })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &text));
        }

        let envelope: FeedbackEnvelope = res.json().await?;
        if !envelope.success {
            return Err(WidgetError::Backend {
                code: "feedback_rejected".to_string(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "failed to submit feedback".to_string()),
            });
        }
        Ok(())
    }
}

/// Map an HTTP failure body to a typed error, preferring the backend's own
/// `{error, message}` payload when present.
fn error_from_body(status: u16, body: &str) -> WidgetError {
    #[derive(Deserialize)]
    struct ErrorPayload {
        error: String,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
        return WidgetError::from_backend(&payload.error, payload.message.as_deref());
    }
    WidgetError::Http {
        status,
        message: if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().to_string()
        },
    }
}

/// Decode an NDJSON byte stream into observer events and the final response.
///
/// This is the completion contract of the streaming protocol, separated from
/// HTTP so it can be driven by any byte source.
pub async fn run_stream<S, O>(mut body: S, observer: &mut O) -> Result<FinalResponse, WidgetError>
where
    S: Stream<Item = Result<Vec<u8>, WidgetError>> + Unpin,
    O: StreamObserver + ?Sized,
{
    let mut decoder = NdjsonDecoder::new();
    let mut fold = StreamFold::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for record in decoder.push(&chunk) {
            fold.apply(record, observer);
        }
    }
    for record in decoder.finish() {
        fold.apply(record, observer);
    }

    let Some(final_response) = fold.final_response else {
        // A server-reported error explains the missing final better than the
        // generic completeness fault.
        if let Some((code, message)) = fold.server_error {
            return Err(WidgetError::from_backend(&code, message.as_deref()));
        }
        return Err(WidgetError::StreamEndedWithoutFinal);
    };

    if !final_response.success {
        return Err(WidgetError::UnsuccessfulResponse);
    }
    Ok(final_response)
}

#[derive(Default)]
struct StreamFold {
    accumulated: String,
    final_response: Option<FinalResponse>,
    server_error: Option<(String, Option<String>)>,
}

impl StreamFold {
    fn apply<O: StreamObserver + ?Sized>(&mut self, record: DecodedLine, observer: &mut O) {
        match record {
            DecodedLine::Event(StreamEvent::Meta(meta)) => observer.on_meta(&meta),
            DecodedLine::Event(StreamEvent::Delta(event)) => {
                let Some(delta) = event.delta else { return };
                if delta.is_empty() {
                    return;
                }
                self.accumulated.push_str(&delta);
                observer.on_delta(&delta, &self.accumulated);
            }
            DecodedLine::Event(StreamEvent::Control(event)) => {
                observer.on_control(event.escalate.unwrap_or(false), event.reason.as_deref());
            }
            DecodedLine::Event(StreamEvent::Citations(event)) => {
                observer.on_citations(&event.citations.unwrap_or_default());
            }
            DecodedLine::Event(StreamEvent::Final(event)) => {
                let Some(response) = event.response else { return };
                observer.on_final(&response);
                self.final_response = Some(response);
            }
            DecodedLine::Event(StreamEvent::Error(event)) => {
                let code = event.error.unwrap_or_else(|| "unknown".to_string());
                observer.on_error(&code, event.message.as_deref());
                self.server_error = Some((code, event.message));
            }
            DecodedLine::LegacyFinal(response) => {
                observer.on_final(&response);
                self.final_response = Some(response);
            }
            DecodedLine::Malformed { line, reason } => {
                debug!("skipping malformed NDJSON line: {reason}");
                observer.on_parse_error(&line, &reason);
            }
        }
    }
}

/// Observer wrapper that persists `meta.visitor_id` before delegating.
struct PersistVisitorId<'a, O: StreamObserver + ?Sized> {
    inner: &'a mut O,
    identity: &'a IdentityStore,
}

impl<O: StreamObserver + ?Sized> StreamObserver for PersistVisitorId<'_, O> {
    fn on_meta(&mut self, meta: &MetaEvent) {
        if let Some(visitor_id) = meta.visitor_id.as_deref() {
            if !visitor_id.trim().is_empty() {
                if let Err(err) = self.identity.set_visitor_id(visitor_id) {
                    warn!("failed to persist visitor id: {err:#}");
                }
            }
        }
        self.inner.on_meta(meta);
    }

    fn on_delta(&mut self, delta: &str, accumulated: &str) {
        self.inner.on_delta(delta, accumulated);
    }

    fn on_control(&mut self, escalate: bool, reason: Option<&str>) {
        self.inner.on_control(escalate, reason);
    }

    fn on_citations(&mut self, citations: &[String]) {
        self.inner.on_citations(citations);
    }

    fn on_final(&mut self, response: &FinalResponse) {
        self.inner.on_final(response);
    }

    fn on_error(&mut self, code: &str, message: Option<&str>) {
        self.inner.on_error(code, message);
    }

    fn on_parse_error(&mut self, line: &str, reason: &str) {
        self.inner.on_parse_error(line, reason);
    }
}

/// Normalize either known history envelope into a `Transcript`.
fn normalize_history(value: serde_json::Value) -> Result<Transcript, WidgetError> {
    if is_terminal_envelope(&value) {
        let envelope: TerminalHistoryEnvelope =
            serde_json::from_value(value).map_err(|err| WidgetError::Backend {
                code: "malformed_history".to_string(),
                message: err.to_string(),
            })?;
        if !envelope.success {
            return Err(WidgetError::UnsuccessfulResponse);
        }
        return Ok(envelope.data.into_transcript());
    }

    let envelope: FlatHistoryEnvelope =
        serde_json::from_value(value).map_err(|err| WidgetError::Backend {
            code: "malformed_history".to_string(),
            message: err.to_string(),
        })?;
    if !envelope.success {
        return Err(WidgetError::UnsuccessfulResponse);
    }

    let closed = envelope.conversation_status == Some(ConversationStatus::Closed);
    Ok(Transcript {
        conversation_id: envelope.conversation_id.unwrap_or_default(),
        messages: envelope
            .messages
            .into_iter()
            .map(FlatHistoryMessage::into_transcript_message)
            .collect(),
        escalation: envelope.escalation,
        closed,
    })
}

fn is_terminal_envelope(value: &serde_json::Value) -> bool {
    value.get("success").is_some_and(|s| s.is_boolean())
        && value
            .get("data")
            .is_some_and(|d| d.get("conversationId").is_some_and(|c| c.is_string()))
}

#[derive(Deserialize)]
struct TerminalHistoryEnvelope {
    success: bool,
    data: TerminalHistoryData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalHistoryData {
    conversation_id: String,
    #[serde(default)]
    conversation_status: Option<String>,
    #[serde(default)]
    messages: Vec<TerminalHistoryMessage>,
    #[serde(default)]
    escalation: Option<Escalation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalHistoryMessage {
    message_id: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl TerminalHistoryData {
    fn into_transcript(self) -> Transcript {
        let closed = self
            .conversation_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("CLOSED"));
        Transcript {
            conversation_id: self.conversation_id,
            messages: self
                .messages
                .into_iter()
                .map(|m| TranscriptMessage {
                    message_id: m.message_id,
                    role: role_from_wire(m.role.as_deref()),
                    content: m.content,
                    citations: m.citations,
                    created_at: parse_timestamp(m.created_at.as_deref()),
                })
                .collect(),
            escalation: self.escalation,
            closed,
        }
    }
}

#[derive(Deserialize)]
struct FlatHistoryEnvelope {
    success: bool,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    conversation_status: Option<ConversationStatus>,
    #[serde(default)]
    messages: Vec<FlatHistoryMessage>,
    #[serde(default)]
    escalation: Option<Escalation>,
}

#[derive(Deserialize)]
struct FlatHistoryMessage {
    message_id: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl FlatHistoryMessage {
    fn into_transcript_message(self) -> TranscriptMessage {
        TranscriptMessage {
            message_id: self.message_id,
            role: role_from_wire(self.role.as_deref()),
            content: self.content,
            citations: self.citations,
            created_at: parse_timestamp(self.created_at.as_deref()),
        }
    }
}

/// Anything that is not a user turn renders as the assistant.
fn role_from_wire(role: Option<&str>) -> Role {
    match role.map(|r| r.to_ascii_lowercase()).as_deref() {
        Some("user") => Role::User,
        Some("agent") => Role::Agent,
        _ => Role::Assistant,
    }
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
