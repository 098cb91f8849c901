use thiserror::Error;

/// Backend error code that invalidates the stored conversation identity.
pub const INVALID_CONVERSATION_CODE: &str = "invalid_conversation_id";

/// Errors surfaced by the widget core.
///
/// Every variant carries a machine-readable `code()` so calling UI code can
/// distinguish retryable transport faults from must-reset business faults
/// without matching on message strings.
#[derive(Debug, Error)]
pub enum WidgetError {
    /// HTTP request completed with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Streaming request returned no response body.
    #[error("no response body for streaming request")]
    NoResponseBody,

    /// The NDJSON stream closed before a `final` record arrived.
    #[error("stream ended before a final response event was received")]
    StreamEndedWithoutFinal,

    /// The `final` record arrived with `success: false`.
    #[error("backend reported an unsuccessful response")]
    UnsuccessfulResponse,

    /// The backend no longer recognizes the stored conversation id.
    /// Callers must clear the local session and reset to AI-only.
    #[error("conversation id is no longer valid")]
    InvalidConversation,

    /// A socket send was attempted without an open connection.
    /// No outbound queue exists; the message was not delivered.
    #[error("websocket is not connected")]
    SocketNotConnected,

    /// Websocket transport fault (handshake, close, I/O).
    #[error("websocket transport error: {0}")]
    SocketTransport(String),

    /// Underlying HTTP client fault (DNS, TLS, connection reset).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Structured error payload reported by the backend.
    #[error("{code}: {message}")]
    Backend { code: String, message: String },
}

impl WidgetError {
    /// Build an error from a backend `{error, message}` payload, mapping the
    /// invalid-conversation code to its dedicated variant.
    pub fn from_backend(code: &str, message: Option<&str>) -> Self {
        if code == INVALID_CONVERSATION_CODE {
            return WidgetError::InvalidConversation;
        }
        WidgetError::Backend {
            code: code.to_string(),
            message: message.unwrap_or("response service error").to_string(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            WidgetError::Http { .. } => "http_error",
            WidgetError::NoResponseBody => "no_response_body",
            WidgetError::StreamEndedWithoutFinal => "stream_ended_without_final",
            WidgetError::UnsuccessfulResponse => "unsuccessful_response",
            WidgetError::InvalidConversation => INVALID_CONVERSATION_CODE,
            WidgetError::SocketNotConnected => "socket_not_connected",
            WidgetError::SocketTransport(_) => "socket_transport_error",
            WidgetError::Network(_) => "network_error",
            WidgetError::Backend { code, .. } => code,
        }
    }

    /// Whether this error requires a mandatory local session reset.
    ///
    /// Continuing to reference a dead conversation id would desynchronize
    /// every subsequent request, so this is not merely surfaced to the UI.
    pub fn requires_reset(&self) -> bool {
        matches!(self, WidgetError::InvalidConversation)
    }
}
