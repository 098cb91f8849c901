use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Source tag on every envelope the widget posts.
pub const WIDGET_SOURCE: &str = "embedchat-widget";
/// Source tag the host page uses for commands addressed to the widget.
pub const HOST_SOURCE: &str = "embedchat-host";

/// Cross-frame message envelope. The `source` tag is what keeps the widget
/// from reacting to its own messages echoed back by the host frame; the
/// loader script on the host side additionally enforces an origin check,
/// which is the authoritative security boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEnvelope {
    pub source: String,
    pub message: BridgeMessage,
}

/// Requested frame geometry for a resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
}

/// Command vocabulary for the widget/host channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// Widget booted and is ready to receive commands.
    Ready,
    /// Widget confirms its panel is visible.
    Opened,
    /// Widget confirms its panel is hidden.
    Closed,
    /// Widget asks the host to resize its iframe.
    Resize(ResizeRequest),
    /// Widget asks the host to show notification bubbles.
    Notify { messages: Vec<String> },
    /// Host asks the widget to open its panel.
    Open,
    /// Host asks the widget to close its panel.
    Close,
    /// Any command type this build does not recognize. Preserved so newer
    /// hosts never break deserialization; always ignored.
    Unknown,
}

/// Wire form of the envelope: `{source, type, payload?}`. Type mapping is
/// done by hand so an unrecognized `type` folds to `Unknown` whether or not
/// a payload rides along with it.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    source: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

impl Serialize for BridgeEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error;

        let (kind, payload) = match &self.message {
            BridgeMessage::Ready => ("widget:ready", None),
            BridgeMessage::Opened => ("widget:opened", None),
            BridgeMessage::Closed => ("widget:closed", None),
            BridgeMessage::Resize(request) => (
                "widget:resize",
                Some(serde_json::to_value(request).map_err(S::Error::custom)?),
            ),
            BridgeMessage::Notify { messages } => (
                "widget:notify",
                Some(serde_json::json!({ "messages": messages })),
            ),
            BridgeMessage::Open => ("widget:open", None),
            BridgeMessage::Close => ("widget:close", None),
            BridgeMessage::Unknown => ("widget:unknown", None),
        };
        RawEnvelope {
            source: self.source.clone(),
            kind: kind.to_string(),
            payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BridgeEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = RawEnvelope::deserialize(deserializer)?;
        let message = match raw.kind.as_str() {
            "widget:ready" => BridgeMessage::Ready,
            "widget:opened" => BridgeMessage::Opened,
            "widget:closed" => BridgeMessage::Closed,
            "widget:open" => BridgeMessage::Open,
            "widget:close" => BridgeMessage::Close,
            "widget:resize" => BridgeMessage::Resize(
                serde_json::from_value(raw.payload.unwrap_or(serde_json::Value::Null))
                    .map_err(D::Error::custom)?,
            ),
            "widget:notify" => {
                #[derive(Deserialize)]
                struct NotifyPayload {
                    #[serde(default)]
                    messages: Vec<String>,
                }
                let payload: NotifyPayload = serde_json::from_value(
                    raw.payload.unwrap_or_else(|| serde_json::json!({})),
                )
                .map_err(D::Error::custom)?;
                BridgeMessage::Notify {
                    messages: payload.messages,
                }
            }
            _ => BridgeMessage::Unknown,
        };
        Ok(BridgeEnvelope {
            source: raw.source,
            message,
        })
    }
}

/// A host command the widget should act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Open,
    Close,
}

/// Where widget envelopes go when the widget is embedded. The embedding
/// layer implements this over its actual frame boundary; tests implement it
/// over a Vec.
pub trait BridgeTransport {
    fn post(&mut self, envelope: &BridgeEnvelope);
}

/// Rate limiter for notification dispatches: at most one per cooldown
/// window, and at most `max_bubbles` messages rendered per dispatch.
#[derive(Debug)]
pub struct NotifyLimiter {
    cooldown: Duration,
    max_bubbles: usize,
    last: Option<Instant>,
}

impl NotifyLimiter {
    pub fn new(cooldown: Duration, max_bubbles: usize) -> Self {
        Self {
            cooldown,
            max_bubbles,
            last: None,
        }
    }

    pub fn max_bubbles(&self) -> usize {
        self.max_bubbles
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.last = Some(now);
        true
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }
}

/// Widget side of the cross-frame channel.
///
/// Outbound commands are wrapped in a [`BridgeEnvelope`] tagged with
/// [`WIDGET_SOURCE`]. When embedded they go out over the transport; they are
/// always mirrored to local subscribers so same-document consumers see the
/// same stream. Inbound envelopes are accepted only when tagged with
/// [`HOST_SOURCE`]. `announce_ready` fires at most once per bridge.
pub struct HostBridge<T: BridgeTransport> {
    transport: T,
    limiter: NotifyLimiter,
    embedded: bool,
    ready_sent: bool,
    local: Vec<mpsc::UnboundedSender<BridgeEnvelope>>,
}

impl<T: BridgeTransport> HostBridge<T> {
    pub fn new(transport: T, limiter: NotifyLimiter, embedded: bool) -> Self {
        Self {
            transport,
            limiter,
            embedded,
            ready_sent: false,
            local: Vec::new(),
        }
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Mirror of every outbound envelope for same-document consumers.
    pub fn subscribe_local(&mut self) -> mpsc::UnboundedReceiver<BridgeEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local.push(tx);
        rx
    }

    fn post(&mut self, message: BridgeMessage) {
        let envelope = BridgeEnvelope {
            source: WIDGET_SOURCE.to_string(),
            message,
        };
        if self.embedded {
            self.transport.post(&envelope);
        }
        self.local.retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    /// Announce the widget is ready. Idempotent.
    pub fn announce_ready(&mut self) {
        if self.ready_sent {
            return;
        }
        self.ready_sent = true;
        self.post(BridgeMessage::Ready);
    }

    pub fn confirm_opened(&mut self) {
        self.post(BridgeMessage::Opened);
    }

    pub fn confirm_closed(&mut self) {
        self.post(BridgeMessage::Closed);
    }

    pub fn request_resize(&mut self, request: ResizeRequest) {
        self.post(BridgeMessage::Resize(request));
    }

    /// Ask the host for notification bubbles, subject to rate limiting.
    /// Returns how many messages were actually dispatched.
    pub fn notify(&mut self, messages: &[String]) -> usize {
        self.notify_at(messages, Instant::now())
    }

    pub fn notify_at(&mut self, messages: &[String], now: Instant) -> usize {
        if messages.is_empty() {
            return 0;
        }
        if !self.limiter.allow_at(now) {
            debug!("notification dispatch suppressed by rate limit");
            return 0;
        }
        let capped: Vec<String> = messages
            .iter()
            .take(self.limiter.max_bubbles())
            .cloned()
            .collect();
        let count = capped.len();
        self.post(BridgeMessage::Notify { messages: capped });
        count
    }

    /// Interpret an inbound envelope. Envelopes not tagged with the host
    /// source, including the widget's own echoes, are ignored.
    pub fn accept(&self, envelope: &BridgeEnvelope) -> Option<HostCommand> {
        if envelope.source != HOST_SOURCE {
            return None;
        }
        match envelope.message {
            BridgeMessage::Open => Some(HostCommand::Open),
            BridgeMessage::Close => Some(HostCommand::Close),
            _ => None,
        }
    }
}
