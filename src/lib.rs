//! Transport and handoff core for an embeddable customer chat widget.
//!
//! The crate covers the plumbing under a chat bubble on a customer's site:
//! a streaming HTTP client that decodes NDJSON response events, a websocket
//! client for the human-agent handoff channel, the state machine that routes
//! user messages between the two, and the cross-frame bridge the widget uses
//! to talk to its host page.
//!
//! [`controller::ChatController`] ties the pieces together; the individual
//! clients are usable on their own.

pub mod bridge;
pub mod config;
pub mod controller;
pub mod decode;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod socket;
pub mod state;
pub mod stream;

pub use bridge::{
    BridgeEnvelope, BridgeMessage, BridgeTransport, HostBridge, HostCommand, NotifyLimiter,
    ResizeRequest,
};
pub use config::WidgetConfig;
pub use controller::{ChatController, ResponseTransport, SendOutcome, SocketPort};
pub use error::WidgetError;
pub use identity::IdentityStore;
pub use protocol::{Escalation, EscalationStatus, FinalResponse, SenderType};
pub use socket::{ConversationSocketClient, SocketEvent};
pub use state::{ConversationPhase, ConversationState, Message, Role, WidgetState};
pub use stream::{
    FeedbackVerdict, NoopObserver, ResponseRequest, StreamObserver, StreamingResponseClient,
    Transcript, WireChatMessage,
};
