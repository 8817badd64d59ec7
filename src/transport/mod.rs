//! Duplex connection to the remote conversation endpoint
//!
//! The engine talks to the AI service through the
//! [`DuplexConversationTransport`] trait: one persistent bidirectional
//! channel per controller, typed frames out, typed events in. The
//! concrete WebSocket adapter lives in [`realtime`].
//!
//! # Connection Contract
//!
//! `connect` performs the full handshake (channel open, session
//! negotiation, configuration ack) under one bounded timeout and tears
//! down any prior session first; a controller never holds two
//! channels. `send` on a closed channel is a logged no-op: audio frames
//! that would arrive after disconnect are inherently stale.

pub mod protocol;
pub mod realtime;

pub use protocol::{ClientFrame, ServerEvent, SessionConfig};
pub use realtime::RealtimeTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors from connection establishment and teardown.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The endpoint rejected the credentials
    AuthFailed(String),
    /// Handshake did not complete within the bounded interval
    Timeout,
    /// Channel-level failure (DNS, TLS, socket)
    NetworkFailed(String),
    /// The remote sent something the handshake cannot proceed past
    ProtocolError(String),
    /// The channel closed before the handshake finished
    Disconnected(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::AuthFailed(e) => write!(f, "Authentication failed: {}", e),
            TransportError::Timeout => write!(f, "Connection handshake timed out"),
            TransportError::NetworkFailed(e) => write!(f, "Network failure: {}", e),
            TransportError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            TransportError::Disconnected(e) => write!(f, "Connection closed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Credentials for the remote endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Read credentials from the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Option<Self> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Self::new)
    }
}

/// What an open transport delivers to its consumer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed server event, in receipt order
    Server(ServerEvent),
    /// The channel dropped outside a user-initiated disconnect
    ConnectionLost(String),
}

/// A persistent bidirectional channel to the conversation endpoint.
#[async_trait]
pub trait DuplexConversationTransport: Send + Sync {
    /// Open the duplex channel, negotiate a session, and resolve once
    /// the remote confirms. Any prior session is torn down first.
    /// Parsed events flow to `events` until disconnect.
    async fn connect(
        &self,
        credentials: &Credentials,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Transmit a typed frame. Logged no-op when the channel is not
    /// open; never an error.
    async fn send(&self, frame: ClientFrame);

    fn is_open(&self) -> bool;

    /// Close the channel, cancel pending handshake timers, and clear
    /// internal buffers. Safe on an already-closed transport.
    async fn disconnect(&self);
}
