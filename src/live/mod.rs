//! Live session module for realtime multimodal conversations
//!
//! This module owns the WebSocket session to the generative live endpoint:
//! framing outbound user/tool/media messages, decoding inbound server
//! messages and dispatching them as typed events.
//!
//! # Architecture
//!
//! ```text
//! AudioRecorder ──▶ send_realtime_input ──▶ SessionClient ──▶ WebSocket
//!                                               │
//!                  WebSocket ──▶ decode ──▶ EventEmitter
//!                                               │
//!                       ┌───────────┬───────────┼────────────┐
//!                       ▼           ▼           ▼            ▼
//!                 audio (player)  content   toolcall    interrupted
//! ```
//!
//! # Retry Strategy
//!
//! `connect()` makes a bounded number of attempts (default 3) with a fixed
//! delay between them (default 1s). Each attempt opens a fresh socket.
//! Mid-session disconnects are surfaced as `close` events, never retried.

mod client;
mod events;
mod protocol;
mod transport;

pub use client::{parse_close_reason, ClientOptions, ConnectionState, SessionClient};
pub use events::{ClientEvent, CloseInfo, EventEmitter, EventKind, ListenerId};
pub use protocol::{
    decode, encode, partition_parts, Blob, ClientContent, Content, FunctionCall,
    FunctionDeclaration, FunctionResponse, GenerationConfig, IncomingMessage, LiveConfig,
    MediaChunk, Modality, OutgoingMessage, Part, RealtimeInput, ServerContent, SetupComplete,
    SpeechConfig, Tool, ToolCall, ToolCallCancellation, ToolResponse, UnmatchedMessage,
    UnmatchedReason, AUDIO_PCM_MIME_PREFIX, DEFAULT_MODEL, LIVE_API_URL,
};
pub use transport::{Connector, OutboundFrame, SocketHandle, TransportEvent, WebSocketConnector};

/// Session client backed by a real WebSocket
pub type LiveClient = SessionClient<WebSocketConnector>;

/// Errors that can occur during a live session
#[derive(Debug, Clone, PartialEq)]
pub enum LiveError {
    /// API key not configured
    MissingApiKey,
    /// `connect` or `reconnect` invoked without a session config
    MissingConfig,
    /// Failed to establish the WebSocket connection (after all attempts)
    ConnectionFailed(String),
    /// A send was attempted while no socket is open
    NotConnected,
    /// The socket refused an outbound frame
    SendFailed(String),
    /// An outbound message could not be serialized
    Encode(String),
}

impl std::fmt::Display for LiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            LiveError::MissingConfig => {
                write!(f, "No session config: call connect(config) first")
            }
            LiveError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to live endpoint: {}", e)
            }
            LiveError::NotConnected => write!(f, "WebSocket is not connected"),
            LiveError::SendFailed(e) => write!(f, "Failed to send frame: {}", e),
            LiveError::Encode(e) => write!(f, "Failed to encode message: {}", e),
        }
    }
}

impl std::error::Error for LiveError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_error_display() {
        let err = LiveError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = LiveError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = LiveError::NotConnected;
        assert!(err.to_string().contains("not connected"));
    }
}
