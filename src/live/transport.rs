//! Socket transport for the live session
//!
//! A `Connector` performs one handshake and hands back a `SocketHandle`: a
//! pair of channels pumped by background tasks. Outbound frames are written in
//! the order they were queued. Dropping the outgoing sender closes the socket.
//!
//! ```text
//! SessionClient ──OutboundFrame──▶ writer task ──▶ WebSocket sink
//! SessionClient ◀─TransportEvent── reader task ◀── WebSocket stream
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};

use super::LiveError;

/// Default timeout for a single WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame queued for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Something that happened on the socket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One complete inbound frame (text or binary payload)
    Message(Vec<u8>),
    /// Socket closed, by the server or because of a transport error
    Closed { code: Option<u16>, reason: String },
}

/// Channels of one open socket
#[derive(Debug)]
pub struct SocketHandle {
    pub outgoing: mpsc::UnboundedSender<OutboundFrame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens sockets. Each call is one independent handshake attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<SocketHandle, LiveError>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SocketHandle, LiveError> {
        let request = url
            .into_client_request()
            .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| LiveError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| LiveError::ConnectionFailed(e.to_string()))?;

        log::debug!("WebSocketConnector: handshake complete");

        let (mut write, mut read) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            log::warn!("WebSocketConnector: send failed: {}", e);
                            break;
                        }
                    }
                    OutboundFrame::Close => break,
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("WebSocketConnector: error closing socket: {}", e);
            }
            log::debug!("WebSocketConnector: writer task exiting");
        });

        tokio::spawn(async move {
            let mut closed = TransportEvent::Closed {
                code: None,
                reason: String::new(),
            };
            while let Some(msg_result) = read.next().await {
                let event = match msg_result {
                    Ok(Message::Text(text)) => TransportEvent::Message(text.into_bytes()),
                    Ok(Message::Binary(bytes)) => TransportEvent::Message(bytes),
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            closed = TransportEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            };
                        }
                        break;
                    }
                    Err(e) => {
                        log::warn!("WebSocketConnector: socket error: {}", e);
                        closed = TransportEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        };
                        break;
                    }
                    _ => continue, // ping/pong/raw frames
                };
                if incoming_tx.send(event).is_err() {
                    log::debug!("WebSocketConnector: incoming channel closed");
                    return;
                }
            }
            let _ = incoming_tx.send(closed);
            log::debug!("WebSocketConnector: reader task exiting");
        });

        Ok(SocketHandle {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
