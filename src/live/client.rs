//! Live session client
//!
//! Owns the socket lifecycle for one session and dispatches inbound frames
//! as typed events.
//!
//! # Connection Flow
//!
//! 1. `connect(config)` - Store config, open a socket (with retries), send `setup`
//! 2. `send()` / `send_realtime_input()` / `send_tool_response()` - Queue frames
//! 3. Inbound frames are decoded and emitted to listeners registered with `on()`
//! 4. `disconnect()` - Close the socket; the stored config is kept for `reconnect()`
//!
//! # States
//!
//! `Idle → Connecting → Open → Closing → Closed`, and `Closed → Connecting`
//! on reconnect. At most one socket is associated with the client at a time;
//! connecting again tears the previous socket down first.
//!
//! Every socket gets an id. Inbound frames and close notifications from a
//! socket that is no longer the active one are dropped, because a close can
//! race a frame that was already in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::logs::{LogMessage, LogSink, StreamingLog, DEFAULT_LOG_CAPACITY};

use super::events::{ClientEvent, CloseInfo, EventEmitter, EventKind, ListenerId};
use super::protocol::{
    decode, encode, partition_parts, Content, FunctionResponse, IncomingMessage, LiveConfig,
    MediaChunk, OutgoingMessage, Part, RealtimeInput, ServerContent,
};
use super::transport::{Connector, OutboundFrame, SocketHandle, TransportEvent};
use super::LiveError;

/// Maximum handshake attempts per `connect()`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Fixed delay between handshake attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Marker the server puts in front of the cause inside a close reason.
///
/// Undocumented server convention, not a protocol guarantee.
const ERROR_PRELUDE: &str = "ERROR]";

/// Longest raw frame excerpt written to the debug log for unmatched messages
const UNMATCHED_EXCERPT_LEN: usize = 200;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Session client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Full socket URL, credential included
    pub url: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Capacity of the in-memory audit log
    pub log_capacity: usize,
}

impl ClientOptions {
    /// Options for `endpoint`, with the API key appended as the `key` query parameter
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", endpoint, api_key),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Extract the human-readable cause from a server close reason.
///
/// Reasons mentioning an error may carry the cause after an `ERROR]` marker
/// (`"... [ERROR] Quota exceeded"`); the text after the marker and one
/// separator character is returned. Anything else passes through unchanged.
pub fn parse_close_reason(reason: &str) -> String {
    if reason.to_lowercase().contains("error") {
        if let Some(index) = reason.find(ERROR_PRELUDE) {
            if index > 0 {
                let mut rest = reason[index + ERROR_PRELUDE.len()..].chars();
                rest.next();
                return rest.as_str().to_string();
            }
        }
    }
    reason.to_string()
}

struct ActiveSocket {
    id: u64,
    outgoing: mpsc::UnboundedSender<OutboundFrame>,
    reader: Option<JoinHandle<()>>,
}

/// Ask the socket to close and stop reading from it
fn release(socket: ActiveSocket) {
    let _ = socket.outgoing.send(OutboundFrame::Close);
    if let Some(reader) = socket.reader {
        reader.abort();
    }
}

struct SessionState {
    state: ConnectionState,
    config: Option<LiveConfig>,
    socket: Option<ActiveSocket>,
    next_socket_id: u64,
}

struct Shared<C> {
    session_id: Uuid,
    options: ClientOptions,
    connector: C,
    session: Mutex<SessionState>,
    emitter: EventEmitter,
    logs: Mutex<LogSink>,
}

/// Handle to a live session. Clones share the same session.
pub struct SessionClient<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for SessionClient<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> SessionClient<C> {
    pub fn new(connector: C, options: ClientOptions) -> Self {
        let logs = LogSink::new(options.log_capacity);
        Self {
            shared: Arc::new(Shared {
                session_id: Uuid::new_v4(),
                options,
                connector,
                session: Mutex::new(SessionState {
                    state: ConnectionState::Idle,
                    config: None,
                    socket: None,
                    next_socket_id: 0,
                }),
                emitter: EventEmitter::new(),
                logs: Mutex::new(logs),
            }),
        }
    }

    /// Register an event listener
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.emitter.on(kind, listener)
    }

    /// Remove an event listener. Returns false if it was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.emitter.off(id)
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock_session().state
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_session().socket.is_some()
    }

    /// Config sent with the most recent `setup`
    pub fn config(&self) -> Option<LiveConfig> {
        self.shared.lock_session().config.clone()
    }

    /// Snapshot of the audit log, oldest first
    pub fn logs(&self) -> Vec<StreamingLog> {
        self.shared.lock_logs().entries().cloned().collect()
    }

    pub fn clear_logs(&self) {
        self.shared.lock_logs().clear();
    }

    /// Store `config` and open a socket, sending `setup` first.
    ///
    /// Any existing socket is torn down before the first attempt, and again
    /// if an overlapping call installed one while this call was connecting.
    pub async fn connect(&self, config: LiveConfig) -> Result<(), LiveError> {
        self.shared.lock_session().config = Some(config);
        self.reconnect().await
    }

    /// Open a socket using the config stored by the last `connect()`
    pub async fn reconnect(&self) -> Result<(), LiveError> {
        let config = self.config().ok_or(LiveError::MissingConfig)?;

        self.disconnect();
        self.shared.set_state(ConnectionState::Connecting);

        let options = &self.shared.options;
        let mut last_error = None;

        for attempt in 0..options.max_attempts {
            if attempt > 0 {
                log::info!(
                    "LiveClient: retrying connection in {:?} (attempt {}/{})",
                    options.retry_delay,
                    attempt + 1,
                    options.max_attempts
                );
                tokio::time::sleep(options.retry_delay).await;
            }

            let result = match self.shared.connector.connect(&options.url).await {
                Ok(socket) => self.shared.install(socket, &config),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    log::info!(
                        "LiveClient: session {} open (attempt {})",
                        self.shared.session_id,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("LiveClient: connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        Err(last_error
            .unwrap_or_else(|| LiveError::ConnectionFailed("Max retries exceeded".to_string())))
    }

    /// Close the active socket.
    ///
    /// Returns false (and emits nothing) when no socket is open.
    pub fn disconnect(&self) -> bool {
        self.shared.disconnect()
    }

    /// Send parts as one user turn
    pub fn send(&self, parts: Vec<Part>, turn_complete: bool) -> Result<(), LiveError> {
        let message = OutgoingMessage::user_turn(parts, turn_complete);
        self.shared.send_message(&message)?;
        self.shared.log("client.send", LogMessage::json(&message));
        Ok(())
    }

    /// Send a complete text turn
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), LiveError> {
        self.send(vec![Part::text(text)], true)
    }

    /// Stream media chunks (microphone audio, grabbed frames)
    pub fn send_realtime_input(&self, chunks: Vec<MediaChunk>) -> Result<(), LiveError> {
        let input = RealtimeInput {
            media_chunks: chunks,
        };
        let label = input.label();
        self.shared
            .send_message(&OutgoingMessage::RealtimeInput(input))?;
        self.shared.log("client.realtimeInput", LogMessage::text(label));
        Ok(())
    }

    /// Answer tool calls
    pub fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<(), LiveError> {
        let message = OutgoingMessage::tool_response(responses);
        self.shared.send_message(&message)?;
        self.shared
            .log("client.toolResponse", LogMessage::json(&message));
        Ok(())
    }
}

impl<C: Connector> Shared<C> {
    fn lock_session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_logs(&self) -> MutexGuard<'_, LogSink> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock_session().state = state;
    }

    fn is_active(&self, socket_id: u64) -> bool {
        matches!(&self.lock_session().socket, Some(socket) if socket.id == socket_id)
    }

    /// Append to the audit log and surface it as a `log` event
    fn log(&self, kind: &str, message: LogMessage) {
        let entry = self.lock_logs().push(StreamingLog::new(kind, message)).clone();
        self.emitter.emit(&ClientEvent::Log(entry));
    }

    /// Emit an inbound event if `socket_id` is still active
    fn dispatch(&self, socket_id: u64, event: ClientEvent) -> bool {
        if !self.is_active(socket_id) {
            log::debug!(
                "LiveClient: dropping {} from inactive socket {}",
                event.kind().as_str(),
                socket_id
            );
            return false;
        }
        self.emitter.emit(&event);
        true
    }

    /// Make a freshly opened socket the active one and send `setup` on it
    fn install(self: &Arc<Self>, socket: SocketHandle, config: &LiveConfig) -> Result<(), LiveError> {
        let SocketHandle { outgoing, incoming } = socket;
        let setup = encode(&OutgoingMessage::Setup(config.clone()))?;

        let (socket_id, previous) = {
            let mut session = self.lock_session();
            outgoing
                .send(OutboundFrame::Text(setup))
                .map_err(|_| LiveError::ConnectionFailed("Socket closed before setup".to_string()))?;

            let socket_id = session.next_socket_id;
            session.next_socket_id += 1;
            // An overlapping connect may have installed a socket since our disconnect.
            let previous = session.socket.replace(ActiveSocket {
                id: socket_id,
                outgoing,
                reader: None,
            });
            session.state = ConnectionState::Open;
            (socket_id, previous)
        };

        if let Some(previous) = previous {
            log::info!("LiveClient: replacing socket {}", previous.id);
            release(previous);
            self.announce_close();
        }

        self.log("client.open", LogMessage::text("connected to socket"));
        self.emitter.emit(&ClientEvent::Open);
        self.log("client.send", LogMessage::text("setup"));

        let reader = tokio::spawn(read_loop(Arc::downgrade(self), socket_id, incoming));

        let mut session = self.lock_session();
        match session.socket.as_mut() {
            Some(active) if active.id == socket_id => active.reader = Some(reader),
            // An `open` listener already disconnected
            _ => reader.abort(),
        }
        Ok(())
    }

    fn disconnect(&self) -> bool {
        let socket = {
            let mut session = self.lock_session();
            let Some(socket) = session.socket.take() else {
                return false;
            };
            session.state = ConnectionState::Closing;
            socket
        };

        release(socket);
        self.set_state(ConnectionState::Closed);

        log::info!("LiveClient: disconnected");
        self.announce_close();
        true
    }

    /// Log and emit a client-initiated close
    fn announce_close(&self) {
        self.log("client.close", LogMessage::text("Disconnected"));
        self.emitter.emit(&ClientEvent::Close(CloseInfo::default()));
    }

    fn send_message(&self, message: &OutgoingMessage) -> Result<(), LiveError> {
        let session = self.lock_session();
        let socket = session.socket.as_ref().ok_or(LiveError::NotConnected)?;
        let frame = encode(message)?;
        socket
            .outgoing
            .send(OutboundFrame::Text(frame))
            .map_err(|e| LiveError::SendFailed(e.to_string()))
    }

    /// Socket closed underneath us
    fn handle_close(&self, socket_id: u64, code: Option<u16>, reason: &str) {
        {
            let mut session = self.lock_session();
            match &session.socket {
                Some(socket) if socket.id == socket_id => {}
                _ => return,
            }
            session.socket = None;
            session.state = ConnectionState::Closed;
        }

        let reason = parse_close_reason(reason);
        let message = if reason.is_empty() {
            "disconnected".to_string()
        } else {
            format!("disconnected with reason: {}", reason)
        };
        log::info!("LiveClient: {}", message);
        self.log("server.close", LogMessage::Text(message));
        self.emitter
            .emit(&ClientEvent::Close(CloseInfo { code, reason }));
    }

    fn receive(&self, socket_id: u64, frame: &[u8]) {
        if !self.is_active(socket_id) {
            log::debug!("LiveClient: dropping frame from inactive socket {}", socket_id);
            return;
        }

        let message = match decode(frame) {
            Ok(message) => message,
            Err(unmatched) => {
                let excerpt: String = unmatched.raw.chars().take(UNMATCHED_EXCERPT_LEN).collect();
                log::warn!("LiveClient: received unmatched message: {}", unmatched);
                log::debug!("LiveClient: unmatched frame: {}", excerpt);
                return;
            }
        };

        match message {
            IncomingMessage::ToolCall(call) => {
                self.log(
                    "server.toolCall",
                    LogMessage::json(&IncomingMessage::ToolCall(call.clone())),
                );
                self.dispatch(socket_id, ClientEvent::ToolCall(call));
            }
            IncomingMessage::ToolCallCancellation(cancellation) => {
                self.log(
                    "server.toolCallCancellation",
                    LogMessage::json(&IncomingMessage::ToolCallCancellation(cancellation.clone())),
                );
                self.dispatch(socket_id, cancellation.into());
            }
            IncomingMessage::SetupComplete(_) => {
                self.log("server.setupComplete", LogMessage::text("setupComplete"));
                self.dispatch(socket_id, ClientEvent::SetupComplete);
            }
            IncomingMessage::ServerContent(content) => self.receive_content(socket_id, content),
        }
    }

    /// interrupted → turncomplete → model turn (audio parts, then batched content)
    fn receive_content(&self, socket_id: u64, content: ServerContent) {
        if content.is_interrupted() {
            self.log("server.interrupted", LogMessage::text("interrupted"));
            self.dispatch(socket_id, ClientEvent::Interrupted);
            return;
        }

        if content.is_turn_complete() {
            self.log("server.turnComplete", LogMessage::text("turnComplete"));
            if !self.dispatch(socket_id, ClientEvent::TurnComplete) {
                return;
            }
        }

        let Some(turn) = content.model_turn else {
            return;
        };

        let (audio_parts, other_parts) = partition_parts(turn.parts);

        for part in &audio_parts {
            let Some(blob) = part.inline_data() else {
                continue;
            };
            match blob.decode_data() {
                Ok(bytes) => {
                    let len = bytes.len();
                    if !self.dispatch(socket_id, ClientEvent::Audio(bytes)) {
                        return;
                    }
                    self.log("server.audio", LogMessage::Text(format!("buffer ({})", len)));
                }
                Err(e) => log::warn!("LiveClient: dropping undecodable audio part: {}", e),
            }
        }

        if other_parts.is_empty() {
            return;
        }

        let content = ServerContent {
            model_turn: Some(Content {
                role: turn.role,
                parts: other_parts,
            }),
            ..Default::default()
        };
        if self.dispatch(socket_id, ClientEvent::Content(content.clone())) {
            self.log(
                "server.content",
                LogMessage::json(&IncomingMessage::ServerContent(content)),
            );
        }
    }
}

async fn read_loop<C: Connector>(
    weak: Weak<Shared<C>>,
    socket_id: u64,
    mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = incoming.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(frame) => shared.receive(socket_id, &frame),
            TransportEvent::Closed { code, reason } => {
                shared.handle_close(socket_id, code, &reason);
                return;
            }
        }
    }

    // Transport dropped without a close notification
    if let Some(shared) = weak.upgrade() {
        shared.handle_close(socket_id, None, "");
    }
}
