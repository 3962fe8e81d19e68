//! Typed publish/subscribe registry for session events
//!
//! Listeners are registered per event kind and invoked synchronously, in
//! registration order, from whichever task dispatches the event. The registry
//! lock is released before listeners run, so a listener may subscribe,
//! unsubscribe or call back into the session client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::logs::StreamingLog;

use super::protocol::{ServerContent, ToolCall, ToolCallCancellation};

/// Details of a closed socket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseInfo {
    /// WebSocket close code, if the server sent one
    pub code: Option<u16>,
    /// Human-readable cause (already extracted from the server's close reason)
    pub reason: String,
}

/// Events surfaced to the UI collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Open,
    Close(CloseInfo),
    Log(StreamingLog),
    /// Decoded PCM16 bytes from one audio part
    Audio(Vec<u8>),
    /// Non-audio parts of a model turn, batched
    Content(ServerContent),
    Interrupted,
    SetupComplete,
    TurnComplete,
    ToolCall(ToolCall),
    ToolCallCancellation(Vec<String>),
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Open => EventKind::Open,
            ClientEvent::Close(_) => EventKind::Close,
            ClientEvent::Log(_) => EventKind::Log,
            ClientEvent::Audio(_) => EventKind::Audio,
            ClientEvent::Content(_) => EventKind::Content,
            ClientEvent::Interrupted => EventKind::Interrupted,
            ClientEvent::SetupComplete => EventKind::SetupComplete,
            ClientEvent::TurnComplete => EventKind::TurnComplete,
            ClientEvent::ToolCall(_) => EventKind::ToolCall,
            ClientEvent::ToolCallCancellation(_) => EventKind::ToolCallCancellation,
        }
    }
}

impl From<ToolCallCancellation> for ClientEvent {
    fn from(cancellation: ToolCallCancellation) -> Self {
        ClientEvent::ToolCallCancellation(cancellation.ids)
    }
}

/// Event names listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Log,
    Audio,
    Content,
    Interrupted,
    SetupComplete,
    TurnComplete,
    ToolCall,
    ToolCallCancellation,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Open,
        EventKind::Close,
        EventKind::Log,
        EventKind::Audio,
        EventKind::Content,
        EventKind::Interrupted,
        EventKind::SetupComplete,
        EventKind::TurnComplete,
        EventKind::ToolCall,
        EventKind::ToolCallCancellation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::Log => "log",
            EventKind::Audio => "audio",
            EventKind::Content => "content",
            EventKind::Interrupted => "interrupted",
            EventKind::SetupComplete => "setupcomplete",
            EventKind::TurnComplete => "turncomplete",
            EventKind::ToolCall => "toolcall",
            EventKind::ToolCallCancellation => "toolcallcancellation",
        }
    }
}

/// Handle returned by `EventEmitter::on`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

/// Registry mapping event kinds to ordered listener lists
#[derive(Default)]
pub struct EventEmitter {
    registry: Mutex<Registry>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for listeners in registry.listeners.values_mut() {
            if let Some(index) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(index);
                return true;
            }
        }
        false
    }

    /// Invoke every listener registered for the event's kind, in order
    pub fn emit(&self, event: &ClientEvent) {
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            match registry.listeners.get(&event.kind()) {
                Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.listeners.get(&kind).map_or(0, Vec::len)
    }
}
