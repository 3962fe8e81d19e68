//! In-memory audit log for session traffic
//!
//! Every inbound/outbound action of the session client is recorded as a
//! `StreamingLog` entry. The sink keeps a sliding window of the newest
//! entries and collapses identical consecutive entries into one with a
//! repeat count, so a steady stream of microphone chunks shows up as a
//! single `client.realtimeInput` line instead of thousands.

use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

/// Default number of entries retained
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Payload of a log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogMessage {
    Text(String),
    Json(Value),
}

impl LogMessage {
    pub fn text(text: impl Into<String>) -> Self {
        LogMessage::Text(text.into())
    }

    /// Snapshot a wire message as JSON
    pub fn json<T: Serialize>(value: &T) -> Self {
        LogMessage::Json(serde_json::to_value(value).unwrap_or_default())
    }
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingLog {
    /// When the entry (or its latest repeat) was recorded
    pub date: DateTime<Local>,
    /// Direction and message kind, e.g. `client.send`, `server.content`
    #[serde(rename = "type")]
    pub kind: String,
    pub message: LogMessage,
    /// Number of consecutive identical occurrences collapsed into this entry
    pub count: u32,
}

impl StreamingLog {
    pub fn new(kind: impl Into<String>, message: LogMessage) -> Self {
        Self {
            date: Local::now(),
            kind: kind.into(),
            message,
            count: 1,
        }
    }

    fn same_as(&self, other: &StreamingLog) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

/// View over the sink used by the log panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFilter {
    #[default]
    All,
    /// User turns and model content
    Conversations,
    /// Tool calls, cancellations and responses
    Tools,
}

impl LogFilter {
    pub fn matches(&self, entry: &StreamingLog) -> bool {
        match self {
            LogFilter::All => true,
            LogFilter::Conversations => {
                matches!(entry.kind.as_str(), "client.send" | "server.content")
            }
            LogFilter::Tools => matches!(
                entry.kind.as_str(),
                "server.toolCall" | "server.toolCallCancellation" | "client.toolResponse"
            ),
        }
    }
}

/// Capped, de-duplicating log store
///
/// Thread-safety: This struct is NOT internally synchronized.
/// Wrap in `Arc<Mutex<>>` if shared across threads.
#[derive(Debug)]
pub struct LogSink {
    entries: VecDeque<StreamingLog>,
    capacity: usize,
}

impl LogSink {
    /// Create a sink keeping at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an entry.
    ///
    /// If it repeats the newest entry (same kind and payload), that entry's
    /// count is bumped and its timestamp refreshed. Otherwise it is appended,
    /// evicting the oldest entry when the sink is full.
    pub fn push(&mut self, entry: StreamingLog) -> &StreamingLog {
        let repeats_last = self
            .entries
            .back()
            .is_some_and(|last| last.same_as(&entry));

        if repeats_last {
            if let Some(last) = self.entries.back_mut() {
                last.count += 1;
                last.date = entry.date;
            }
        } else {
            while self.entries.len() >= self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(entry);
        }

        // Non-empty after either branch
        &self.entries[self.entries.len() - 1]
    }

    /// Entries oldest first
    pub fn entries(&self) -> impl Iterator<Item = &StreamingLog> {
        self.entries.iter()
    }

    pub fn filtered(&self, filter: LogFilter) -> impl Iterator<Item = &StreamingLog> {
        self.entries.iter().filter(move |entry| filter.matches(entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
