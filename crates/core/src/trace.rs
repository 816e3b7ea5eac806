//! Bounded trace log with fan-out to live subscribers.
//!
//! Every append is broadcast to the connected browser pages. When the log is
//! full it is cleared completely and restarted with a marker message; older
//! entries are not evicted one by one.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use prometheus_client::metrics::counter::Counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::config::DEFAULT_TRACE_CAPACITY;

const SUBSCRIBER_BUFFER: usize = 256;
const MIN_CAPACITY: usize = 2;
const CLIENT_KEYWORDS: [&str; 3] = ["model update", "successfully uploaded", "retrieved new model"];

/// Origin of a trace line, rendered as a short header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TraceComponent {
    Client,
    Server,
    Trainer,
}

impl TraceComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceComponent::Client => "Client",
            TraceComponent::Server => "Server",
            TraceComponent::Trainer => "Trainer",
        }
    }

    pub fn header(self) -> String {
        format!("{}: ", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TraceMessage {
    pub message: String,
    /// Milliseconds since the Unix epoch, with sub-millisecond precision.
    pub timestamp_ms: f64,
}

impl TraceMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp_ms: Utc::now().timestamp_micros() as f64 / 1000.0,
        }
    }
}

#[derive(Clone)]
pub struct TraceLog(Arc<TraceLogInner>);

struct TraceLogInner {
    capacity: usize,
    messages: RwLock<Vec<TraceMessage>>,
    tx: broadcast::Sender<TraceMessage>,
    appended: Counter,
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

impl TraceLog {
    /// Creates a log holding at most `capacity` messages (at least two: marker plus message).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self(Arc::new(TraceLogInner {
            capacity: capacity.max(MIN_CAPACITY),
            messages: RwLock::new(Vec::new()),
            tx,
            appended: Counter::default(),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Appends a message and notifies subscribers.
    ///
    /// A full log is cleared first and restarted with a reset marker, which is
    /// broadcast as well.
    pub fn append(&self, message: impl Into<String>) -> TraceMessage {
        let mut messages = self.write();
        if messages.len() >= self.0.capacity {
            messages.clear();
            let marker = TraceMessage::new(format!(
                "Max # trace messages received : {}, resetting.",
                self.0.capacity
            ));
            self.push(&mut messages, marker);
        }
        let entry = TraceMessage::new(tag_engine_message(message.into()));
        self.push(&mut messages, entry.clone());
        entry
    }

    /// Appends `text` prefixed with the component header.
    pub fn append_from(&self, component: TraceComponent, text: &str) -> TraceMessage {
        self.append(format!("{}{}", component.header(), text))
    }

    /// Empties the log without notifying subscribers.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn snapshot(&self) -> Vec<TraceMessage> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceMessage> {
        self.0.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.tx.receiver_count()
    }

    /// Counter of all messages appended, including reset markers.
    pub fn appended_counter(&self) -> Counter {
        self.0.appended.clone()
    }

    fn push(&self, messages: &mut Vec<TraceMessage>, entry: TraceMessage) {
        messages.push(entry.clone());
        self.0.appended.inc();
        // No receivers is fine; the page may simply not be open.
        let _ = self.0.tx.send(entry);
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TraceMessage>> {
        self.0.messages.read().unwrap_or_else(|poisoned| {
            tracing::warn!(error = "lock poisoned", "trace log recovering lock (read)");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<TraceMessage>> {
        self.0.messages.write().unwrap_or_else(|poisoned| {
            tracing::warn!(error = "lock poisoned", "trace log recovering lock (write)");
            poisoned.into_inner()
        })
    }
}

/// Engine status lines arrive without a header; mark them as client-side.
fn tag_engine_message(message: String) -> String {
    let lower = message.to_lowercase();
    if CLIENT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        format!("{}{}", TraceComponent::Client.header(), message)
    } else {
        message
    }
}
