//! Structured protocol events for external loggers and front ends
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    CommandSent { command: String },
    ResponseReceived { command: String, response: String },
    ResponseMissing { command: String },
    SrqClassified { status: u8, event: String },
    ConfigurationComplete { address: u8 },
    PartSorted { index: usize, identifier: Option<String>, bin: u8 },
    JobFinished { sorted: usize, requested: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProtocolEvent {
    pub fn now(kind: EventKind) -> Self {
        Self { timestamp: Utc::now(), kind }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &ProtocolEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &ProtocolEvent) {}
}

/// Writes events to the `log` facade under the `gpib_sorter::events` target
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &ProtocolEvent) {
        match &event.kind {
            EventKind::CommandSent { .. } | EventKind::ResponseReceived { .. } => {
                log::trace!(target: "gpib_sorter::events", "{:?}", event.kind)
            }
            EventKind::ResponseMissing { command } => {
                log::debug!(target: "gpib_sorter::events", "No response to '{}'", command)
            }
            other => log::info!(target: "gpib_sorter::events", "{:?}", other),
        }
    }
}

/// Fans events out to any number of subscribers
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProtocolEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn record(&self, event: &ProtocolEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Plain-text communication log: `-> command` / `<- response`
pub struct TranscriptSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TranscriptSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn append_to(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    fn line(kind: &EventKind) -> Option<String> {
        match kind {
            EventKind::CommandSent { command } => Some(format!("-> {}", command)),
            EventKind::ResponseReceived { response, .. } => Some(format!("<- {}", response)),
            EventKind::ResponseMissing { .. } => Some("<- ".to_string()),
            EventKind::SrqClassified { status, event } => Some(format!("Status byte: 0x{:02x} ({})", status, event)),
            _ => None,
        }
    }
}

impl EventSink for TranscriptSink {
    fn record(&self, event: &ProtocolEvent) {
        let Some(line) = Self::line(&event.kind) else { return };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            log::warn!("Failed to write transcript: {}", e);
        }
    }
}

/// Forwards every event to each inner sink in order
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn record(&self, event: &ProtocolEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
