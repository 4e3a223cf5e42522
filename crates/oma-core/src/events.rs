//! Step lifecycle events.
//!
//! Executors emit a `Start` and a `Finish` event per run, plus `Message`
//! events carrying agent output. Consumers hold the receiving end.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::runner::BackendKind;

pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start {
        event_id: EventId,
        timestamp: u64,
        run_id: String,
        agent_id: String,
        backend: BackendKind,
    },
    Finish {
        event_id: EventId,
        timestamp: u64,
        run_id: String,
        agent_id: String,
        backend: BackendKind,
        outcome: StepOutcome,
        duration_ms: u64,
    },
    Message {
        event_id: EventId,
        timestamp: u64,
        run_id: String,
        agent_id: String,
        content: String,
        metadata: serde_json::Value,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::Start { event_id, .. }
            | Event::Finish { event_id, .. }
            | Event::Message { event_id, .. } => event_id,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Event::Start { agent_id, .. }
            | Event::Finish { agent_id, .. }
            | Event::Message { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure { reason: String, retryable: bool },
    Timeout,
}

#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit_start(&self, run_id: &str, agent_id: &str, backend: BackendKind) {
        self.send(Event::Start {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            backend,
        });
    }

    pub fn emit_finish(
        &self,
        run_id: &str,
        agent_id: &str,
        backend: BackendKind,
        outcome: StepOutcome,
        duration_ms: u64,
    ) {
        self.send(Event::Finish {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            backend,
            outcome,
            duration_ms,
        });
    }

    pub fn emit_message(
        &self,
        run_id: &str,
        agent_id: &str,
        content: String,
        metadata: serde_json::Value,
    ) {
        self.send(Event::Message {
            event_id: generate_event_id(),
            timestamp: current_timestamp(),
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            content,
            metadata,
        });
    }

    fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event) {
            tracing::warn!(error = %e, "Failed to emit step event");
        }
    }
}

/// Take every event already queued, without waiting.
pub fn drain_events(receiver: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("evt_{}", id)
}

/// Milliseconds since the Unix epoch.
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
