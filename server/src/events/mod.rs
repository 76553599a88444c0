//! Live update fan-out
//!
//! One broadcast channel carries every session's events; subscribers filter
//! by session on their side. A single channel keeps per-session events in
//! publish order, and delivery is best-effort: a slow or dead subscriber
//! lags the channel without ever blocking the pipeline.

use crate::storage::models::SessionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the broadcast channel
const DEFAULT_CAPACITY: usize = 256;

/// Events emitted by the pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// A new transcript chunk was persisted
    TranscriptUpdate {
        session_id: String,
        chunk_index: i64,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// The session changed lifecycle state
    Status {
        session_id: String,
        status: SessionStatus,
    },
    /// Finalization finished with a consolidated transcript and summary
    Completed {
        session_id: String,
        transcript: String,
        summary: String,
    },
}

impl SessionEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::TranscriptUpdate { session_id, .. } => session_id,
            SessionEvent::Status { session_id, .. } => session_id,
            SessionEvent::Completed { session_id, .. } => session_id,
        }
    }
}

/// Broadcast bus for live updates
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit a live transcript update
    pub fn emit_transcript_update(
        &self,
        session_id: &str,
        chunk_index: i64,
        text: &str,
        timestamp: DateTime<Utc>,
    ) {
        let event = SessionEvent::TranscriptUpdate {
            session_id: session_id.to_string(),
            chunk_index,
            text: text.to_string(),
            timestamp,
        };
        self.publish(event);
        debug!(
            "Emitted transcript update for {} (chunk {})",
            session_id, chunk_index
        );
    }

    /// Emit a lifecycle status update
    pub fn emit_status(&self, session_id: &str, status: SessionStatus) {
        let event = SessionEvent::Status {
            session_id: session_id.to_string(),
            status,
        };
        self.publish(event);
        debug!("Emitted status {} for {}", status, session_id);
    }

    /// Emit the finalization result
    pub fn emit_completed(&self, session_id: &str, transcript: &str, summary: &str) {
        let event = SessionEvent::Completed {
            session_id: session_id.to_string(),
            transcript: transcript.to_string(),
            summary: summary.to_string(),
        };
        self.publish(event);
        debug!("Emitted completion for {}", session_id);
    }

    fn publish(&self, event: SessionEvent) {
        // An Err only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit_status("sess-1", SessionStatus::Recording);
        bus.emit_transcript_update("sess-1", 0, "[Speaker 1]: Hello.", Utc::now());
        bus.emit_transcript_update("sess-1", 1, "[Speaker 1]: Still here.", Utc::now());

        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Status { status: SessionStatus::Recording, .. }
        ));
        match rx.recv().await.unwrap() {
            SessionEvent::TranscriptUpdate { chunk_index, .. } => assert_eq!(chunk_index, 0),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            SessionEvent::TranscriptUpdate { chunk_index, .. } => assert_eq!(chunk_index, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.emit_status("sess-1", SessionStatus::Cancelled);
        bus.emit_completed("sess-1", "transcript", "summary");
    }

    #[test]
    fn test_session_id_accessor() {
        let event = SessionEvent::Completed {
            session_id: "sess-9".to_string(),
            transcript: String::new(),
            summary: String::new(),
        };
        assert_eq!(event.session_id(), "sess-9");
    }
}
