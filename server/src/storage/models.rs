//! Database models and entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Recording session entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecordingSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub transcript_text: Option<String>,
    pub summary: Option<String>,
    pub duration_secs: Option<i64>,
}

/// Session lifecycle status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum SessionStatus {
    #[sqlx(rename = "recording")]
    Recording,
    #[sqlx(rename = "paused")]
    Paused,
    #[sqlx(rename = "processing")]
    Processing,
    #[sqlx(rename = "completed")]
    Completed,
    #[sqlx(rename = "cancelled")]
    Cancelled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Recording => write!(f, "recording"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Processing => write!(f, "processing"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl SessionStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// States in which ingest accepts fragments
    pub fn accepts_fragments(&self) -> bool {
        matches!(self, SessionStatus::Recording | SessionStatus::Paused)
    }

    /// States from which finalization is legal
    pub fn can_finalize(&self) -> bool {
        matches!(
            self,
            SessionStatus::Recording | SessionStatus::Paused | SessionStatus::Processing
        )
    }
}

/// Transcript chunk entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TranscriptChunk {
    pub id: i64,
    pub session_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f64>,
}

/// Input for creating a new transcript chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChunk {
    pub session_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f64>,
}
