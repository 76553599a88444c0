//! Session repository for database operations

use crate::error::{Error, Result};
use crate::storage::database::DatabasePool;
use crate::storage::models::{RecordingSession, SessionStatus};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Repository for recording-session rows
#[derive(Clone)]
pub struct SessionRepository {
    pool: DatabasePool,
}

impl SessionRepository {
    /// Create a new session repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persist a new session in Recording state; fails if the ID collides
    pub async fn create(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<RecordingSession> {
        debug!("Creating session row: {}", session_id);

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO recording_session (id, user_id, title, status, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(title)
        .bind(SessionStatus::Recording)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to create session: {}", e)))?;

        if inserted.rows_affected() == 0 {
            return Err(Error::bad_state("initialize-session", "already exists"));
        }

        let record = self
            .get(session_id)
            .await?
            .ok_or_else(|| Error::database("Session row missing after insert".to_string()))?;

        info!("Created session: {}", session_id);
        Ok(record)
    }

    /// Get a session by ID
    pub async fn get(&self, session_id: &str) -> Result<Option<RecordingSession>> {
        let record = sqlx::query_as::<_, RecordingSession>(
            "SELECT * FROM recording_session WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to get session: {}", e)))?;

        Ok(record)
    }

    /// Flip the persisted lifecycle state
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        debug!("Setting session {} status to {}", session_id, status);

        let result = sqlx::query("UPDATE recording_session SET status = ? WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database(format!("Failed to update session status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(session_id));
        }

        Ok(())
    }

    /// Record the finalization result: transcript, summary, duration, Completed
    pub async fn finalize(
        &self,
        session_id: &str,
        transcript: &str,
        summary: &str,
        duration_secs: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE recording_session
            SET status = ?, transcript_text = ?, summary = ?, duration_secs = ?
            WHERE id = ?
            "#,
        )
        .bind(SessionStatus::Completed)
        .bind(transcript)
        .bind(summary)
        .bind(duration_secs)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to finalize session: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(session_id));
        }

        info!("Finalized session: {}", session_id);
        Ok(())
    }
}
