//! Transcript chunk repository for database operations

use crate::error::{Error, Result};
use crate::storage::database::DatabasePool;
use crate::storage::models::{CreateChunk, TranscriptChunk};
use tracing::debug;

/// Repository for transcript-chunk rows
#[derive(Clone)]
pub struct ChunkRepository {
    pool: DatabasePool,
}

impl ChunkRepository {
    /// Create a new chunk repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert a chunk row; the (session, index) pair is unique
    pub async fn insert(&self, chunk: CreateChunk) -> Result<TranscriptChunk> {
        debug!(
            "Saving chunk {} for session {}",
            chunk.chunk_index, chunk.session_id
        );

        sqlx::query(
            r#"
            INSERT INTO transcript_chunk (session_id, chunk_index, text, timestamp, confidence)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.session_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.timestamp)
        .bind(chunk.confidence)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to save chunk: {}", e)))?;

        let record = sqlx::query_as::<_, TranscriptChunk>(
            "SELECT * FROM transcript_chunk WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(&chunk.session_id)
        .bind(chunk.chunk_index)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to read back chunk: {}", e)))?;

        Ok(record)
    }

    /// Number of chunks persisted for a session
    pub async fn count(&self, session_id: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM transcript_chunk WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::database(format!("Failed to count chunks: {}", e)))?;

        Ok(count.0)
    }

    /// All chunks for a session in index order
    pub async fn list(&self, session_id: &str) -> Result<Vec<TranscriptChunk>> {
        let records = sqlx::query_as::<_, TranscriptChunk>(
            "SELECT * FROM transcript_chunk WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to list chunks: {}", e)))?;

        Ok(records)
    }

    /// Texts of the last `n` chunks, oldest first (rolling-context source)
    pub async fn last_texts(&self, session_id: &str, n: usize) -> Result<Vec<String>> {
        let records: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT text FROM transcript_chunk
            WHERE session_id = ?
            ORDER BY chunk_index DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to fetch recent chunks: {}", e)))?;

        Ok(records.into_iter().rev().map(|(text,)| text).collect())
    }

    /// Fetch a single chunk by index
    pub async fn get_by_index(
        &self,
        session_id: &str,
        chunk_index: i64,
    ) -> Result<Option<TranscriptChunk>> {
        let record = sqlx::query_as::<_, TranscriptChunk>(
            "SELECT * FROM transcript_chunk WHERE session_id = ? AND chunk_index = ?",
        )
        .bind(session_id)
        .bind(chunk_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to get chunk: {}", e)))?;

        Ok(record)
    }
}
