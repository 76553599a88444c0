//! Transcription gateway: rolling context, retries, post-processing
//!
//! One gateway call per chunk. The gateway assembles the rolling context
//! from the last few persisted chunks, invokes the transcriber with up to
//! three attempts, honours server-suggested retry delays, and runs the
//! scrub contract over the raw response.

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::stitch::StitchedAudio;
use crate::storage::ChunkRepository;
use crate::transcribe::{build_prompt, scrub, Transcriber};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Markers that disqualify a chunk text from serving as context
const CONTEXT_MARKERS: [&str; 3] = ["[silence]", "[inaudible]", "[unclear]"];

/// Minimum length for a chunk text to count as substantive context
const CONTEXT_MIN_CHARS: usize = 15;

/// Gateway between the chunk pipeline and the upstream transcriber
pub struct TranscriptionGateway {
    transcriber: Arc<dyn Transcriber>,
    chunks: ChunkRepository,
    config: PipelineConfig,
}

impl TranscriptionGateway {
    /// Create a new gateway
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        chunks: ChunkRepository,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transcriber,
            chunks,
            config,
        }
    }

    /// Transcribe one stitched chunk, returning the scrubbed text
    pub async fn transcribe_chunk(
        &self,
        session_id: &str,
        audio: &StitchedAudio,
    ) -> Result<String> {
        let context = self.build_context(session_id).await?;
        let prompt = build_prompt(context.as_deref());

        let mut attempt = 0u32;
        let mut last_error: Option<String> = None;

        while attempt < self.config.transcribe_attempts {
            match self
                .transcriber
                .transcribe(&audio.audio_base64, &audio.mime_type, context.as_deref())
                .await
            {
                Ok(raw) => {
                    debug!(
                        "Transcriber answered for {} with {} characters",
                        session_id,
                        raw.len()
                    );
                    return Ok(scrub::clean_transcript(&raw, &prompt));
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(Error::transcribe(e.to_string()));
                    }

                    warn!(
                        "Transcriber attempt {} failed for {}: {}",
                        attempt + 1,
                        session_id,
                        e
                    );

                    // A server-suggested delay overrides the computed backoff.
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| backoff_delay(attempt, self.config.retry_base()));
                    last_error = Some(e.to_string());

                    attempt += 1;
                    if attempt < self.config.transcribe_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::transcribe(format!(
            "all {} attempts failed: {}",
            self.config.transcribe_attempts,
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )))
    }

    /// Rolling context: the last few substantive chunk texts, tail-cropped
    async fn build_context(&self, session_id: &str) -> Result<Option<String>> {
        let texts = self
            .chunks
            .last_texts(session_id, self.config.context_chunks)
            .await?;

        let substantive: Vec<&str> = texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| is_substantive(t))
            .collect();

        if substantive.is_empty() {
            return Ok(None);
        }

        let joined = substantive.join("\n");
        Ok(Some(tail_crop(&joined, self.config.context_chars)))
    }
}

/// A context line must be real speech, not a marker or a stub
fn is_substantive(text: &str) -> bool {
    if text.len() < CONTEXT_MIN_CHARS {
        return false;
    }
    !CONTEXT_MARKERS.contains(&text)
}

/// Keep the final `max_chars` characters, respecting char boundaries
pub(crate) fn tail_crop(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Exponential backoff with up to 25% jitter
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let delay = base.as_millis() as u64 * 2u64.pow(attempt);
    let jitter = if delay == 0 { 0 } else { fastrand::u64(0..=delay / 4) };
    Duration::from_millis(delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::DatabaseManager;
    use crate::storage::models::CreateChunk;
    use crate::transcribe::TranscribeError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Transcriber stub answering from a scripted queue
    struct ScriptedTranscriber {
        script: Mutex<Vec<std::result::Result<String, TranscribeError>>>,
        calls: Mutex<u32>,
        seen_context: Mutex<Option<String>>,
    }

    impl ScriptedTranscriber {
        fn new(script: Vec<std::result::Result<String, TranscribeError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
                seen_context: Mutex::new(None),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(
            &self,
            _audio_base64: &str,
            _mime_type: &str,
            context: Option<&str>,
        ) -> std::result::Result<String, TranscribeError> {
            *self.calls.lock().unwrap() += 1;
            *self.seen_context.lock().unwrap() = context.map(|s| s.to_string());
            self.script.lock().unwrap().remove(0)
        }
    }

    fn audio() -> StitchedAudio {
        StitchedAudio {
            audio_base64: "AAAA".to_string(),
            mime_type: "audio/mpeg".to_string(),
            content_hash: "deadbeef".to_string(),
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            retry_base_secs: 0,
            ..PipelineConfig::default()
        }
    }

    async fn chunk_repo() -> ChunkRepository {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO recording_session (id, user_id, title) VALUES (?, ?, ?)")
            .bind("sess-1")
            .bind("test-user")
            .bind("test session")
            .execute(db.pool())
            .await
            .unwrap();
        ChunkRepository::new(db.pool().clone())
    }

    async fn seed_chunk(repo: &ChunkRepository, index: i64, text: &str) {
        repo.insert(CreateChunk {
            session_id: "sess-1".to_string(),
            chunk_index: index,
            text: text.to_string(),
            timestamp: Utc::now(),
            confidence: Some(0.3),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_success_is_scrubbed() {
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![Ok(
            "Here's the transcription: [Speaker 1]: The budget is approved.".to_string(),
        )]));
        let gateway =
            TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, fast_config());

        let text = gateway.transcribe_chunk("sess-1", &audio()).await.unwrap();
        assert_eq!(text, "[Speaker 1]: The budget is approved.");
        assert_eq!(transcriber.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![
            Err(TranscribeError::Server {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Err(TranscribeError::Timeout {
                message: "deadline".to_string(),
            }),
            Ok("[Speaker 1]: Third time lucky.".to_string()),
        ]));
        let gateway =
            TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, fast_config());

        let text = gateway.transcribe_chunk("sess-1", &audio()).await.unwrap();
        assert_eq!(text, "[Speaker 1]: Third time lucky.");
        assert_eq!(transcriber.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let failure = || {
            Err(TranscribeError::Server {
                status: 500,
                message: "boom".to_string(),
            })
        };
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![failure(), failure(), failure()]));
        let gateway =
            TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, fast_config());

        let err = gateway.transcribe_chunk("sess-1", &audio()).await.unwrap_err();
        assert!(matches!(err, Error::Transcribe { .. }));
        assert_eq!(transcriber.calls(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![Err(
            TranscribeError::Rejected {
                message: "unsupported mime".to_string(),
            },
        )]));
        let gateway =
            TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, fast_config());

        assert!(gateway.transcribe_chunk("sess-1", &audio()).await.is_err());
        assert_eq!(transcriber.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_delay_overrides_backoff() {
        // A huge computed backoff would hang the test; the server-suggested
        // zero delay must win.
        let config = PipelineConfig {
            retry_base_secs: 3600,
            ..PipelineConfig::default()
        };
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![
            Err(TranscribeError::RateLimited {
                retry_after: Some(Duration::ZERO),
            }),
            Ok("[Speaker 1]: After the limit.".to_string()),
        ]));
        let gateway = TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, config);

        let text = tokio::time::timeout(
            Duration::from_secs(5),
            gateway.transcribe_chunk("sess-1", &audio()),
        )
        .await
        .expect("must not wait for the computed backoff")
        .unwrap();
        assert_eq!(text, "[Speaker 1]: After the limit.");
        assert_eq!(transcriber.calls(), 2);
    }

    #[tokio::test]
    async fn test_context_filters_markers_and_stubs() {
        let repo = chunk_repo().await;
        seed_chunk(&repo, 0, "[Speaker 1]: We moved the launch to the ninth.").await;
        seed_chunk(&repo, 1, "[silence]").await;
        seed_chunk(&repo, 2, "ok").await;
        seed_chunk(&repo, 3, "[Speaker 2]: Marketing signed off this morning.").await;

        let transcriber = Arc::new(ScriptedTranscriber::new(vec![Ok(
            "[Speaker 1]: Continuing.".to_string(),
        )]));
        let gateway = TranscriptionGateway::new(transcriber.clone(), repo, fast_config());

        gateway.transcribe_chunk("sess-1", &audio()).await.unwrap();

        let context = transcriber.seen_context.lock().unwrap().clone().unwrap();
        assert!(context.contains("We moved the launch"));
        assert!(context.contains("Marketing signed off"));
        assert!(!context.contains("[silence]"));
        assert!(!context.contains("\nok"));
    }

    #[tokio::test]
    async fn test_context_is_tail_cropped() {
        let repo = chunk_repo().await;
        let body = "the quarterly figures keep improving ".repeat(30);
        let long = format!("[Speaker 1]: {}", body.trim_end());
        seed_chunk(&repo, 0, &long).await;

        let transcriber = Arc::new(ScriptedTranscriber::new(vec![Ok("[Speaker 1]: Next.".to_string())]));
        let gateway = TranscriptionGateway::new(transcriber.clone(), repo, fast_config());

        gateway.transcribe_chunk("sess-1", &audio()).await.unwrap();

        let context = transcriber.seen_context.lock().unwrap().clone().unwrap();
        assert_eq!(context.chars().count(), 500);
        assert!(long.ends_with(&context));
    }

    #[tokio::test]
    async fn test_no_context_for_fresh_session() {
        let transcriber = Arc::new(ScriptedTranscriber::new(vec![Ok("[Speaker 1]: First words.".to_string())]));
        let gateway =
            TranscriptionGateway::new(transcriber.clone(), chunk_repo().await, fast_config());

        gateway.transcribe_chunk("sess-1", &audio()).await.unwrap();
        assert!(transcriber.seen_context.lock().unwrap().is_none());
    }

    #[test]
    fn test_tail_crop_respects_char_boundaries() {
        assert_eq!(tail_crop("hello", 10), "hello");
        assert_eq!(tail_crop("hello", 3), "llo");
        // Multi-byte characters must not be split.
        assert_eq!(tail_crop("héllo wörld", 5), "wörld");
    }
}
