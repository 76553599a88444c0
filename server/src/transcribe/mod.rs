//! Transcriber and summarizer abstractions
//!
//! The pipeline only depends on these narrow traits and on the error-kind
//! predicates below; the concrete HTTP clients live in `http` and can be
//! replaced by stubs in tests.

pub mod gateway;
pub mod http;
pub mod scrub;

pub use gateway::TranscriptionGateway;
pub use http::{HttpSummarizer, HttpTranscriber};

use async_trait::async_trait;
use std::time::Duration;

/// The transcription instruction sent with every chunk
pub const TRANSCRIBE_INSTRUCTION: &str = "Transcribe this audio literally. \
Label every utterance as [Speaker N]: followed by the exact words spoken. \
If there is no speech, respond with [silence]. If speech is present but \
cannot be made out, respond with [inaudible]. Do not summarize, translate, \
or add commentary.";

/// Build the full prompt, prepending rolling context when present
pub fn build_prompt(context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => format!(
            "The recording continues from earlier speech. The previous transcript ends with:\n\
             {}\n\
             Do not repeat the text above.\n\n{}",
            ctx, TRANSCRIBE_INSTRUCTION
        ),
        _ => TRANSCRIBE_INSTRUCTION.to_string(),
    }
}

/// Failure kinds an upstream transcriber or summarizer call can surface.
///
/// The retry policy branches exclusively on the predicates, never on text.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("upstream request timed out: {message}")]
    Timeout { message: String },

    #[error("upstream connection failed: {message}")]
    Connection { message: String },

    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("upstream rejected the request: {message}")]
    Rejected { message: String },
}

impl TranscribeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    /// Server-suggested delay; overrides computed backoff when present
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Timeouts, connection errors, 5xx and rate limits are retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Whole-chunk transcription capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio_base64: &str,
        mime_type: &str,
        context: Option<&str>,
    ) -> std::result::Result<String, TranscribeError>;
}

/// Post-hoc summarization capability
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> std::result::Result<String, TranscribeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_without_context_is_bare_instruction() {
        assert_eq!(build_prompt(None), TRANSCRIBE_INSTRUCTION);
        assert_eq!(build_prompt(Some("   ")), TRANSCRIBE_INSTRUCTION);
    }

    #[test]
    fn test_prompt_with_context_forbids_repetition() {
        let prompt = build_prompt(Some("[Speaker 1]: We were discussing the budget."));
        assert!(prompt.contains("[Speaker 1]: We were discussing the budget."));
        assert!(prompt.contains("Do not repeat the text above."));
        assert!(prompt.ends_with(TRANSCRIBE_INSTRUCTION));
    }

    #[test]
    fn test_error_predicates() {
        assert!(TranscribeError::Timeout { message: "t".into() }.is_timeout());
        assert!(TranscribeError::RateLimited { retry_after: None }.is_rate_limit());
        assert!(TranscribeError::Server { status: 502, message: "bad gateway".into() }
            .is_server_error());

        let limited = TranscribeError::RateLimited {
            retry_after: Some(Duration::from_secs(9)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(9)));
        assert!(limited.is_retryable());

        let rejected = TranscribeError::Rejected { message: "bad mime".into() };
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.retry_after(), None);
    }
}
