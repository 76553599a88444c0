//! Finalization: consolidated transcript, summary, row update, cleanup

use crate::error::{Error, Result};
use crate::session::{SessionHandle, SessionRegistry};
use crate::storage::models::SessionStatus;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Degraded summary used when the summarizer fails or there is nothing to say
pub const FALLBACK_SUMMARY: &str = "Summary could not be generated from the transcript.";

/// Chunk texts that carry no transcript content
const MARKER_CHUNKS: [&str; 3] = ["[silence]", "[inaudible]", "[unclear]"];

fn boilerplate_chunk() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:i cannot process audio|i can't process audio|here(?:'s| is) the transcription|no speech detected)[^\n]*$",
        )
        .expect("boilerplate chunk pattern")
    })
}

fn summary_preamble() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:here(?:'s| is) (?:a |the )?(?:brief |concise |short )?summary[^\n:]*:?|this (?:transcript|meeting|conversation) (?:is |can be )?summari[sz]ed[^\n:]*:?)\s*")
            .expect("summary preamble pattern")
    })
}

/// Phrases summarizers invent for audio they never heard; dropped unless the
/// transcript itself uses the words
const SUMMARY_HALLUCINATIONS: [&str; 3] = ["audiobook", "thanked the listener", "thanks the listener"];

/// Whether a chunk text is refusal/marker boilerplate with no place in the
/// final transcript
pub(crate) fn is_boilerplate(text: &str) -> bool {
    let trimmed = text.trim();
    MARKER_CHUNKS.contains(&trimmed) || boilerplate_chunk().is_match(trimmed)
}

/// Strip hallucinated patterns and meta phrasings from a summary
pub(crate) fn scrub_summary(summary: &str, transcript: &str) -> String {
    let stripped = summary_preamble().replace(summary.trim(), "").to_string();

    let transcript_lower = transcript.to_lowercase();
    let mut kept: Vec<&str> = Vec::new();
    for sentence in split_sentences(&stripped) {
        let lower = sentence.to_lowercase();
        let hallucinated = SUMMARY_HALLUCINATIONS
            .iter()
            .any(|phrase| lower.contains(phrase) && !transcript_lower.contains(phrase));
        if !hallucinated {
            kept.push(sentence);
        }
    }

    let cleaned = kept.join(" ").trim().to_string();
    if cleaned.is_empty() {
        FALLBACK_SUMMARY.to_string()
    } else {
        cleaned
    }
}

/// Sentence split on terminal punctuation, keeping the punctuation
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let next_is_space = bytes.get(i + 1).map_or(true, |c| c.is_ascii_whitespace());
            if next_is_space {
                let sentence = text[start..=i].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = i + 1;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

impl SessionRegistry {
    /// Assemble the final transcript, summarize, persist and clean up.
    ///
    /// The session must already be in Processing; on success it is Completed
    /// and gone from the registry.
    pub(crate) async fn finalize(&self, handle: &Arc<SessionHandle>) -> Result<(String, String)> {
        let session_id = handle.id.as_str();
        let chunks = self.chunk_repo.list(session_id).await?;

        let transcript = chunks
            .iter()
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty() && !is_boilerplate(t))
            .collect::<Vec<_>>()
            .join("\n\n");

        let summary = if transcript.trim().is_empty() {
            FALLBACK_SUMMARY.to_string()
        } else {
            match self.summarizer.summarize(&transcript).await {
                Ok(raw) => scrub_summary(&raw, &transcript),
                Err(e) => {
                    warn!("Summarizer failed for {}: {}", session_id, e);
                    FALLBACK_SUMMARY.to_string()
                }
            }
        };

        // A Cancel issued while the summarizer was out wins.
        if handle.status() == SessionStatus::Cancelled {
            return Err(Error::bad_state("finalize", SessionStatus::Cancelled));
        }

        let started_at = { handle.buffers.lock().await.started_at };
        let duration_secs = (Utc::now() - started_at).num_seconds().max(0);

        self.session_repo
            .finalize(session_id, &transcript, &summary, duration_secs)
            .await?;
        handle.set_status(SessionStatus::Completed);

        self.store
            .purge_session(session_id, self.preserve_debug)
            .await?;
        self.remove_handle(session_id).await;

        self.bus.emit_status(session_id, SessionStatus::Completed);
        self.bus.emit_completed(session_id, &transcript, &summary);

        info!(
            "Finalized session {} ({} chunks, {} s)",
            session_id,
            chunks.len(),
            duration_secs
        );
        Ok((transcript, summary))
    }
}
