//! HTTP-backed transcriber and summarizer (OpenAI-style endpoints)

use crate::config::TranscriberConfig;
use crate::error::{Error, Result};
use crate::transcribe::{build_prompt, Summarizer, TranscribeError, Transcriber};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Instruction used for post-hoc summaries
const SUMMARIZE_INSTRUCTION: &str = "Summarize the following meeting transcript. \
Cover the topics discussed, decisions made and action items, in plain prose. \
Base the summary only on what the transcript actually says.";

/// Cloud transcription client posting multipart audio uploads
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: TranscriberConfig,
}

impl HttpTranscriber {
    /// Create a new HTTP transcriber
    pub fn new(config: TranscriberConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        audio_base64: &str,
        mime_type: &str,
        context: Option<&str>,
    ) -> std::result::Result<String, TranscribeError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            TranscribeError::Rejected {
                message: "no transcriber API key configured".to_string(),
            }
        })?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(audio_base64)
            .map_err(|e| TranscribeError::Rejected {
                message: format!("invalid base64 payload: {}", e),
            })?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name_for_mime(mime_type))
                    .mime_str(mime_type)
                    .map_err(|e| TranscribeError::Rejected {
                        message: format!("invalid mime type {}: {}", mime_type, e),
                    })?,
            )
            .text("model", self.config.model.clone())
            .text("prompt", build_prompt(context))
            .text("response_format", "text");

        debug!("Sending transcription request (model {})", self.config.model);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.config.endpoint))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await.map_err(map_request_error)?;
            return Ok(text.trim().to_string());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        warn!("Transcription request failed with {}: {}", status, body);
        Err(map_status(status.as_u16(), retry_after, body))
    }
}

/// Cloud summarization client posting chat-completion requests
pub struct HttpSummarizer {
    client: reqwest::Client,
    config: TranscriberConfig,
}

impl HttpSummarizer {
    /// Create a new HTTP summarizer
    pub fn new(config: TranscriberConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, transcript: &str) -> std::result::Result<String, TranscribeError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            TranscribeError::Rejected {
                message: "no summarizer API key configured".to_string(),
            }
        })?;

        let body = serde_json::json!({
            "model": self.config.summary_model,
            "messages": [
                { "role": "system", "content": SUMMARIZE_INSTRUCTION },
                { "role": "user", "content": transcript },
            ],
        });

        debug!(
            "Sending summarization request (model {}, {} transcript chars)",
            self.config.summary_model,
            transcript.len()
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.endpoint))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            warn!("Summarization request failed with {}: {}", status, body);
            return Err(map_status(status.as_u16(), retry_after, body));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| TranscribeError::Rejected {
            message: format!("malformed completion response: {}", e),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| TranscribeError::Rejected {
                message: "completion response had no choices".to_string(),
            })
    }
}

/// Map transport-level failures onto the error taxonomy
fn map_request_error(e: reqwest::Error) -> TranscribeError {
    if e.is_timeout() {
        TranscribeError::Timeout {
            message: e.to_string(),
        }
    } else {
        TranscribeError::Connection {
            message: e.to_string(),
        }
    }
}

/// Map an HTTP status onto the error taxonomy
fn map_status(status: u16, retry_after: Option<Duration>, body: String) -> TranscribeError {
    match status {
        429 => TranscribeError::RateLimited { retry_after },
        500..=599 => TranscribeError::Server {
            status,
            message: body,
        },
        _ => TranscribeError::Rejected {
            message: format!("HTTP {}: {}", status, body),
        },
    }
}

/// Parse a Retry-After header (delta-seconds form)
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Upload filename for the multipart part, derived from the MIME subtype
fn file_name_for_mime(mime_type: &str) -> String {
    let ext = match mime_type {
        m if m.contains("mpeg") || m.contains("mp3") => "mp3",
        m if m.contains("ogg") => "ogg",
        m if m.contains("mp4") || m.contains("m4a") => "m4a",
        m if m.contains("aac") => "aac",
        m if m.contains("flac") => "flac",
        m if m.contains("wav") => "wav",
        _ => "webm",
    };
    format!("chunk.{}", ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_classification() {
        assert!(map_status(429, None, String::new()).is_rate_limit());
        assert!(map_status(500, None, "boom".to_string()).is_server_error());
        assert!(map_status(503, None, String::new()).is_server_error());
        assert!(!map_status(400, None, String::new()).is_retryable());
        assert!(!map_status(401, None, String::new()).is_retryable());
    }

    #[test]
    fn test_retry_after_surfaces_through_rate_limit() {
        let err = map_status(429, Some(Duration::from_secs(12)), String::new());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert("retry-after", "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn test_file_name_for_mime() {
        assert_eq!(file_name_for_mime("audio/mpeg"), "chunk.mp3");
        assert_eq!(file_name_for_mime("audio/webm;codecs=opus"), "chunk.webm");
        assert_eq!(file_name_for_mime("audio/wav"), "chunk.wav");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_a_permanent_rejection() {
        let transcriber = HttpTranscriber::new(TranscriberConfig {
            endpoint: "https://api.example.test/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap();

        let err = transcriber
            .transcribe("AAAA", "audio/mpeg", None)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
