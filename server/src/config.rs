//! Application configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network listener settings
    pub server: ServerConfig,

    /// Chunk pipeline tuning
    pub pipeline: PipelineConfig,

    /// External audio tool settings
    pub stitch: StitchConfig,

    /// Upstream transcriber/summarizer access
    pub transcriber: TranscriberConfig,

    /// Database and fragment store locations
    pub storage: StorageConfig,
}

/// Network listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the WebSocket server binds to
    pub bind_addr: String,

    /// Interval between server-initiated pings on each connection
    pub ping_interval_secs: u64,

    /// A connection that has not answered a ping within this window is dropped
    pub liveness_timeout_secs: u64,
}

/// Chunk pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Period between scheduler ticks for an active session
    pub chunk_period_secs: u64,

    /// Fragments below this size are dropped at ingest (browser tail noise)
    pub min_fragment_bytes: u64,

    /// Batches below this combined size are skipped without transcription
    pub min_stitch_bytes: u64,

    /// Hard cap on buffered bytes per session
    pub max_session_bytes: u64,

    /// Average client-reported energy below this is treated as silence
    pub silence_energy_threshold: f64,

    /// Size ceiling for the silence gate when energy readings are incomplete
    pub silence_max_bytes: u64,

    /// Number of trailing chunk texts considered for rolling context
    pub context_chunks: usize,

    /// Character budget for the rolling context tail
    pub context_chars: usize,

    /// Maximum transcriber attempts per chunk
    pub transcribe_attempts: u32,

    /// Base delay for transcriber retry backoff
    pub retry_base_secs: u64,
}

/// External audio tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchConfig {
    /// ffmpeg executable (name resolved via PATH or absolute path)
    pub ffmpeg_path: String,

    /// ffprobe executable; used for output verification when present
    pub ffprobe_path: String,

    /// Timeout for a single-input tool invocation
    pub tool_timeout_secs: u64,

    /// Timeout for multi-input filter-graph invocations
    pub filter_graph_timeout_secs: u64,

    /// Cap on bytes read from the tool's stdout
    pub tool_stdout_max: u64,

    /// Target sample rate for the canonical MP3 output
    pub target_sample_rate: u32,

    /// Target bitrate for the canonical MP3 output
    pub target_bitrate: String,

    /// When set, stitched MP3s are also written to the session debug
    /// directory and survive session cleanup
    pub debug_save_stitched: bool,
}

/// Upstream transcriber configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberConfig {
    /// Base URL of the OpenAI-style API
    pub endpoint: String,

    /// API key; absent means transcription calls fail and chunks are skipped
    pub api_key: Option<String>,

    /// Transcription model identifier (one model per deployment)
    pub model: String,

    /// Summarization model identifier
    pub summary_model: String,

    /// Per-request timeout
    pub request_timeout_secs: u64,
}

/// Storage locations configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file path
    pub database_path: PathBuf,

    /// Root directory for per-session fragment files
    pub fragment_root: PathBuf,

    /// Session directories older than this many days are swept
    pub retention_days: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "0.0.0.0:8787".to_string(),
                ping_interval_secs: 10,
                liveness_timeout_secs: 30,
            },
            pipeline: PipelineConfig::default(),
            stitch: StitchConfig::default(),
            transcriber: TranscriberConfig {
                endpoint: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "whisper-1".to_string(),
                summary_model: "gpt-4o-mini".to_string(),
                request_timeout_secs: 60,
            },
            storage: StorageConfig {
                database_path: PathBuf::from("data/scribewire.db"),
                fragment_root: PathBuf::from("data/sessions"),
                retention_days: 7,
            },
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_period_secs: 30,
            min_fragment_bytes: 1024,
            min_stitch_bytes: 10 * 1024,
            max_session_bytes: 2 * 1024 * 1024 * 1024,
            silence_energy_threshold: 0.02,
            silence_max_bytes: 40 * 1024,
            context_chunks: 5,
            context_chars: 500,
            transcribe_attempts: 3,
            retry_base_secs: 2,
        }
    }
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            tool_timeout_secs: 30,
            filter_graph_timeout_secs: 60,
            tool_stdout_max: 10 * 1024 * 1024,
            target_sample_rate: 16_000,
            target_bitrate: "64k".to_string(),
            debug_save_stitched: false,
        }
    }
}

impl PipelineConfig {
    /// Scheduler tick period as a Duration
    pub fn chunk_period(&self) -> Duration {
        Duration::from_secs(self.chunk_period_secs)
    }

    /// Base retry delay as a Duration
    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_secs)
    }
}

impl AppConfig {
    /// Load configuration: defaults overlaid with environment variables
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SCRIBEWIRE_BIND") {
            config.server.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("SCRIBEWIRE_DB_PATH") {
            config.storage.database_path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("SCRIBEWIRE_FRAGMENT_ROOT") {
            config.storage.fragment_root = PathBuf::from(root);
        }
        if let Ok(endpoint) = std::env::var("SCRIBEWIRE_API_ENDPOINT") {
            config.transcriber.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("SCRIBEWIRE_API_KEY") {
            config.transcriber.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("SCRIBEWIRE_MODEL") {
            config.transcriber.model = model;
        }
        if let Ok(flag) = std::env::var("SCRIBEWIRE_DEBUG_SAVE_STITCHED") {
            config.stitch.debug_save_stitched = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.chunk_period_secs == 0 {
            return Err(Error::config("Chunk period must be greater than 0"));
        }

        if self.pipeline.min_stitch_bytes < self.pipeline.min_fragment_bytes {
            return Err(Error::config(
                "Minimum stitch size must be at least the minimum fragment size",
            ));
        }

        if self.pipeline.max_session_bytes == 0 {
            return Err(Error::config("Session byte cap must be greater than 0"));
        }

        if self.pipeline.transcribe_attempts == 0 {
            return Err(Error::config("Transcriber attempts must be greater than 0"));
        }

        if self.stitch.tool_stdout_max == 0 {
            return Err(Error::config("Tool stdout cap must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_contract() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.chunk_period_secs, 30);
        assert_eq!(config.pipeline.min_fragment_bytes, 1024);
        assert_eq!(config.pipeline.min_stitch_bytes, 10 * 1024);
        assert_eq!(config.pipeline.max_session_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.pipeline.context_chunks, 5);
        assert_eq!(config.pipeline.context_chars, 500);
        assert_eq!(config.pipeline.transcribe_attempts, 3);
        assert_eq!(config.storage.retention_days, 7);
        assert!(!config.stitch.debug_save_stitched);
    }

    #[test]
    fn test_validate_rejects_zero_period() {
        let mut config = AppConfig::default();
        config.pipeline.chunk_period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_size_gates() {
        let mut config = AppConfig::default();
        config.pipeline.min_stitch_bytes = 512;
        assert!(config.validate().is_err());
    }
}
