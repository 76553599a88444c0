//! Fragment stitching: N opaque fragments in, one decodable audio payload out
//!
//! Browser recorders emit fragmented container streams whose header and
//! cluster information is spread unevenly across fragments (a WebM-Opus
//! stream carries its EBML header only in the first fragment), so a naive
//! byte concatenation is undecodable. The stitcher therefore picks one of
//! three strategies per batch and verifies the result. The canonical output
//! is MP3 at 16 kHz mono.

pub mod ffmpeg;

pub use ffmpeg::FfmpegStitcher;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::fragments::BufferedFragment;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// A stitched, transcriber-ready audio payload
#[derive(Debug, Clone)]
pub struct StitchedAudio {
    /// Base64-encoded audio bytes
    pub audio_base64: String,
    /// MIME type of the encoded payload
    pub mime_type: String,
    /// sha256 (hex) of the combined input bytes; the duplicate-suppression key
    pub content_hash: String,
}

/// Why a batch was skipped without producing a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Combined payload below the minimum stitch size
    TooSmall,
    /// Client-reported energy marks the batch as silence
    Silence,
    /// Identical to the previously transcribed batch
    Duplicate,
}

/// Strategy used to turn a batch into decodable audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchStrategy {
    /// One tool invocation, each fragment a separate input, concat filter graph
    FilterGraphConcat,
    /// Transcode each fragment individually, then concat the intermediates
    TranscodeConcat,
    /// Single tool process fed the combined bytes over stdin
    StreamingPipe,
}

/// Turns a fragment batch into a single decodable audio artifact
#[async_trait]
pub trait AudioStitcher: Send + Sync {
    async fn stitch(
        &self,
        session_id: &str,
        fragments: &[BufferedFragment],
    ) -> Result<StitchedAudio>;
}

/// Combined byte length of a batch
pub fn combined_len(fragments: &[BufferedFragment]) -> u64 {
    fragments.iter().map(|f| f.bytes.len() as u64).sum()
}

/// sha256 (hex) over the concatenated fragment bytes.
///
/// Computed on the input side, before any re-encoding, so identical client
/// payloads always collide regardless of encoder nondeterminism.
pub fn combined_hash(fragments: &[BufferedFragment]) -> String {
    let mut hasher = Sha256::new();
    for fragment in fragments {
        hasher.update(&fragment.bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Average of the client-reported energies, when any were reported
pub fn average_energy(fragments: &[BufferedFragment]) -> Option<f64> {
    let readings: Vec<f64> = fragments.iter().filter_map(|f| f.energy).collect();
    if readings.is_empty() {
        return None;
    }
    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}

/// Evaluate the pre-stitch gates in contract order: size, silence, duplicate.
///
/// The silence gate trusts the average alone when every fragment reported an
/// energy reading; a sparse average (some fragments silent on the matter) is
/// weaker evidence and only gates batches under `silence_max_bytes`.
pub fn evaluate_gates(
    fragments: &[BufferedFragment],
    config: &PipelineConfig,
    last_hash: Option<&str>,
) -> Option<SkipReason> {
    let combined = combined_len(fragments);
    if combined < config.min_stitch_bytes {
        return Some(SkipReason::TooSmall);
    }

    if let Some(avg) = average_energy(fragments) {
        if avg < config.silence_energy_threshold {
            let all_reported = fragments.iter().all(|f| f.energy.is_some());
            if all_reported || combined < config.silence_max_bytes {
                return Some(SkipReason::Silence);
            }
        }
    }

    if let Some(last) = last_hash {
        if combined_hash(fragments) == last {
            return Some(SkipReason::Duplicate);
        }
    }

    None
}

/// Pick the strategy for a batch.
///
/// Multi-fragment batches dominated by WebM need the header-aware filter
/// graph; everything else decodes fine from a single piped stream.
pub fn choose_strategy(fragments: &[BufferedFragment]) -> StitchStrategy {
    if fragments.len() > 1 && fragments.iter().any(|f| f.hint.is_webm()) {
        StitchStrategy::FilterGraphConcat
    } else {
        StitchStrategy::StreamingPipe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::ContainerHint;
    use std::path::PathBuf;

    fn fragment(bytes: Vec<u8>, hint: ContainerHint, energy: Option<f64>) -> BufferedFragment {
        BufferedFragment {
            bytes,
            hint,
            energy,
            client_id: None,
            path: PathBuf::from("/dev/null"),
        }
    }

    fn batch(count: usize, size: usize, energy: Option<f64>) -> Vec<BufferedFragment> {
        (0..count)
            .map(|i| fragment(vec![i as u8; size], ContainerHint::WebmOpus, energy))
            .collect()
    }

    #[test]
    fn test_gate_too_small() {
        let config = PipelineConfig::default();
        let fragments = batch(2, 1024, Some(0.5));
        assert_eq!(
            evaluate_gates(&fragments, &config, None),
            Some(SkipReason::TooSmall)
        );
    }

    #[test]
    fn test_gate_silence_with_full_energy_readings() {
        let config = PipelineConfig::default();
        // 30 x 4 KiB at energy 0.005: well over the sparse-sample ceiling,
        // but every fragment reported, so the average alone decides.
        let fragments = batch(30, 4096, Some(0.005));
        assert_eq!(
            evaluate_gates(&fragments, &config, None),
            Some(SkipReason::Silence)
        );
    }

    #[test]
    fn test_gate_silence_sparse_readings_respect_size_ceiling() {
        let config = PipelineConfig::default();
        let mut fragments = batch(30, 4096, Some(0.005));
        fragments[0].energy = None;
        // 120 KiB with an incomplete sample: not silence-gated.
        assert_eq!(evaluate_gates(&fragments, &config, None), None);

        let mut small = batch(5, 4096, Some(0.005));
        small[0].energy = None;
        // Under 40 KiB the sparse low average still gates.
        assert_eq!(
            evaluate_gates(&small, &config, None),
            Some(SkipReason::Silence)
        );
    }

    #[test]
    fn test_gate_duplicate_hash() {
        let config = PipelineConfig::default();
        let fragments = batch(30, 4096, Some(0.3));
        let hash = combined_hash(&fragments);

        assert_eq!(
            evaluate_gates(&fragments, &config, Some(&hash)),
            Some(SkipReason::Duplicate)
        );
        assert_eq!(evaluate_gates(&fragments, &config, Some("other")), None);
    }

    #[test]
    fn test_gates_pass_audible_batch() {
        let config = PipelineConfig::default();
        let fragments = batch(40, 4096, Some(0.3));
        assert_eq!(evaluate_gates(&fragments, &config, None), None);
    }

    #[test]
    fn test_combined_hash_is_order_sensitive() {
        let a = vec![
            fragment(vec![1; 2048], ContainerHint::WebmOpus, None),
            fragment(vec![2; 2048], ContainerHint::WebmOpus, None),
        ];
        let b = vec![
            fragment(vec![2; 2048], ContainerHint::WebmOpus, None),
            fragment(vec![1; 2048], ContainerHint::WebmOpus, None),
        ];
        assert_ne!(combined_hash(&a), combined_hash(&b));
        assert_eq!(combined_hash(&a), combined_hash(&a));
    }

    #[test]
    fn test_average_energy() {
        let fragments = vec![
            fragment(vec![0; 2048], ContainerHint::WebmOpus, Some(0.2)),
            fragment(vec![0; 2048], ContainerHint::WebmOpus, Some(0.4)),
            fragment(vec![0; 2048], ContainerHint::WebmOpus, None),
        ];
        assert!((average_energy(&fragments).unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(average_energy(&batch(3, 2048, None)), None);
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            choose_strategy(&batch(5, 2048, None)),
            StitchStrategy::FilterGraphConcat
        );
        assert_eq!(
            choose_strategy(&batch(1, 2048, None)),
            StitchStrategy::StreamingPipe
        );

        let mp3s = vec![
            fragment(vec![0; 2048], ContainerHint::Mp3, None),
            fragment(vec![1; 2048], ContainerHint::Mp3, None),
        ];
        assert_eq!(choose_strategy(&mp3s), StitchStrategy::StreamingPipe);

        let mixed = vec![
            fragment(vec![0; 2048], ContainerHint::Mp3, None),
            fragment(vec![1; 2048], ContainerHint::WebmOpus, None),
        ];
        assert_eq!(choose_strategy(&mixed), StitchStrategy::FilterGraphConcat);
    }
}
