//! External audio tool invocation (ffmpeg/ffprobe)
//!
//! All three stitch strategies shell out to ffmpeg with piped stdio, a hard
//! timeout and a capped stdout read. The tool is killed on timeout; a broken
//! stdin pipe is tolerated because ffmpeg may legitimately stop reading
//! before the full payload is written.

use super::{choose_strategy, combined_hash, AudioStitcher, StitchStrategy, StitchedAudio};
use crate::config::StitchConfig;
use crate::error::{Error, Result};
use crate::fragments::BufferedFragment;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Expected duration of a stitched chunk, used only for verification warnings
const EXPECTED_CHUNK_SECS: f64 = 30.0;

/// ffmpeg-backed stitcher producing canonical MP3 output
pub struct FfmpegStitcher {
    config: StitchConfig,
    fragment_root: PathBuf,
}

impl FfmpegStitcher {
    /// Create a stitcher; `fragment_root` locates session debug directories
    pub fn new(config: StitchConfig, fragment_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            fragment_root: fragment_root.into(),
        }
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool_timeout_secs)
    }

    fn filter_graph_timeout(&self) -> Duration {
        Duration::from_secs(self.config.filter_graph_timeout_secs)
    }

    fn push_encode_args(&self, args: &mut Vec<String>) {
        args.push("-ar".into());
        args.push(self.config.target_sample_rate.to_string());
        args.push("-ac".into());
        args.push("1".into());
        args.push("-b:a".into());
        args.push(self.config.target_bitrate.clone());
    }

    /// Strategy 1: one invocation, each fragment a separate input, joined by
    /// an audio concat filter graph. The only approach that survives
    /// fragmented WebM, whose header lives in the first fragment only.
    async fn filter_graph_concat(&self, fragments: &[BufferedFragment]) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()
            .map_err(|e| Error::stitch(format!("Failed to create scratch dir: {}", e)))?;
        let output = scratch.path().join("combined.mp3");

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
        ];
        for fragment in fragments {
            args.push("-err_detect".into());
            args.push("ignore_err".into());
            args.push("-fflags".into());
            args.push("+genpts".into());
            if fragment.hint.is_webm() {
                args.push("-f".into());
                args.push("webm".into());
            }
            args.push("-i".into());
            args.push(fragment.path.to_string_lossy().into_owned());
        }
        args.push("-filter_complex".into());
        args.push(build_concat_filter(fragments.len()));
        args.push("-map".into());
        args.push("[out]".into());
        self.push_encode_args(&mut args);
        args.push("-f".into());
        args.push("mp3".into());
        args.push(output.to_string_lossy().into_owned());

        self.run_tool(&args, None, self.filter_graph_timeout()).await?;
        self.read_and_verify(&output).await
    }

    /// Strategy 2: transcode each fragment on its own (failures skipped, not
    /// fatal), then join the intermediates with the concat demuxer in
    /// stream-copy mode.
    async fn transcode_concat(&self, fragments: &[BufferedFragment]) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()
            .map_err(|e| Error::stitch(format!("Failed to create scratch dir: {}", e)))?;

        let mut parts: Vec<PathBuf> = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let part = scratch.path().join(format!("part-{:04}.mp3", i));
            let mut args: Vec<String> = vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-y".into(),
                "-err_detect".into(),
                "ignore_err".into(),
                "-i".into(),
                fragment.path.to_string_lossy().into_owned(),
            ];
            self.push_encode_args(&mut args);
            args.push(part.to_string_lossy().into_owned());

            match self.run_tool(&args, None, self.tool_timeout()).await {
                Ok(_) if part.exists() => parts.push(part),
                Ok(_) => warn!("Fragment transcode produced no file, skipping {}", i),
                Err(e) => warn!("Fragment transcode failed, skipping {}: {}", i, e),
            }
        }

        if parts.is_empty() {
            return Err(Error::stitch("every fragment failed to transcode"));
        }

        let list_path = scratch.path().join("parts.txt");
        let list: String = parts
            .iter()
            .map(|p| format!("file '{}'\n", p.to_string_lossy()))
            .collect();
        tokio::fs::write(&list_path, list)
            .await
            .map_err(|e| Error::stitch(format!("Failed to write concat list: {}", e)))?;

        let output = scratch.path().join("combined.mp3");
        let args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().into_owned(),
        ];

        self.run_tool(&args, None, self.tool_timeout()).await?;
        self.read_and_verify(&output).await
    }

    /// Strategy 3: one process fed the combined bytes over stdin, MP3 read
    /// back from stdout. Fine for single fragments and self-contained
    /// containers.
    async fn streaming_pipe(&self, fragments: &[BufferedFragment]) -> Result<Vec<u8>> {
        let combined: Vec<u8> = fragments.iter().flat_map(|f| f.bytes.iter().copied()).collect();

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-err_detect".into(),
            "ignore_err".into(),
            "-i".into(),
            "pipe:0".into(),
        ];
        self.push_encode_args(&mut args);
        args.push("-f".into());
        args.push("mp3".into());
        args.push("pipe:1".into());

        let bytes = self.run_tool(&args, Some(combined), self.tool_timeout()).await?;
        if bytes.is_empty() {
            return Err(Error::stitch("streaming pipe produced no output"));
        }
        self.verify_duration_of_bytes(&bytes).await;
        Ok(bytes)
    }

    /// Spawn the tool, feed optional stdin, read capped stdout, enforce the
    /// timeout, and require a zero exit status.
    async fn run_tool(
        &self,
        args: &[String],
        stdin_payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        debug!("Invoking {} {}", self.config.ffmpeg_path, args.join(" "));

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::stitch(format!("Failed to spawn {}: {}", self.config.ffmpeg_path, e))
        })?;

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    // A broken pipe just means the tool stopped reading early.
                    let _ = stdin.write_all(&payload).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::stitch("tool stdout unavailable"))?;
        let mut stderr = child.stderr.take();
        let cap = self.config.tool_stdout_max as usize;

        let run = async {
            let mut out = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| Error::stitch(format!("Failed to read tool output: {}", e)))?;
                if n == 0 {
                    break;
                }
                if out.len() + n > cap {
                    return Err(Error::stitch("tool output exceeded the stdout cap"));
                }
                out.extend_from_slice(&buf[..n]);
            }

            let mut err_text = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut err_text).await;
            }

            let status = child
                .wait()
                .await
                .map_err(|e| Error::stitch(format!("Failed to wait for tool: {}", e)))?;
            if !status.success() {
                return Err(Error::stitch(format!(
                    "tool exited with {}: {}",
                    status,
                    err_text.trim()
                )));
            }
            Ok(out)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::stitch(format!(
                "tool timed out after {} s",
                timeout.as_secs()
            ))),
        }
    }

    /// Read a strategy's output file, require it non-empty, probe duration
    async fn read_and_verify(&self, output: &Path) -> Result<Vec<u8>> {
        if !output.exists() {
            return Err(Error::stitch("tool produced no output file"));
        }
        let bytes = tokio::fs::read(output)
            .await
            .map_err(|e| Error::stitch(format!("Failed to read tool output: {}", e)))?;
        if bytes.is_empty() {
            return Err(Error::stitch("tool produced an empty output file"));
        }
        self.verify_duration(output).await;
        Ok(bytes)
    }

    /// Probe in-memory output by way of a scratch file
    async fn verify_duration_of_bytes(&self, bytes: &[u8]) {
        let scratch = match tempfile::tempdir() {
            Ok(d) => d,
            Err(_) => return,
        };
        let path = scratch.path().join("probe.mp3");
        if tokio::fs::write(&path, bytes).await.is_err() {
            return;
        }
        self.verify_duration(&path).await;
    }

    /// Duration verification is advisory: out-of-range output is forwarded
    /// with a warning, never rejected.
    async fn verify_duration(&self, path: &Path) {
        let duration = match self.probe_duration(path).await {
            Some(d) => d,
            None => return,
        };
        if duration < 5.0 {
            warn!(
                "Stitched audio is only {:.1} s, forwarding anyway ({})",
                duration,
                path.display()
            );
        } else if (duration - EXPECTED_CHUNK_SECS).abs() > 5.0 {
            warn!(
                "Stitched audio duration {:.1} s is outside the expected {:.0} s window",
                duration, EXPECTED_CHUNK_SECS
            );
        }
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8(output.stdout).ok()?.trim().parse().ok()
    }

    /// Persist a debug copy of the stitched MP3; these survive cleanup
    async fn save_debug_artifact(&self, session_id: &str, bytes: &[u8]) {
        let dir = self.fragment_root.join(session_id).join("debug");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("Failed to create debug directory: {}", e);
            return;
        }
        let path = dir.join(format!("combined-{}.mp3", Utc::now().timestamp_millis()));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => info!("Saved stitched debug artifact: {}", path.display()),
            Err(e) => warn!("Failed to save debug artifact: {}", e),
        }
    }

    /// Run the strategy chain; `None` means every encode attempt failed
    async fn try_strategies(&self, fragments: &[BufferedFragment]) -> Option<Vec<u8>> {
        let primary = choose_strategy(fragments);

        if primary == StitchStrategy::FilterGraphConcat {
            match self.filter_graph_concat(fragments).await {
                Ok(bytes) => return Some(bytes),
                Err(e) => warn!("Filter-graph concat failed, falling back: {}", e),
            }
            match self.transcode_concat(fragments).await {
                Ok(bytes) => return Some(bytes),
                Err(e) => warn!("Transcode-then-concat failed, falling back: {}", e),
            }
        }

        match self.streaming_pipe(fragments).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Streaming pipe failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl AudioStitcher for FfmpegStitcher {
    async fn stitch(
        &self,
        session_id: &str,
        fragments: &[BufferedFragment],
    ) -> Result<StitchedAudio> {
        if fragments.is_empty() {
            return Err(Error::stitch("empty fragment batch"));
        }

        let content_hash = combined_hash(fragments);
        let engine = base64::engine::general_purpose::STANDARD;

        if let Some(mp3) = self.try_strategies(fragments).await {
            if self.config.debug_save_stitched {
                self.save_debug_artifact(session_id, &mp3).await;
            }
            return Ok(StitchedAudio {
                audio_base64: engine.encode(&mp3),
                mime_type: "audio/mpeg".to_string(),
                content_hash,
            });
        }

        // Last resort: forward the raw bytes with the original container
        // hint. The transcriber may reject them; that is reported upstream,
        // not retried here.
        warn!(
            "All stitch strategies exhausted for {}, forwarding original bytes",
            session_id
        );
        let combined: Vec<u8> = fragments.iter().flat_map(|f| f.bytes.iter().copied()).collect();
        Ok(StitchedAudio {
            audio_base64: engine.encode(&combined),
            mime_type: fragments[0].hint.mime().to_string(),
            content_hash,
        })
    }
}

/// Filter graph of the shape `[0:a][1:a]…[n-1:a] concat=n=N:v=0:a=1 [out]`
fn build_concat_filter(n: usize) -> String {
    let mut filter = String::new();
    for i in 0..n {
        filter.push_str(&format!("[{}:a]", i));
    }
    filter.push_str(&format!("concat=n={}:v=0:a=1[out]", n));
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::ContainerHint;

    #[test]
    fn test_build_concat_filter() {
        assert_eq!(build_concat_filter(1), "[0:a]concat=n=1:v=0:a=1[out]");
        assert_eq!(
            build_concat_filter(3),
            "[0:a][1:a][2:a]concat=n=3:v=0:a=1[out]"
        );
    }

    #[test]
    fn test_encode_args_follow_config() {
        let stitcher = FfmpegStitcher::new(StitchConfig::default(), "/tmp/sessions");
        let mut args = Vec::new();
        stitcher.push_encode_args(&mut args);
        assert_eq!(args, vec!["-ar", "16000", "-ac", "1", "-b:a", "64k"]);
    }

    #[tokio::test]
    async fn test_missing_tool_falls_back_to_passthrough() {
        let config = StitchConfig {
            ffmpeg_path: "/nonexistent/ffmpeg-for-tests".to_string(),
            ffprobe_path: "/nonexistent/ffprobe-for-tests".to_string(),
            ..StitchConfig::default()
        };
        let stitcher = FfmpegStitcher::new(config, "/tmp/sessions");

        let fragments = vec![BufferedFragment {
            bytes: vec![7u8; 4096],
            hint: ContainerHint::WebmOpus,
            energy: Some(0.3),
            client_id: None,
            path: PathBuf::from("/nonexistent/frag.webm"),
        }];

        // With no tool on disk every strategy fails; the original bytes are
        // forwarded under the original container hint.
        let stitched = stitcher.stitch("sess-1", &fragments).await.unwrap();
        assert_eq!(stitched.mime_type, "audio/webm");
        assert_eq!(stitched.content_hash, combined_hash(&fragments));

        let engine = base64::engine::general_purpose::STANDARD;
        let decoded = engine.decode(&stitched.audio_base64).unwrap();
        assert_eq!(decoded, fragments[0].bytes);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let stitcher = FfmpegStitcher::new(StitchConfig::default(), "/tmp/sessions");
        assert!(stitcher.stitch("sess-1", &[]).await.is_err());
    }
}
