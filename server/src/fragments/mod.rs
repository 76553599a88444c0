//! Durable fragment store
//!
//! Every fragment accepted by ingest is written verbatim to
//! `sessions/<sessionId>/chunk-<receiveMillis>.<ext>` before the ingest call
//! returns, so a crash between ticks loses nothing. The store also keeps the
//! arrival-order queue the scheduler draws batches from, and owns session
//! directory cleanup including the retention sweep.

use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Container format hint supplied by the client per fragment.
///
/// A session may mix hints; the stitcher chooses its strategy per batch,
/// not per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerHint {
    WebmOpus,
    OggOpus,
    Mp3,
    Mp4,
    Aac,
    Flac,
    Wav,
}

impl ContainerHint {
    /// Parse a client MIME string; browser recorders default to WebM-Opus
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.contains("ogg") {
            ContainerHint::OggOpus
        } else if mime.contains("mpeg") || mime.contains("mp3") {
            ContainerHint::Mp3
        } else if mime.contains("mp4") || mime.contains("m4a") {
            ContainerHint::Mp4
        } else if mime.contains("aac") {
            ContainerHint::Aac
        } else if mime.contains("flac") {
            ContainerHint::Flac
        } else if mime.contains("wav") {
            ContainerHint::Wav
        } else {
            ContainerHint::WebmOpus
        }
    }

    /// Recover a hint from the on-disk extension (crash recovery)
    pub fn from_ext(ext: &str) -> Self {
        match ext {
            "ogg" => ContainerHint::OggOpus,
            "mp3" => ContainerHint::Mp3,
            "m4a" => ContainerHint::Mp4,
            "aac" => ContainerHint::Aac,
            "flac" => ContainerHint::Flac,
            "wav" => ContainerHint::Wav,
            _ => ContainerHint::WebmOpus,
        }
    }

    /// On-disk extension for this container
    pub fn ext(&self) -> &'static str {
        match self {
            ContainerHint::WebmOpus => "webm",
            ContainerHint::OggOpus => "ogg",
            ContainerHint::Mp3 => "mp3",
            ContainerHint::Mp4 => "m4a",
            ContainerHint::Aac => "aac",
            ContainerHint::Flac => "flac",
            ContainerHint::Wav => "wav",
        }
    }

    /// MIME string forwarded to the transcriber on pass-through
    pub fn mime(&self) -> &'static str {
        match self {
            ContainerHint::WebmOpus => "audio/webm",
            ContainerHint::OggOpus => "audio/ogg",
            ContainerHint::Mp3 => "audio/mpeg",
            ContainerHint::Mp4 => "audio/mp4",
            ContainerHint::Aac => "audio/aac",
            ContainerHint::Flac => "audio/flac",
            ContainerHint::Wav => "audio/wav",
        }
    }

    /// WebM fragments need header-aware stitching
    pub fn is_webm(&self) -> bool {
        matches!(self, ContainerHint::WebmOpus)
    }
}

/// One buffered fragment: payload bytes plus arrival-order metadata
#[derive(Debug, Clone)]
pub struct BufferedFragment {
    /// Opaque payload exactly as received
    pub bytes: Vec<u8>,
    /// Container format hint
    pub hint: ContainerHint,
    /// Client-measured energy in [0.0, 1.0], when reported
    pub energy: Option<f64>,
    /// Client-supplied fragment identifier, when present
    pub client_id: Option<String>,
    /// Durable location of this fragment
    pub path: PathBuf,
}

/// Durable fragment store rooted at `sessions/`
pub struct FragmentStore {
    root: PathBuf,
    queues: Mutex<HashMap<String, VecDeque<PathBuf>>>,
}

impl FragmentStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one session's fragments
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Debug artifact directory for one session
    pub fn debug_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("debug")
    }

    /// Durably write a fragment and enqueue its path.
    ///
    /// The write is fsynced before the path is returned; a same-millisecond
    /// arrival bumps the timestamp until the name is free, which also keeps
    /// lexical listing order equal to arrival order.
    pub async fn append(&self, session_id: &str, payload: &[u8], ext: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(format!("Failed to create session directory: {}", e)))?;

        let mut millis = Utc::now().timestamp_millis();
        let path = loop {
            let candidate = dir.join(format!("chunk-{}.{}", millis, ext));
            if !candidate.exists() {
                break candidate;
            }
            millis += 1;
        };

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::io(format!("Failed to create fragment file: {}", e)))?;
        file.write_all(payload)
            .await
            .map_err(|e| Error::io(format!("Failed to write fragment: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(format!("Failed to sync fragment: {}", e)))?;

        let mut queues = self.queues.lock().await;
        queues
            .entry(session_id.to_string())
            .or_default()
            .push_back(path.clone());

        debug!(
            "Stored fragment for {}: {} ({} bytes)",
            session_id,
            path.display(),
            payload.len()
        );
        Ok(path)
    }

    /// Remove and return the first `n` paths in arrival order
    pub async fn take_batch(&self, session_id: &str, n: usize) -> Vec<PathBuf> {
        let mut queues = self.queues.lock().await;
        let queue = match queues.get_mut(session_id) {
            Some(q) => q,
            None => return Vec::new(),
        };
        let n = n.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Push paths back to the head of the queue after a failed stitch attempt
    pub async fn restore(&self, session_id: &str, paths: Vec<PathBuf>) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(session_id.to_string()).or_default();
        for path in paths.into_iter().rev() {
            queue.push_front(path);
        }
    }

    /// Delete consumed fragment files after a successful stitch
    pub async fn discard(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove fragment {}: {}", path.display(), e);
            }
        }
    }

    /// Enumerate all fragment files in arrival order (crash recovery)
    pub async fn list(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io(format!("Failed to read session directory: {}", e)))?;

        let mut paths: Vec<(i64, PathBuf)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("Failed to enumerate fragments: {}", e)))?
        {
            let path = entry.path();
            if let Some(millis) = fragment_millis(&path) {
                paths.push((millis, path));
            }
        }

        paths.sort_by_key(|(millis, _)| *millis);
        Ok(paths.into_iter().map(|(_, path)| path).collect())
    }

    /// Rebuild the in-memory queue from disk and return the paths (recovery)
    pub async fn rebuild_queue(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        let paths = self.list(session_id).await?;
        let mut queues = self.queues.lock().await;
        queues.insert(session_id.to_string(), paths.iter().cloned().collect());
        Ok(paths)
    }

    /// Delete a session's directory and forget its queue.
    ///
    /// With `preserve_debug`, stitched debug MP3s are moved to an
    /// out-of-session path before the directory is removed.
    pub async fn purge_session(&self, session_id: &str, preserve_debug: bool) -> Result<()> {
        {
            let mut queues = self.queues.lock().await;
            queues.remove(session_id);
        }

        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(());
        }

        if preserve_debug {
            let debug_dir = self.debug_dir(session_id);
            if debug_dir.exists() {
                let archive = self.root.join("debug-archive").join(session_id);
                if let Some(parent) = archive.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::io(format!("Failed to create debug archive: {}", e)))?;
                }
                tokio::fs::rename(&debug_dir, &archive)
                    .await
                    .map_err(|e| Error::io(format!("Failed to preserve debug artifacts: {}", e)))?;
                info!("Preserved debug artifacts for {} at {}", session_id, archive.display());
            }
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Error::io(format!("Failed to purge session directory: {}", e)))?;

        debug!("Purged session directory: {}", session_id);
        Ok(())
    }

    /// Delete session directories untouched for longer than `retention`.
    ///
    /// Returns the number of directories removed.
    pub async fn sweep_expired(&self, retention: Duration) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::io(format!("Failed to read fragment root: {}", e)))?;

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("Failed to enumerate fragment root: {}", e)))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            // Archived debug artifacts outlive the retention window.
            if entry.file_name() == "debug-archive" {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified < cutoff {
                let session_id = entry.file_name().to_string_lossy().to_string();
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!("Retention sweep failed for {}: {}", path.display(), e);
                    continue;
                }
                let mut queues = self.queues.lock().await;
                queues.remove(&session_id);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Retention sweep removed {} session directories", removed);
        }
        Ok(removed)
    }
}

/// Parse the receive-millis component out of a fragment filename
fn fragment_millis(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("chunk-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_container_hint_mime_parsing() {
        assert_eq!(ContainerHint::from_mime("audio/webm;codecs=opus"), ContainerHint::WebmOpus);
        assert_eq!(ContainerHint::from_mime("audio/ogg; codecs=opus"), ContainerHint::OggOpus);
        assert_eq!(ContainerHint::from_mime("audio/mpeg"), ContainerHint::Mp3);
        assert_eq!(ContainerHint::from_mime("audio/mp4"), ContainerHint::Mp4);
        assert_eq!(ContainerHint::from_mime("audio/x-flac"), ContainerHint::Flac);
        assert_eq!(ContainerHint::from_mime("audio/wav"), ContainerHint::Wav);
        // Unknown strings fall back to the browser default.
        assert_eq!(ContainerHint::from_mime("application/octet-stream"), ContainerHint::WebmOpus);
    }

    #[test]
    fn test_container_hint_ext_roundtrip() {
        for hint in [
            ContainerHint::WebmOpus,
            ContainerHint::OggOpus,
            ContainerHint::Mp3,
            ContainerHint::Mp4,
            ContainerHint::Aac,
            ContainerHint::Flac,
            ContainerHint::Wav,
        ] {
            assert_eq!(ContainerHint::from_ext(hint.ext()), hint);
        }
    }

    #[tokio::test]
    async fn test_append_take_restore_order() {
        let temp = TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path());

        let p1 = store.append("sess-1", b"one", "webm").await.unwrap();
        let p2 = store.append("sess-1", b"two", "webm").await.unwrap();
        let p3 = store.append("sess-1", b"three", "webm").await.unwrap();
        assert!(p1.exists() && p2.exists() && p3.exists());

        let batch = store.take_batch("sess-1", 2).await;
        assert_eq!(batch, vec![p1.clone(), p2.clone()]);

        // A failed stitch pushes the batch back to the head, keeping order.
        store.restore("sess-1", batch).await;
        let batch = store.take_batch("sess-1", 3).await;
        assert_eq!(batch, vec![p1, p2, p3]);

        assert!(store.take_batch("sess-1", 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted_by_receive_millis() {
        let temp = TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path());

        for payload in [b"a".as_slice(), b"b", b"c", b"d"] {
            store.append("sess-1", payload, "webm").await.unwrap();
        }

        let listed = store.list("sess-1").await.unwrap();
        assert_eq!(listed.len(), 4);
        let millis: Vec<i64> = listed.iter().map(|p| fragment_millis(p).unwrap()).collect();
        let mut sorted = millis.clone();
        sorted.sort();
        assert_eq!(millis, sorted);

        // Same-millisecond arrivals got distinct names.
        let unique: std::collections::HashSet<_> = millis.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[tokio::test]
    async fn test_purge_session_removes_directory() {
        let temp = TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path());

        store.append("sess-1", b"data", "webm").await.unwrap();
        assert!(store.session_dir("sess-1").exists());

        store.purge_session("sess-1", false).await.unwrap();
        assert!(!store.session_dir("sess-1").exists());
        assert!(store.take_batch("sess-1", 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_preserves_debug_artifacts() {
        let temp = TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path());

        store.append("sess-1", b"data", "webm").await.unwrap();
        let debug_dir = store.debug_dir("sess-1");
        tokio::fs::create_dir_all(&debug_dir).await.unwrap();
        tokio::fs::write(debug_dir.join("combined-1.mp3"), b"mp3")
            .await
            .unwrap();

        store.purge_session("sess-1", true).await.unwrap();
        assert!(!store.session_dir("sess-1").exists());

        let archived = temp
            .path()
            .join("debug-archive")
            .join("sess-1")
            .join("combined-1.mp3");
        assert!(archived.exists());
    }

    #[tokio::test]
    async fn test_sweep_expired_ignores_fresh_directories() {
        let temp = TempDir::new().unwrap();
        let store = FragmentStore::new(temp.path());

        store.append("sess-1", b"data", "webm").await.unwrap();
        let removed = store.sweep_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.session_dir("sess-1").exists());

        // Zero retention treats everything as expired.
        let removed = store.sweep_expired(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.session_dir("sess-1").exists());
    }
}
