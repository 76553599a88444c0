//! Crash recovery: re-attach in-flight sessions from disk and the database

use crate::error::{Error, Result};
use crate::fragments::{BufferedFragment, ContainerHint};
use crate::session::pipeline::TickMode;
use crate::session::SessionHandle;
use crate::session::SessionRegistry;
use crate::storage::models::SessionStatus;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl SessionRegistry {
    /// Scan the fragment root and re-attach every session the process lost.
    ///
    /// Sessions found in Recording or Paused replay as Recording with their
    /// on-disk fragments reloaded and the scheduler re-armed. Sessions found
    /// in Processing were mid-Stop: they get one synchronous drain tick and
    /// then their interrupted finalization is completed. Directories for
    /// unknown or terminal sessions are left to the retention sweep.
    ///
    /// Returns the number of sessions re-attached.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let root = self.store.root().to_path_buf();
        if !root.exists() {
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| Error::io(format!("Failed to read fragment root: {}", e)))?;

        let mut recovered = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("Failed to enumerate fragment root: {}", e)))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            if session_id == "debug-archive" {
                continue;
            }

            let row = match self.session_repo.get(&session_id).await? {
                Some(row) => row,
                None => {
                    debug!("Skipping orphan fragment directory {}", session_id);
                    continue;
                }
            };

            match row.status {
                SessionStatus::Recording | SessionStatus::Paused | SessionStatus::Processing => {}
                status => {
                    debug!("Skipping {} in terminal state {}", session_id, status);
                    continue;
                }
            }

            if self.contains(&session_id).await {
                continue;
            }

            self.recover_one(&session_id, &row.user_id, row.created_at, row.status)
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} sessions from disk", recovered);
        }
        Ok(recovered)
    }

    async fn recover_one(
        self: &Arc<Self>,
        session_id: &str,
        user_id: &str,
        created_at: chrono::DateTime<chrono::Utc>,
        persisted_status: SessionStatus,
    ) -> Result<()> {
        let paths = self.store.rebuild_queue(session_id).await?;

        let mut fragments = Vec::with_capacity(paths.len());
        let mut cumulative_bytes = 0u64;
        for path in &paths {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Unreadable fragment {} skipped: {}", path.display(), e);
                    continue;
                }
            };
            let hint = path
                .extension()
                .and_then(|e| e.to_str())
                .map(ContainerHint::from_ext)
                .unwrap_or(ContainerHint::WebmOpus);
            cumulative_bytes += bytes.len() as u64;
            fragments.push(BufferedFragment {
                bytes,
                hint,
                // Client energy readings do not survive a restart.
                energy: None,
                client_id: None,
                path: path.clone(),
            });
        }

        let chunk_count = self.chunk_repo.count(session_id).await?;
        let handle = Arc::new(SessionHandle::new(
            session_id,
            user_id,
            created_at,
            chunk_count,
        ));
        {
            let mut buffers = handle.buffers.lock().await;
            buffers.fragments = fragments;
            buffers.cumulative_bytes = cumulative_bytes;
        }
        self.insert_handle(Arc::clone(&handle)).await;

        info!(
            "Re-attached session {} ({} fragments, {} chunks already persisted, was {})",
            session_id,
            paths.len(),
            chunk_count,
            persisted_status
        );

        match persisted_status {
            SessionStatus::Processing => {
                // Mid-Stop at crash time: drain and complete the finalization.
                handle.set_status(SessionStatus::Processing);
                self.run_tick(&handle, TickMode::Drain).await;
                if let Err(e) = self.finalize(&handle).await {
                    warn!("Recovery finalization failed for {}: {}", session_id, e);
                }
            }
            _ => {
                // Recording and Paused both replay as Recording.
                handle.set_status(SessionStatus::Recording);
                if persisted_status != SessionStatus::Recording {
                    self.session_repo
                        .set_status(session_id, SessionStatus::Recording)
                        .await?;
                }
                self.arm_scheduler(&handle);
            }
        }

        Ok(())
    }
}
