//! The per-session pipeline tick: batch swap → gates → stitch → transcribe
//! → persist → fan-out
//!
//! Ticks and ingest share the per-session buffers mutex, so a tick never
//! observes a half-appended fragment and two ticks for one session cannot
//! overlap. Failures restore both the in-memory batch and the on-disk queue
//! without advancing the chunk index.

use crate::session::{SessionBuffers, SessionHandle, SessionRegistry};
use crate::stitch::{average_energy, combined_hash, evaluate_gates, SkipReason};
use crate::storage::models::{CreateChunk, SessionStatus};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a tick was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    /// Fired by the per-session timer; a non-Recording status disarms it
    Scheduled,
    /// Fired synchronously by Stop or recovery; bypasses the status guard
    Drain,
}

/// What a tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Status was not Recording; the scheduler stands down
    Disarmed,
    /// Nothing buffered
    Idle,
    /// Batch consumed without a chunk (gate fired)
    Skipped(SkipReason),
    /// Chunk persisted at this index
    Completed(i64),
    /// Transient failure; batch restored for the next tick
    Failed,
    /// Result discarded because the session was cancelled mid-flight
    Discarded,
}

impl SessionRegistry {
    /// Run one pipeline tick for a session
    pub(crate) async fn run_tick(
        &self,
        handle: &Arc<SessionHandle>,
        mode: TickMode,
    ) -> TickOutcome {
        if mode == TickMode::Scheduled && handle.status() != SessionStatus::Recording {
            return TickOutcome::Disarmed;
        }

        let mut buffers = handle.buffers.lock().await;
        if buffers.fragments.is_empty() {
            return TickOutcome::Idle;
        }

        // Atomic swap: the buffered list and the same number of durable
        // paths move out together. The cumulative byte counter is a session
        // cap, not a buffer level, and stays put.
        let batch = std::mem::take(&mut buffers.fragments);
        let batch_bytes: u64 = batch.iter().map(|f| f.bytes.len() as u64).sum();
        let paths = self.store.take_batch(&handle.id, batch.len()).await;

        if let Some(reason) = evaluate_gates(&batch, &self.config, buffers.last_hash.as_deref()) {
            debug!("Skipping batch for {}: {:?}", handle.id, reason);
            // A gate is a successful consumption: the fragments are done.
            self.store.discard(&paths).await;
            return TickOutcome::Skipped(reason);
        }

        let content_hash = combined_hash(&batch);
        let confidence = average_energy(&batch);

        let stitched = match self.stitcher.stitch(&handle.id, &batch).await {
            Ok(stitched) => stitched,
            Err(e) => {
                warn!("Stitch failed for {}: {}", handle.id, e);
                self.restore_batch(handle, &mut buffers, batch, paths)
                    .await;
                return TickOutcome::Failed;
            }
        };

        let text = match self.gateway.transcribe_chunk(&handle.id, &stitched).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Transcription failed for {}: {}", handle.id, e);
                self.restore_batch(handle, &mut buffers, batch, paths)
                    .await;
                return TickOutcome::Failed;
            }
        };

        // Post-flight check: a Cancel that raced the stitch or transcriber
        // call wins, and the result is discarded without a chunk row.
        if handle.status() == SessionStatus::Cancelled {
            debug!("Discarding in-flight result for cancelled session {}", handle.id);
            return TickOutcome::Discarded;
        }

        let chunk_index = buffers.chunk_count;
        let timestamp = Utc::now();
        let chunk = CreateChunk {
            session_id: handle.id.clone(),
            chunk_index,
            text: text.clone(),
            timestamp,
            confidence,
        };

        if let Err(e) = self.chunk_repo.insert(chunk).await {
            warn!("Chunk persist failed for {}: {}", handle.id, e);
            self.restore_batch(handle, &mut buffers, batch, paths)
                .await;
            return TickOutcome::Failed;
        }

        buffers.chunk_count += 1;
        buffers.last_hash = Some(content_hash);
        self.store.discard(&paths).await;

        if !text.trim().is_empty() {
            self.bus
                .emit_transcript_update(&handle.id, chunk_index, &text, timestamp);
        }

        info!(
            "Stored chunk {} for {} ({} fragments, {} bytes)",
            chunk_index,
            handle.id,
            batch.len(),
            batch_bytes
        );
        TickOutcome::Completed(chunk_index)
    }

    /// Put a failed batch back where it came from: head of the in-memory
    /// list and head of the durable queue, so recovery still sees it.
    async fn restore_batch(
        &self,
        handle: &Arc<SessionHandle>,
        buffers: &mut SessionBuffers,
        batch: Vec<crate::fragments::BufferedFragment>,
        paths: Vec<PathBuf>,
    ) {
        if handle.status() == SessionStatus::Cancelled {
            // Cancel already purged the session directory; nothing to keep.
            return;
        }

        // Ingest is blocked on the buffers mutex for the whole tick, so the
        // list is still empty and the batch slots back in at the front.
        let newly_arrived = std::mem::take(&mut buffers.fragments);
        buffers.fragments = batch;
        buffers.fragments.extend(newly_arrived);
        self.store.restore(&handle.id, paths).await;
    }
}
