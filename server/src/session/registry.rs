//! Session registry and lifecycle operations

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::fragments::{BufferedFragment, ContainerHint, FragmentStore};
use crate::session::pipeline::TickMode;
use crate::session::SessionHandle;
use crate::stitch::AudioStitcher;
use crate::storage::models::SessionStatus;
use crate::storage::{ChunkRepository, SessionRepository, StorageService};
use crate::transcribe::{Summarizer, TranscriptionGateway};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of live sessions and the operations the duplex channel exposes.
///
/// The map lock is held only for insert/remove/lookup; everything slow
/// happens under the per-session pipeline mutex inside the handle.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    pub(crate) store: Arc<FragmentStore>,
    pub(crate) session_repo: SessionRepository,
    pub(crate) chunk_repo: ChunkRepository,
    pub(crate) stitcher: Arc<dyn AudioStitcher>,
    pub(crate) gateway: Arc<TranscriptionGateway>,
    pub(crate) summarizer: Arc<dyn Summarizer>,
    pub(crate) bus: EventBus,
    pub(crate) config: PipelineConfig,
    pub(crate) preserve_debug: bool,
}

impl SessionRegistry {
    /// Create a new registry
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: &StorageService,
        store: Arc<FragmentStore>,
        stitcher: Arc<dyn AudioStitcher>,
        gateway: Arc<TranscriptionGateway>,
        summarizer: Arc<dyn Summarizer>,
        bus: EventBus,
        config: PipelineConfig,
        preserve_debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            session_repo: storage.sessions.clone(),
            chunk_repo: storage.chunks.clone(),
            stitcher,
            gateway,
            summarizer,
            bus,
            config,
            preserve_debug,
        })
    }

    /// Look up a live session handle
    pub(crate) async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(session_id))
    }

    /// Whether a session is currently live in the registry
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub(crate) async fn insert_handle(&self, handle: Arc<SessionHandle>) {
        self.sessions
            .write()
            .await
            .insert(handle.id.clone(), handle);
    }

    pub(crate) async fn remove_handle(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Create a session: persisted row in Recording plus empty live state
    pub async fn initialize_session(
        self: &Arc<Self>,
        session_id: &str,
        user_id: &str,
    ) -> Result<()> {
        if self.contains(session_id).await {
            return Err(Error::bad_state("initialize-session", "already exists"));
        }

        let now = Utc::now();
        let title = format!("Recording {}", now.format("%Y-%m-%d %H:%M"));
        self.session_repo
            .create(session_id, user_id, &title, now)
            .await?;

        let handle = Arc::new(SessionHandle::new(session_id, user_id, now, 0));
        self.insert_handle(handle).await;
        self.bus.emit_status(session_id, SessionStatus::Recording);

        info!("Initialized session {} for user {}", session_id, user_id);
        Ok(())
    }

    /// Accept one fragment into the session buffer and durable store.
    ///
    /// Sub-threshold fragments are dropped silently; a payload that would
    /// push the session past its byte cap fails without being stored.
    pub async fn add_fragment(
        self: &Arc<Self>,
        session_id: &str,
        payload: Vec<u8>,
        hint: ContainerHint,
        energy: Option<f64>,
        client_id: Option<String>,
    ) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let status = handle.status();
        if !status.accepts_fragments() {
            return Err(Error::bad_state("add-fragment", status));
        }

        if (payload.len() as u64) < self.config.min_fragment_bytes {
            debug!(
                "Dropping {}-byte tail fragment for {}",
                payload.len(),
                session_id
            );
            return Ok(());
        }

        {
            let mut buffers = handle.buffers.lock().await;

            // A Cancel that raced this call must not see its directory
            // recreated; the straggler fragment is simply dropped.
            if !handle.status().accepts_fragments() {
                return Ok(());
            }

            if buffers.cumulative_bytes + payload.len() as u64 > self.config.max_session_bytes {
                return Err(Error::BufferOverflow);
            }

            let path = self.store.append(session_id, &payload, hint.ext()).await?;
            buffers.cumulative_bytes += payload.len() as u64;
            buffers.fragments.push(BufferedFragment {
                bytes: payload,
                hint,
                energy,
                client_id,
                path,
            });
        }

        self.arm_scheduler(&handle);
        Ok(())
    }

    /// Pause: ticks stop firing, ingest keeps accepting fragments
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let status = handle.status();
        if status != SessionStatus::Recording {
            return Err(Error::bad_state("pause", status));
        }

        handle.set_status(SessionStatus::Paused);
        self.session_repo
            .set_status(session_id, SessionStatus::Paused)
            .await?;
        self.bus.emit_status(session_id, SessionStatus::Paused);

        info!("Paused session {}", session_id);
        Ok(())
    }

    /// Resume: flips back to Recording and re-arms the scheduler
    pub async fn resume(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let status = handle.status();
        if status != SessionStatus::Paused {
            return Err(Error::bad_state("resume", status));
        }

        handle.set_status(SessionStatus::Recording);
        self.session_repo
            .set_status(session_id, SessionStatus::Recording)
            .await?;
        self.bus.emit_status(session_id, SessionStatus::Recording);
        self.arm_scheduler(&handle);

        info!("Resumed session {}", session_id);
        Ok(())
    }

    /// Stop: drain, finalize, and return the transcript and summary.
    ///
    /// Stopping an already-completed session is idempotent and returns the
    /// stored result.
    pub async fn stop(self: &Arc<Self>, session_id: &str) -> Result<(String, String)> {
        let handle = match self.handle(session_id).await {
            Ok(handle) => handle,
            Err(_) => {
                let row = self
                    .session_repo
                    .get(session_id)
                    .await?
                    .ok_or_else(|| Error::not_found(session_id))?;
                return match row.status {
                    SessionStatus::Completed => Ok((
                        row.transcript_text.unwrap_or_default(),
                        row.summary.unwrap_or_default(),
                    )),
                    status => Err(Error::bad_state("stop", status)),
                };
            }
        };

        let status = handle.status();
        if !status.can_finalize() {
            return Err(Error::bad_state("stop", status));
        }

        // Drain whatever is buffered with one synchronous tick, then clear
        // the in-memory state; the start instant survives for the duration
        // computation and any restored fragments stay on disk for recovery.
        self.run_tick(&handle, TickMode::Drain).await;
        {
            let mut buffers = handle.buffers.lock().await;
            buffers.fragments.clear();
        }

        handle.set_status(SessionStatus::Processing);
        self.session_repo
            .set_status(session_id, SessionStatus::Processing)
            .await?;
        self.bus.emit_status(session_id, SessionStatus::Processing);

        self.finalize(&handle).await
    }

    /// Cancel: tear down the session and discard everything buffered.
    ///
    /// Effective immediately for future ticks; an in-flight tick observes
    /// the flipped status post-flight and discards its result. Idempotent.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let handle = { self.sessions.write().await.remove(session_id) };

        let handle = match handle {
            Some(handle) => handle,
            None => {
                let row = self
                    .session_repo
                    .get(session_id)
                    .await?
                    .ok_or_else(|| Error::not_found(session_id))?;
                return match row.status {
                    SessionStatus::Cancelled => Ok(()),
                    status => Err(Error::bad_state("cancel", status)),
                };
            }
        };

        // A finalization that won the race already left a terminal state.
        match handle.status() {
            SessionStatus::Cancelled => return Ok(()),
            SessionStatus::Completed => {
                return Err(Error::bad_state("cancel", SessionStatus::Completed))
            }
            _ => {}
        }

        handle.set_status(SessionStatus::Cancelled);
        self.session_repo
            .set_status(session_id, SessionStatus::Cancelled)
            .await?;
        self.store
            .purge_session(session_id, self.preserve_debug)
            .await?;
        self.bus.emit_status(session_id, SessionStatus::Cancelled);

        info!("Cancelled session {}", session_id);
        Ok(())
    }

    /// Arm the per-session timer unless one is already running.
    ///
    /// The loop exits when it observes a non-Recording status; the re-check
    /// under the ticker lock closes the race against a concurrent Resume.
    pub(crate) fn arm_scheduler(self: &Arc<Self>, handle: &Arc<SessionHandle>) {
        if handle.status() != SessionStatus::Recording {
            return;
        }

        let mut slot = handle.ticker.lock().unwrap();
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let registry = Arc::clone(self);
        let handle_clone = Arc::clone(handle);
        let period = self.config.chunk_period();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if handle_clone.status() != SessionStatus::Recording {
                    let guard = handle_clone.ticker.lock().unwrap();
                    if handle_clone.status() == SessionStatus::Recording {
                        drop(guard);
                        continue;
                    }
                    debug!("Scheduler disarmed for {}", handle_clone.id);
                    break;
                }
                registry.run_tick(&handle_clone, TickMode::Scheduled).await;
            }
        }));
    }
}
