//! Session registry, lifecycle and the per-session chunk pipeline
//!
//! Each live session is an `Arc<SessionHandle>` held in the registry map.
//! The handle carries two locks with distinct jobs: `buffers` is the
//! per-session critical section shared by ingest and scheduler ticks, and
//! `status` is a short-lived flag readable without waiting on an in-flight
//! tick, which is what makes Cancel effective immediately.

pub mod finalizer;
pub mod pipeline;
pub mod recovery;
pub mod registry;


pub use pipeline::{TickMode, TickOutcome};
pub use registry::SessionRegistry;

use crate::fragments::BufferedFragment;
use crate::storage::models::SessionStatus;
use chrono::{DateTime, Utc};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Runtime state of one live session
pub struct SessionHandle {
    /// Session identifier
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Lifecycle state; mirrors the persisted row. Never held across await.
    status: StdRwLock<SessionStatus>,
    /// Ingest/tick critical section
    pub(crate) buffers: Mutex<SessionBuffers>,
    /// Armed scheduler task, if any
    pub(crate) ticker: StdMutex<Option<JoinHandle<()>>>,
}

/// Buffered state guarded by the per-session pipeline mutex
pub(crate) struct SessionBuffers {
    /// Fragments awaiting the next tick, in server-receive order
    pub fragments: Vec<BufferedFragment>,
    /// Running total of accepted fragment bytes. Counted against the 2 GiB
    /// session cap and never decremented; consuming a batch does not make
    /// room for more audio.
    pub cumulative_bytes: u64,
    /// Session start instant, survives buffer clears
    pub started_at: DateTime<Utc>,
    /// Content hash of the last successfully transcribed batch
    pub last_hash: Option<String>,
    /// Next chunk index for this session
    pub chunk_count: i64,
}

impl SessionHandle {
    pub(crate) fn new(
        id: &str,
        user_id: &str,
        started_at: DateTime<Utc>,
        chunk_count: i64,
    ) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            status: StdRwLock::new(SessionStatus::Recording),
            buffers: Mutex::new(SessionBuffers {
                fragments: Vec::new(),
                cumulative_bytes: 0,
                started_at,
                last_hash: None,
                chunk_count,
            }),
            ticker: StdMutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap() = status;
    }
}
