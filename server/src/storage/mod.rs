//! Data storage and database operations
//!
//! This module provides the persistence layer for the pipeline: database
//! management, the two repositories the core writes to, and data models.

pub mod database;
pub mod models;
pub mod repositories;

// Re-export commonly used types
pub use database::{DatabaseManager, DatabasePool};
pub use models::*;
pub use repositories::{ChunkRepository, SessionRepository};

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Central storage service that coordinates all data operations
pub struct StorageService {
    /// Database manager
    pub database: Arc<DatabaseManager>,
    /// Session repository
    pub sessions: SessionRepository,
    /// Transcript chunk repository
    pub chunks: ChunkRepository,
}

impl StorageService {
    /// Create a new storage service backed by a database file
    pub async fn new(database_path: &Path) -> Result<Self> {
        let database = Arc::new(DatabaseManager::new(database_path).await?);
        Ok(Self::from_database(database))
    }

    /// Create a storage service on an in-memory database (tests)
    pub async fn new_in_memory() -> Result<Self> {
        let database = Arc::new(DatabaseManager::new_in_memory().await?);
        Ok(Self::from_database(database))
    }

    fn from_database(database: Arc<DatabaseManager>) -> Self {
        let sessions = SessionRepository::new(database.pool().clone());
        let chunks = ChunkRepository::new(database.pool().clone());
        Self {
            database,
            sessions,
            chunks,
        }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        self.database.health_check().await
    }

    /// Close all database connections
    pub async fn shutdown(&self) {
        self.database.close().await;
    }
}
