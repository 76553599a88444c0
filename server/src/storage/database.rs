//! Database connection and setup utilities

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::{debug, info};

/// Database connection pool type
pub type DatabasePool = Pool<Sqlite>;

/// Database manager for SQLite operations
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    /// Create a new database manager backed by a file and run migrations
    pub async fn new(database_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", database_path.display());

        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::database(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| Error::database(format!("Failed to connect to database: {}", e)))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(manager)
    }

    /// Create an in-memory database (tests and ephemeral deployments).
    ///
    /// A single connection keeps every query on the same in-memory instance.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::database(format!("Failed to open in-memory database: {}", e)))?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        debug!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database(format!("Failed to create migrations table: {}", e)))?;

        self.run_migration("001_initial", include_str!("migrations/001_initial.sql"))
            .await?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Run a single migration
    async fn run_migration(&self, name: &str, sql: &str) -> Result<()> {
        let applied = sqlx::query("SELECT COUNT(*) as count FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::database(format!("Failed to check migration status: {}", e)))?
            .get::<i64, _>("count")
            > 0;

        if applied {
            debug!("Migration '{}' already applied", name);
            return Ok(());
        }

        info!("Applying migration: {}", name);

        // SQLite executes one statement per call; split on the blank-line
        // statement boundaries used in the migration files.
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::database(format!("Failed to apply migration '{}': {}", name, e)))?;
        }

        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database(format!("Failed to record migration '{}': {}", name, e)))?;

        Ok(())
    }

    /// Get database connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::database(format!("Database connectivity failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}
