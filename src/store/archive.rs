//! Archival of finished interviews.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::interview::session::{Confidence, SessionSnapshot};
use crate::store::migrations;

/// Destination for the one-shot summary written when an interview ends.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Persist a finished session. Returns the archive record id.
    async fn store_summary(&self, summary: &SessionSnapshot) -> Result<Uuid, DatabaseError>;

    /// Most recent summaries, newest first.
    async fn recent_summaries(&self, limit: usize) -> Result<Vec<SessionSnapshot>, DatabaseError>;
}

/// libSQL-backed archive.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlArchive {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlArchive {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let archive = Self::from_database(db).await?;
        info!(path = %path.display(), "Archive database opened");
        Ok(archive)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

#[async_trait]
impl Archive for LibSqlArchive {
    async fn store_summary(&self, summary: &SessionSnapshot) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(summary)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let low_confidence_stages = summary
            .extraction_confidence
            .values()
            .filter(|c| **c == Confidence::Low)
            .count() as i64;

        self.conn
            .execute(
                "INSERT INTO interview_summaries
                    (id, final_stage, summary, started_at, completed_at, archived_at, low_confidence_stages)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    summary.stage.to_string(),
                    json,
                    summary.started_at.to_rfc3339(),
                    summary.completed_at.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    low_confidence_stages
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_summary: {e}")))?;

        Ok(id)
    }

    async fn recent_summaries(&self, limit: usize) -> Result<Vec<SessionSnapshot>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT summary FROM interview_summaries ORDER BY archived_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_summaries: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_summaries: {e}")))?
        {
            let json: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("recent_summaries: {e}")))?;
            let summary = serde_json::from_str(&json)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

/// In-process archive, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryArchive {
    summaries: RwLock<Vec<SessionSnapshot>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.summaries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.summaries.read().await.is_empty()
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    async fn store_summary(&self, summary: &SessionSnapshot) -> Result<Uuid, DatabaseError> {
        self.summaries.write().await.push(summary.clone());
        Ok(Uuid::new_v4())
    }

    async fn recent_summaries(&self, limit: usize) -> Result<Vec<SessionSnapshot>, DatabaseError> {
        let summaries = self.summaries.read().await;
        Ok(summaries.iter().rev().take(limit).cloned().collect())
    }
}
