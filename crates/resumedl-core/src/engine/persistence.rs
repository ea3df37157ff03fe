//! SQLite-backed download history
//!
//! One row per download keyed by guid. The flattened snapshot is stored as
//! JSON next to a few indexed columns used for listing.

use crate::error::EngineError;
use resumedl_types::{CoreEvent, DownloadSnapshot};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::path::Path;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Database connection pool for download history
#[derive(Clone, Debug)]
pub struct HistoryDatabase {
    pool: SqlitePool,
}

impl HistoryDatabase {
    /// Open (creating if needed) the history database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, EngineError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                guid TEXT PRIMARY KEY,
                id INTEGER NOT NULL,
                url TEXT NOT NULL,
                state TEXT NOT NULL,
                received_bytes INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER,
                start_time TEXT NOT NULL,
                snapshot TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened history database at {:?}", path);
        Ok(Self { pool })
    }

    /// Save or update a download
    pub async fn upsert(&self, snapshot: &DownloadSnapshot) -> Result<(), EngineError> {
        let json = serde_json::to_string(snapshot)?;
        let state = serde_json::to_value(snapshot.state)?;

        sqlx::query(
            r#"
            INSERT INTO downloads (guid, id, url, state, received_bytes, total_bytes, start_time, snapshot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(guid) DO UPDATE SET
                id = excluded.id,
                url = excluded.url,
                state = excluded.state,
                received_bytes = excluded.received_bytes,
                total_bytes = excluded.total_bytes,
                snapshot = excluded.snapshot
            "#,
        )
        .bind(snapshot.guid.to_string())
        .bind(snapshot.id as i64)
        .bind(snapshot.url().map(|u| u.to_string()).unwrap_or_default())
        .bind(state.as_str().unwrap_or_default().to_string())
        .bind(snapshot.received_bytes as i64)
        .bind(snapshot.total_bytes.map(|t| t as i64))
        .bind(snapshot.start_time.to_rfc3339())
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every stored download, oldest first
    pub async fn load_all(&self) -> Result<Vec<DownloadSnapshot>, EngineError> {
        let rows = sqlx::query("SELECT guid, snapshot FROM downloads ORDER BY start_time, id")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("snapshot");
            match serde_json::from_str(&json) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    let guid: String = row.get("guid");
                    warn!("Skipping unreadable history entry {}: {}", guid, e);
                }
            }
        }
        Ok(snapshots)
    }

    /// Delete a download
    pub async fn delete(&self, guid: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM downloads WHERE guid = ?")
            .bind(guid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Mirrors core events into a `HistoryDatabase`.
pub struct HistoryWriter;

impl HistoryWriter {
    /// Start writing snapshots from `events` until the sender side closes.
    pub fn spawn(db: HistoryDatabase, mut events: broadcast::Receiver<CoreEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("History writer skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let result = match event {
                    CoreEvent::ManagerGoingDown => break,
                    CoreEvent::DownloadCreated { download } | CoreEvent::DownloadUpdated { download } => {
                        db.upsert(&download).await
                    }
                    CoreEvent::DownloadRemoved { guid, .. } => db.delete(guid).await,
                    CoreEvent::DownloadProgress { .. } | CoreEvent::DownloadOpened { .. } => Ok(()),
                };
                if let Err(e) = result {
                    warn!("Failed to update history: {}", e);
                }
            }
            info!("History writer stopped");
        })
    }
}
