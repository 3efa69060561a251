//! Durable update store (SQLite via sqlx).
//!
//! Holds three kinds of rows keyed by task id: resume payloads for paused
//! tasks, and status/progress updates that could not be delivered because no
//! consumer was attached. Reads are destructive pops so a consumer attaching
//! after a restart drains the backlog exactly once per store.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::message::{ProgressUpdate, ResumeData, StatusUpdate};
use crate::task::TaskId;

/// Percent-encode a path for a sqlite:// URI so spaces and special characters
/// don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Handle to the SQLite-backed update store.
///
/// The database file lives under the XDG state directory:
/// `~/.local/state/fetchq/updates.db`.
#[derive(Clone)]
pub struct UpdateStore {
    pool: Pool<Sqlite>,
}

impl UpdateStore {
    /// Open (or create) the default store and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchq")?;
        let state_dir = xdg_dirs.get_state_home();
        let db_path = state_dir.join("updates.db");
        tokio::fs::create_dir_all(&state_dir).await?;

        let uri = path_to_sqlite_uri(&db_path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await?;
        let store = UpdateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (or create) the store at a specific path, creating parent dirs.
    /// Intended for tests so the DB can live in a temp directory.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await?;
        let store = UpdateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store (no disk I/O).
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = UpdateStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // One resume row per task (replaced on re-pause); status and progress
        // rows accumulate in arrival order until popped.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resume_data (
                task_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS status_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS progress_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace the resume payload for a task.
    pub async fn put_resume_data(&self, data: &ResumeData) -> Result<()> {
        let payload = serde_json::to_string(data)?;
        sqlx::query(
            r#"
            INSERT INTO resume_data (task_id, payload, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(task_id) DO UPDATE SET payload = ?2, created_at = ?3
            "#,
        )
        .bind(&data.task_id)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically read and clear the resume payload for a task.
    pub async fn pop_resume_data(&self, task_id: &str) -> Result<Option<ResumeData>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT payload FROM resume_data WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        sqlx::query("DELETE FROM resume_data WHERE task_id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let payload: String = row.get("payload");
        Ok(Some(serde_json::from_str(&payload)?))
    }

    /// Append an undelivered status update.
    pub async fn put_status_update(&self, update: &StatusUpdate) -> Result<()> {
        let payload = serde_json::to_string(update)?;
        sqlx::query(
            "INSERT INTO status_updates (task_id, payload, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&update.task.id)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append an undelivered progress update, replacing any earlier ones for
    /// the same task (only the latest sample matters).
    pub async fn put_progress_update(&self, update: &ProgressUpdate) -> Result<()> {
        let payload = serde_json::to_string(update)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM progress_updates WHERE task_id = ?1")
            .bind(&update.task.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO progress_updates (task_id, payload, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&update.task.id)
        .bind(payload)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomically read and clear all stored status updates, oldest first.
    pub async fn pop_status_updates(&self) -> Result<Vec<StatusUpdate>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT payload FROM status_updates ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM status_updates").execute(&mut *tx).await?;
        tx.commit().await?;

        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            match serde_json::from_str(&payload) {
                Ok(u) => updates.push(u),
                Err(e) => tracing::warn!("dropping unreadable stored status update: {}", e),
            }
        }
        Ok(updates)
    }

    /// Atomically read and clear all stored progress updates, oldest first.
    pub async fn pop_progress_updates(&self) -> Result<Vec<ProgressUpdate>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT payload FROM progress_updates ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM progress_updates").execute(&mut *tx).await?;
        tx.commit().await?;

        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            match serde_json::from_str(&payload) {
                Ok(u) => updates.push(u),
                Err(e) => tracing::warn!("dropping unreadable stored progress update: {}", e),
            }
        }
        Ok(updates)
    }

    /// Stored task ids with resume payloads (not cleared). Lets embedders list
    /// what can be resumed after a restart.
    pub async fn resumable_task_ids(&self) -> Result<Vec<TaskId>> {
        let rows = sqlx::query("SELECT task_id FROM resume_data ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("task_id")).collect())
    }
}
