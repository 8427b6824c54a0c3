use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::error::{Error, Result};
use crate::progress::{ProgressRecord, ProgressStore};

/// SQLite-backed progress, one row per show.
#[derive(Clone)]
pub struct SqliteProgressStore {
    inner: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteProgressStore {
    pub fn memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory()?;
        setup_connection(&db)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    pub fn file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let db = rusqlite::Connection::open(file)?;
        setup_connection(&db)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn read(&self, show: &str) -> Result<Option<ProgressRecord>> {
        let db = self.lock()?;

        let row = db
            .query_row(
                "SELECT episode_index, offset_secs, completed FROM progress WHERE show_id = ?1",
                [show],
                |row| {
                    let index: i64 = row.get(0)?;
                    Ok(ProgressRecord {
                        index: usize::try_from(index).unwrap_or(0),
                        offset: row.get(1)?,
                        completed: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    fn write(&self, show: &str, record: &ProgressRecord) -> Result<()> {
        let db = self.lock()?;

        db.execute(
            r#"
            INSERT INTO progress (show_id, episode_index, offset_secs, completed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(show_id) DO UPDATE SET
                episode_index = excluded.episode_index,
                offset_secs = excluded.offset_secs,
                completed = excluded.completed,
                updated_at = excluded.updated_at
            "#,
            (
                show,
                record.index as i64,
                record.offset,
                record.completed,
                Utc::now(),
            ),
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.inner
            .lock()
            .map_err(|_| Error::Persistence("progress database lock poisoned".to_string()))
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn get(&self, show: &str) -> Result<Option<ProgressRecord>> {
        let store = self.clone();
        let show = show.to_string();
        tokio::task::spawn_blocking(move || store.read(&show))
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?
    }

    async fn put(&self, show: &str, record: &ProgressRecord) -> Result<()> {
        let store = self.clone();
        let show = show.to_string();
        let record = *record;
        tokio::task::spawn_blocking(move || store.write(&show, &record))
            .await
            .map_err(|e| Error::Persistence(e.to_string()))?
    }
}

fn setup_connection(db: &rusqlite::Connection) -> Result<()> {
    db.execute_batch(
        r#"
            CREATE TABLE IF NOT EXISTS progress (
                show_id TEXT PRIMARY KEY,
                episode_index INTEGER NOT NULL,
                offset_secs REAL NOT NULL,
                completed INTEGER NOT NULL,
                updated_at DATETIME
            )
            "#,
    )?;

    Ok(())
}
