// src/state_manager.rs

use crate::models::DownloadRange;
use crate::multipart::MultiPartDownload;
use crate::saver::FileSaver;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("failed to flush download file: {0}")]
    Flush(#[from] std::io::Error),
}

/// What is needed to pick an interrupted download back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub url: String,
    pub destination: PathBuf,
    pub total_size: u64,
    /// Spans already written to the destination's temporary file.
    pub ranges: Vec<DownloadRange>,
}

/// Persists resume records to an SQLite database, one per URL.
pub struct ResumeStore {
    conn: Connection,
}

impl ResumeStore {
    /// Opens the database file, creating it and its table if needed.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    /// A store that lives only as long as the process.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS resume_state (
                        url             TEXT PRIMARY KEY,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record for `record.url`.
    pub async fn save(&self, record: &ResumeRecord) -> Result<(), StateError> {
        let data = serde_json::to_string(record)?;
        let url = record.url.clone();
        debug!(url = %url, ranges = record.ranges.len(), "saving resume state");

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO resume_state (url, record) VALUES (?1, ?2)",
                    params![url, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records what `download` has written through `saver`.
    ///
    /// Ranges are captured before the file is flushed, so every span in the
    /// saved record is on disk by the time the record is.
    pub async fn checkpoint(
        &self,
        download: &MultiPartDownload,
        saver: &FileSaver,
    ) -> Result<ResumeRecord, StateError> {
        let record = ResumeRecord {
            url: download.url().to_owned(),
            destination: saver.destination().to_path_buf(),
            total_size: download.total_size(),
            ranges: download.downloaded_ranges(),
        };
        saver.flush().await?;
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn load(&self, url: &str) -> Result<Option<ResumeRecord>, StateError> {
        let url = url.to_owned();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT record FROM resume_state WHERE url = ?1",
                    params![url],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Removes the record for `url`. Returns `false` if there was none.
    pub async fn delete(&self, url: &str) -> Result<bool, StateError> {
        let url = url.to_owned();
        let deleted = self
            .conn
            .call(move |conn| conn.execute("DELETE FROM resume_state WHERE url = ?1", params![url]))
            .await?;
        Ok(deleted > 0)
    }
}
