use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::models::ByteChunkEvent;
use crate::observer::{DownloadEvent, DownloadObserver, ObserverError};

/// Returns the path bytes are written to until the download completes.
/// e.g. `/path/to/file.zip` becomes `/path/to/file.zip.partfetch-part`.
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".partfetch-part");
    PathBuf::from(name)
}

/// Writes chunks at their offsets into a preallocated temporary file.
///
/// Parts finish out of order, so every write seeks first. Writes go through
/// one lock; offsets of different parts never overlap.
pub struct FileSaver {
    destination: PathBuf,
    temporary: PathBuf,
    file: Mutex<File>,
}

impl FileSaver {
    /// Opens (or creates) the temporary file and sizes it to exactly
    /// `total_size`. Existing content up to that size is kept so resumed
    /// downloads find their bytes; anything past it is cut off.
    pub async fn create(destination: impl Into<PathBuf>, total_size: u64) -> io::Result<Self> {
        let destination = destination.into();
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temporary = temporary_path(&destination);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&temporary)
            .await?;
        file.set_len(total_size).await?;
        debug!(path = %temporary.display(), total_size, "opened download file");

        Ok(Self {
            destination,
            temporary,
            file: Mutex::new(file),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn temporary(&self) -> &Path {
        &self.temporary
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    pub async fn flush(&self) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await
    }

    /// Flushes and moves the temporary file to its final name.
    pub async fn finish(&self) -> io::Result<PathBuf> {
        self.flush().await?;
        tokio::fs::rename(&self.temporary, &self.destination).await?;
        Ok(self.destination.clone())
    }
}

#[async_trait]
impl DownloadObserver for FileSaver {
    async fn on_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        self.write(event.offset, &event.data).await?;
        Ok(())
    }

    async fn on_event(&self, _event: &DownloadEvent) {
        if let Err(e) = self.flush().await {
            error!(path = %self.temporary.display(), "failed to flush download file: {}", e);
        }
    }
}
