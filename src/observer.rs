//! Observer bus for download sessions.
//!
//! Observers receive every [`ByteChunkEvent`] and the single terminal
//! [`DownloadEvent`] of the session they are attached to. The bus only keeps
//! weak references, so dropping the last `Arc` to an observer is enough to
//! unregister it and a session never keeps its observers alive.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::models::{ByteChunkEvent, DownloadRange, SessionSnapshot, SessionStatus};

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Session facts handed to an observer when it is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub url: String,
    pub total_size: u64,
    /// Bytes already present at attach time. Earlier chunks are not replayed.
    pub downloaded_bytes: u64,
}

/// Why a session stopped.
#[derive(Debug, Clone)]
pub struct StopReason {
    pub part_index: usize,
    pub range: DownloadRange,
    pub attempts: u32,
    pub restarts: u32,
    pub error: Arc<dyn std::error::Error + Send + Sync>,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "part {} {} failed after {} attempts and {} restarts: {}",
            self.part_index, self.range, self.attempts, self.restarts, self.error
        )
    }
}

/// Terminal lifecycle event. Exactly one is raised per session.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Completed(SessionSnapshot),
    Cancelled(SessionSnapshot),
    Stopped {
        session: SessionSnapshot,
        reason: StopReason,
    },
}

impl DownloadEvent {
    pub fn session(&self) -> &SessionSnapshot {
        match self {
            DownloadEvent::Completed(session) | DownloadEvent::Cancelled(session) => session,
            DownloadEvent::Stopped { session, .. } => session,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            DownloadEvent::Completed(_) => SessionStatus::Completed,
            DownloadEvent::Cancelled(_) => SessionStatus::Cancelled,
            DownloadEvent::Stopped { .. } => SessionStatus::Stopped,
        }
    }
}

/// Something that wants to watch a download. All methods default to no-ops.
#[async_trait]
pub trait DownloadObserver: Send + Sync {
    fn on_attach(&self, _info: &SessionInfo) {}

    /// Called on the delivering part's task. Awaiting here slows that part down.
    /// An error fails the current attempt and the chunk is fetched again.
    async fn on_chunk(&self, _event: &ByteChunkEvent) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn on_event(&self, _event: &DownloadEvent) {}
}

/// Handle returned by [`ObserverBus::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverBus {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Weak<dyn DownloadObserver>)>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: DownloadObserver + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn DownloadObserver> = Arc::downgrade(observer) as Weak<dyn DownloadObserver>;
        self.observers.write().push((id, weak));
        id
    }

    /// Returns `false` if the observer was not attached.
    pub fn detach(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    pub fn detach_all(&self) {
        self.observers.write().clear();
    }

    /// Number of attached observers that are still alive.
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self) -> Vec<Arc<dyn DownloadObserver>> {
        let (live, dead) = {
            let observers = self.observers.read();
            let live: Vec<_> = observers.iter().filter_map(|(_, weak)| weak.upgrade()).collect();
            let dead = observers.len() - live.len();
            (live, dead)
        };
        if dead > 0 {
            trace!(dead, "pruning dropped observers");
            self.observers.write().retain(|(_, weak)| weak.strong_count() > 0);
        }
        live
    }

    /// Delivers a chunk to every observer, returning the first error.
    pub async fn notify_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        let mut first_error = None;
        for observer in self.live() {
            if let Err(e) = observer.on_chunk(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn notify_event(&self, event: &DownloadEvent) {
        for observer in self.live() {
            observer.on_event(event).await;
        }
    }
}
