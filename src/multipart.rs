//! Multi-part download orchestration.
//!
//! A [`MultiPartDownload`] probes the resource once, splits it into parts (or
//! into the gaps left by an earlier run) and drives every part through its own
//! [`ResumingDownloader`] on a separate task. Chunks flow to the observer bus
//! in arrival order; exactly one terminal [`DownloadEvent`] is raised.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DownloadOptions;
use crate::downloader::AttemptError;
use crate::models::{
    clamp_ranges, merge_ranges, residual_ranges, split_evenly, ByteChunkEvent, DownloadRange,
    PartState, PartStatus, SessionSnapshot, SessionStatus,
};
use crate::observer::{
    DownloadEvent, DownloadObserver, ObserverBus, ObserverError, ObserverId, SessionInfo,
    StopReason,
};
use crate::range_check::{RangeCheckError, RangeChecker};
use crate::resuming::{ChunkSink, ResumeError, ResumingDownloader, ResumingDownloaderBuilder};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(#[from] RangeCheckError),
    #[error("download already started")]
    AlreadyStarted,
}

/// How a session ended, decided by whoever gets there first.
#[derive(Clone)]
enum Termination {
    Cancelled,
    Stopped(StopReason),
}

struct Session {
    url: String,
    total_size: u64,
    supports_ranges: bool,
    previously_downloaded: Vec<DownloadRange>,
    max_retry_download_parts: u32,
    downloader: ResumingDownloader,
    parts: Mutex<Vec<PartState>>,
    status: Mutex<SessionStatus>,
    termination: Mutex<Option<Termination>>,
    observers: ObserverBus,
    cancel: CancellationToken,
    started: AtomicBool,
    terminal_raised: AtomicBool,
    outcome: watch::Sender<Option<DownloadEvent>>,
}

/// Handle to a multi-part download session. Cloning is cheap and every clone
/// controls the same session.
#[derive(Clone)]
pub struct MultiPartDownload {
    inner: Arc<Session>,
}

impl MultiPartDownload {
    /// Probes `url` and plans the parts. Nothing is downloaded until
    /// [`start`](Self::start) is called.
    ///
    /// With `previously_downloaded`, only the gaps between those ranges are
    /// fetched, one part per gap. A server without range support gets a single
    /// part covering the whole resource and cannot be resumed.
    pub async fn new(
        url: impl Into<String>,
        options: &DownloadOptions,
        builder: &ResumingDownloaderBuilder,
        range_checker: &dyn RangeChecker,
        previously_downloaded: Option<Vec<DownloadRange>>,
    ) -> Result<Self, SessionError> {
        let url = url.into();
        let info = range_checker.check(&url).await?;
        let total_size = info.total_size;

        let (ranges, previously_downloaded) = if !info.supports_ranges {
            warn!(url = %url, "server does not support range requests, downloading as a single part");
            if previously_downloaded.as_ref().is_some_and(|done| !done.is_empty()) {
                warn!(url = %url, "ignoring previously downloaded ranges");
            }
            (split_evenly(total_size, 1), Vec::new())
        } else if let Some(done) = previously_downloaded {
            let done = merge_ranges(&clamp_ranges(total_size, &done));
            (residual_ranges(total_size, &done), done)
        } else {
            (split_evenly(total_size, options.number_of_parts), Vec::new())
        };

        debug!(url = %url, total_size, parts = ranges.len(), "planned download");

        let (outcome, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Session {
                url,
                total_size,
                supports_ranges: info.supports_ranges,
                previously_downloaded,
                max_retry_download_parts: options.max_retry_download_parts,
                downloader: builder.build(options.buffer_size),
                parts: Mutex::new(ranges.into_iter().map(PartState::new).collect()),
                status: Mutex::new(SessionStatus::Created),
                termination: Mutex::new(None),
                observers: ObserverBus::new(),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                terminal_raised: AtomicBool::new(false),
                outcome,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn total_size(&self) -> u64 {
        self.inner.total_size
    }

    /// `false` when the server ignored range requests and the download runs as
    /// one non-resumable part.
    pub fn supports_ranges(&self) -> bool {
        self.inner.supports_ranges
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    /// Every span known to be on the caller's side: ranges passed in at
    /// construction plus bytes confirmed since. Suitable for a later resume.
    pub fn downloaded_ranges(&self) -> Vec<DownloadRange> {
        let mut ranges = self.inner.previously_downloaded.clone();
        ranges.extend(
            self.inner
                .parts
                .lock()
                .iter()
                .filter_map(|part| part.range.delivered_prefix(part.bytes_delivered)),
        );
        merge_ranges(&ranges)
    }

    /// Registers an observer for all chunks and the terminal event from now on.
    /// Only a weak reference is kept.
    pub fn attach<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: DownloadObserver + 'static,
    {
        let snapshot = self.inner.snapshot();
        observer.on_attach(&SessionInfo {
            url: snapshot.url.clone(),
            total_size: snapshot.total_size,
            downloaded_bytes: snapshot.downloaded_bytes(),
        });
        self.inner.observers.attach(observer)
    }

    pub fn detach(&self, id: ObserverId) -> bool {
        self.inner.observers.detach(id)
    }

    pub fn detach_all(&self) {
        self.inner.observers.detach_all();
    }

    /// Spawns one task per part on the current tokio runtime.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        tokio::spawn(self.inner.clone().run());
        Ok(())
    }

    /// Cancels the session. In-flight attempts are aborted and not retried.
    /// Has no effect once the session reached a terminal state.
    pub fn cancel(&self) {
        {
            let mut termination = self.inner.termination.lock();
            let mut status = self.inner.status.lock();
            if status.is_terminal() || termination.is_some() {
                return;
            }
            *termination = Some(Termination::Cancelled);
            *status = SessionStatus::Cancelled;
        }
        info!(url = %self.inner.url, "download cancelled");
        self.inner.cancel.cancel();

        // A session that never started still owes its listeners the event.
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.inner.clone().run());
        }
    }

    /// Waits for the terminal event.
    pub async fn wait(&self) -> DownloadEvent {
        let mut outcome = self.inner.outcome.subscribe();
        loop {
            let current = outcome.borrow_and_update().clone();
            if let Some(event) = current {
                return event;
            }
            // The sender lives in the session we hold, so this never errors.
            let _ = outcome.changed().await;
        }
    }

    /// The terminal event, if one has been raised.
    pub fn outcome(&self) -> Option<DownloadEvent> {
        self.inner.outcome.borrow().clone()
    }
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            url: self.url.clone(),
            total_size: self.total_size,
            supports_ranges: self.supports_ranges,
            status: *self.status.lock(),
            parts: self.parts.lock().clone(),
            previously_downloaded: self.previously_downloaded.clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        let part_count = self.parts.lock().len();
        let mut handles = Vec::with_capacity(part_count);

        if !self.cancel.is_cancelled() {
            {
                let mut status = self.status.lock();
                if *status == SessionStatus::Created {
                    *status = SessionStatus::Running;
                }
            }
            info!(url = %self.url, total_size = self.total_size, parts = part_count, "download started");

            for index in 0..part_count {
                let session = self.clone();
                handles.push(tokio::spawn(async move { session.run_part(index).await }));
            }
        }

        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(part = index, "part task ended abnormally: {}", e);
                let reason = self.stop_reason_for(index, io::Error::other(e.to_string()));
                self.stop(reason);
            }
        }

        self.finish().await;
    }

    async fn run_part(&self, index: usize) {
        loop {
            let remaining = {
                let mut parts = self.parts.lock();
                let part = &mut parts[index];
                let remaining = part.remaining();
                if remaining.is_none() {
                    part.status = PartStatus::Completed;
                }
                remaining
            };
            let Some(range) = remaining else {
                return;
            };

            let sink = PartSink {
                session: self,
                index,
            };
            match self
                .downloader
                .download(&self.url, range, &sink, &self.cancel)
                .await
            {
                Ok(_) => {
                    self.parts.lock()[index].status = PartStatus::Completed;
                    debug!(part = index, %range, "part completed");
                    return;
                }
                Err(ResumeError::Cancelled) => {
                    debug!(part = index, "part aborted");
                    return;
                }
                Err(ResumeError::PartFailed { source, .. }) => {
                    let restart = {
                        let mut parts = self.parts.lock();
                        let part = &mut parts[index];
                        if part.restarts < self.max_retry_download_parts {
                            part.restarts += 1;
                            part.status = PartStatus::Pending;
                            Some(part.restarts)
                        } else {
                            part.status = PartStatus::Failed;
                            None
                        }
                    };

                    match restart {
                        Some(restart) => {
                            warn!(part = index, restart, "part failed, restarting: {}", source);
                        }
                        None => {
                            let reason = self.stop_reason_for(index, source);
                            self.stop(reason);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn stop_reason_for<E>(&self, index: usize, error: E) -> StopReason
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let parts = self.parts.lock();
        let part = &parts[index];
        StopReason {
            part_index: index,
            range: part.range,
            attempts: part.attempts,
            restarts: part.restarts,
            error: Arc::new(error),
        }
    }

    /// Records a fatal part failure and aborts the remaining parts.
    fn stop(&self, reason: StopReason) {
        {
            let mut termination = self.termination.lock();
            if termination.is_some() {
                return;
            }
            error!(url = %self.url, "download stopped: {}", reason);
            *termination = Some(Termination::Stopped(reason));
        }
        self.cancel.cancel();
    }

    async fn finish(&self) {
        let event = {
            let termination = self.termination.lock().clone();
            let all_complete = self.parts.lock().iter().all(PartState::is_complete);

            let status = match (&termination, all_complete) {
                (Some(Termination::Cancelled), _) => SessionStatus::Cancelled,
                (Some(Termination::Stopped(_)), _) => SessionStatus::Stopped,
                (None, true) => SessionStatus::Completed,
                (None, false) => SessionStatus::Stopped,
            };
            *self.status.lock() = status;
            let session = self.snapshot();

            match termination {
                Some(Termination::Cancelled) => DownloadEvent::Cancelled(session),
                Some(Termination::Stopped(reason)) => DownloadEvent::Stopped { session, reason },
                None if all_complete => DownloadEvent::Completed(session),
                None => {
                    let index = session
                        .parts
                        .iter()
                        .position(|part| !part.is_complete())
                        .unwrap_or_default();
                    let reason = self.stop_reason_for(
                        index,
                        io::Error::other("part ended without completing"),
                    );
                    DownloadEvent::Stopped { session, reason }
                }
            }
        };

        if self.terminal_raised.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(url = %self.url, status = ?event.status(), "download finished");
        self.observers.notify_event(&event).await;
        self.outcome.send_replace(Some(event));
    }
}

/// Routes one part's chunks to the observers and into its [`PartState`].
struct PartSink<'a> {
    session: &'a Session,
    index: usize,
}

#[async_trait]
impl ChunkSink for PartSink<'_> {
    async fn deliver(&self, offset: u64, data: Bytes) -> Result<(), ObserverError> {
        let event = ByteChunkEvent {
            offset,
            data,
            part_index: self.index,
        };
        self.session.observers.notify_chunk(&event).await?;

        let mut parts = self.session.parts.lock();
        let part = &mut parts[self.index];
        part.bytes_delivered += event.len();
        part.status = PartStatus::InProgress;
        Ok(())
    }

    fn attempt_started(&self, attempt: u32, range: DownloadRange) {
        let mut parts = self.session.parts.lock();
        let part = &mut parts[self.index];
        part.attempts += 1;
        part.status = PartStatus::InProgress;
        debug!(part = self.index, attempt, %range, "attempt started");
    }

    fn attempt_failed(&self, error: &AttemptError, will_retry: bool) {
        if will_retry {
            self.session.parts.lock()[self.index].status = if error.is_stall() {
                PartStatus::Stalled
            } else {
                PartStatus::Pending
            };
        }
        debug!(part = self.index, will_retry, stalled = error.is_stall(), "attempt failed");
    }
}
