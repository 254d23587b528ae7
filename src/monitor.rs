//! Speed and progress observers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::models::ByteChunkEvent;
use crate::observer::{DownloadEvent, DownloadObserver, ObserverError, SessionInfo};

/// A window whose newest sample is older than this reports zero speed.
const STALE_AFTER: Duration = Duration::from_secs(5);

/// Sliding-window download speed.
#[derive(Debug)]
pub struct SpeedMonitor {
    max_sample_count: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedMonitor {
    pub fn new(max_sample_count: usize) -> Self {
        let max_sample_count = max_sample_count.max(2);
        Self {
            max_sample_count,
            samples: Mutex::new(VecDeque::with_capacity(max_sample_count)),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&self, at: Instant, bytes: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.max_sample_count {
            samples.pop_front();
        }
        samples.push_back((at, bytes));
    }

    /// Total bytes across the window divided by the time between the oldest
    /// and newest sample. Zero for fewer than two samples, a zero-length span,
    /// or a window that went stale.
    pub fn current_bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock();
        let (Some(&(oldest, _)), Some(&(newest, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        if newest.elapsed() > STALE_AFTER {
            return 0.0;
        }
        let span = newest.duration_since(oldest).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / span
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

#[async_trait]
impl DownloadObserver for SpeedMonitor {
    async fn on_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        self.record(event.len());
        Ok(())
    }
}

/// Cumulative progress of one session.
#[derive(Debug, Default)]
pub struct ProgressMonitor {
    total: AtomicU64,
    delivered: AtomicU64,
    completed: AtomicBool,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Downloaded bytes, never reported above the total.
    pub fn progress_bytes(&self) -> u64 {
        let total = self.total_bytes();
        if self.completed.load(Ordering::SeqCst) {
            return total;
        }
        self.delivered.load(Ordering::SeqCst).min(total)
    }

    /// Fraction in `[0, 1]`; exactly 1.0 once the session completed.
    pub fn progress_fraction(&self) -> f64 {
        if self.completed.load(Ordering::SeqCst) {
            return 1.0;
        }
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.progress_bytes() as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn progress_percentage(&self) -> f64 {
        self.progress_fraction() * 100.0
    }
}

#[async_trait]
impl DownloadObserver for ProgressMonitor {
    fn on_attach(&self, info: &SessionInfo) {
        self.total.store(info.total_size, Ordering::SeqCst);
        self.delivered.fetch_max(info.downloaded_bytes, Ordering::SeqCst);
    }

    async fn on_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        self.delivered.fetch_add(event.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn on_event(&self, event: &DownloadEvent) {
        if let DownloadEvent::Completed(_) = event {
            self.completed.store(true, Ordering::SeqCst);
        }
    }
}
