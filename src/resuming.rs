use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::downloader::{AttemptError, SinglePartDownloader};
use crate::models::DownloadRange;
use crate::observer::ObserverError;
use crate::transport::RequestIssuer;

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("download cancelled")]
    Cancelled,
    #[error("range {range} failed after {attempts} attempts ({delivered} bytes delivered): {source}")]
    PartFailed {
        range: DownloadRange,
        delivered: u64,
        attempts: u32,
        #[source]
        source: AttemptError,
    },
}

/// Receives the bytes of a range as they arrive.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// An error rejects the chunk; the attempt fails and the bytes are
    /// requested again.
    async fn deliver(&self, offset: u64, data: Bytes) -> Result<(), ObserverError>;

    fn attempt_started(&self, _attempt: u32, _range: DownloadRange) {}

    fn attempt_failed(&self, _error: &AttemptError, _will_retry: bool) {}
}

enum AttemptEnd {
    Cancelled,
    Failed(AttemptError),
}

impl From<AttemptError> for AttemptEnd {
    fn from(e: AttemptError) -> Self {
        AttemptEnd::Failed(e)
    }
}

/// Adds heartbeat detection and bounded retries on top of a
/// [`SinglePartDownloader`].
#[derive(Clone)]
pub struct ResumingDownloader {
    inner: SinglePartDownloader,
    policy: RetryPolicy,
}

impl ResumingDownloader {
    pub fn new(inner: SinglePartDownloader, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Downloads `range`, resuming after the last delivered byte on every retry.
    pub async fn download(
        &self,
        url: &str,
        range: DownloadRange,
        sink: &dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadRange, ResumeError> {
        let mut delivered = 0u64;
        let mut retries = 0u32;
        let mut attempts = 0u32;

        while let Some(remaining) = range.remaining_after(delivered) {
            if cancel.is_cancelled() {
                return Err(ResumeError::Cancelled);
            }
            attempts += 1;
            sink.attempt_started(attempts, remaining);

            let error = match self.attempt(url, remaining, sink, cancel, &mut delivered).await {
                Ok(()) => break,
                Err(AttemptEnd::Cancelled) => return Err(ResumeError::Cancelled),
                Err(AttemptEnd::Failed(error)) => error,
            };

            let will_retry = retries < self.policy.max_retries;
            sink.attempt_failed(&error, will_retry);
            if !will_retry {
                return Err(ResumeError::PartFailed {
                    range,
                    delivered,
                    attempts,
                    source: error,
                });
            }

            retries += 1;
            warn!(
                %range,
                attempt = attempts,
                delivered,
                retry_in = ?self.policy.retry_delay,
                "attempt failed: {}",
                error
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ResumeError::Cancelled),
                _ = sleep(self.policy.retry_delay) => {}
            }
        }

        debug!(%range, attempts, "range complete");
        Ok(range)
    }

    async fn attempt(
        &self,
        url: &str,
        range: DownloadRange,
        sink: &dyn ChunkSink,
        cancel: &CancellationToken,
        delivered: &mut u64,
    ) -> Result<(), AttemptEnd> {
        let heartbeat = self.policy.heartbeat_timeout;

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptEnd::Cancelled),
            started = timeout(heartbeat, self.inner.start(url, range)) => started,
        };
        let mut stream = started.map_err(|_| AttemptError::Stalled(heartbeat))??;

        loop {
            // The deadline is re-armed for every read.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptEnd::Cancelled),
                next = timeout(heartbeat, stream.next_chunk()) => next,
            };

            let (offset, data) = match next.map_err(|_| AttemptError::Stalled(heartbeat))?? {
                Some(chunk) => chunk,
                None => return Ok(()),
            };
            let len = data.len() as u64;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptEnd::Cancelled),
                result = sink.deliver(offset, data) => result.map_err(AttemptError::from)?,
            }
            *delivered += len;
        }
    }
}

/// Assembles [`ResumingDownloader`]s that share one issuer and retry policy.
#[derive(Clone)]
pub struct ResumingDownloaderBuilder {
    policy: RetryPolicy,
    issuer: Arc<dyn RequestIssuer>,
}

impl ResumingDownloaderBuilder {
    pub fn new(policy: RetryPolicy, issuer: Arc<dyn RequestIssuer>) -> Self {
        Self { policy, issuer }
    }

    pub fn issuer(&self) -> Arc<dyn RequestIssuer> {
        self.issuer.clone()
    }

    pub fn build(&self, buffer_size: usize) -> ResumingDownloader {
        ResumingDownloader::new(
            SinglePartDownloader::new(self.issuer.clone(), buffer_size),
            self.policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, MockServer};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const URL: &str = "http://mock/file.bin";

    fn r(start: u64, end: u64) -> DownloadRange {
        DownloadRange::new(start, end).unwrap()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            heartbeat_timeout: Duration::from_millis(3000),
            retry_delay: Duration::from_millis(5000),
            max_retries,
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<(u64, Bytes)>>,
        started: Mutex<Vec<(u32, DownloadRange, Instant)>>,
        failures: Mutex<Vec<(bool, bool, Instant)>>,
        reject_next: AtomicBool,
    }

    impl RecordingSink {
        fn bytes(&self) -> Vec<u8> {
            let chunks = self.chunks.lock();
            chunks.iter().flat_map(|(_, d)| d.iter().copied()).collect()
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn deliver(&self, offset: u64, data: Bytes) -> Result<(), ObserverError> {
            if self.reject_next.swap(false, Ordering::SeqCst) {
                return Err(ObserverError::Other("rejected".into()));
            }
            self.chunks.lock().push((offset, data));
            Ok(())
        }

        fn attempt_started(&self, attempt: u32, range: DownloadRange) {
            self.started.lock().push((attempt, range, Instant::now()));
        }

        fn attempt_failed(&self, error: &AttemptError, will_retry: bool) {
            self.failures.lock().push((error.is_stall(), will_retry, Instant::now()));
        }
    }

    fn downloader(server: Arc<MockServer>, max_retries: u32) -> ResumingDownloader {
        ResumingDownloaderBuilder::new(policy(max_retries), server).build(128)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalling_max_retries_times_still_completes() {
        let server = Arc::new(MockServer::new(1000).with_chunk_size(100));
        server.script(
            r(0, 999),
            vec![
                Fault::Stall { after: 100 },
                Fault::Stall { after: 100 },
                Fault::Stall { after: 0 },
            ],
        );
        let sink = RecordingSink::default();

        let result = downloader(server.clone(), 3)
            .download(URL, r(0, 999), &sink, &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap(), r(0, 999));
        assert_eq!(sink.bytes(), server.data().to_vec());
        assert_eq!(
            server.requests(),
            vec![r(0, 999), r(100, 999), r(200, 999), r(200, 999)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_stall_too_many_fails_the_part() {
        let server = Arc::new(MockServer::new(1000));
        server.script(r(0, 999), vec![Fault::Stall { after: 0 }; 4]);
        let sink = RecordingSink::default();

        let err = downloader(server.clone(), 3)
            .download(URL, r(0, 999), &sink, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ResumeError::PartFailed {
                range,
                attempts,
                source,
                ..
            } => {
                assert_eq!(range, r(0, 999));
                assert_eq!(attempts, 4);
                assert!(source.is_stall());
            }
            other => panic!("unexpected {other:?}"),
        }
        let failures = sink.failures.lock();
        assert_eq!(failures.len(), 4);
        assert!(failures[..3].iter().all(|(_, retry, _)| *retry));
        assert!(!failures[3].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_detected_at_heartbeat_and_retried_after_delay() {
        let server = Arc::new(MockServer::new(100));
        server.script(r(0, 99), vec![Fault::Stall { after: 0 }]);
        let sink = RecordingSink::default();
        let begin = Instant::now();

        downloader(server, 1)
            .download(URL, r(0, 99), &sink, &CancellationToken::new())
            .await
            .unwrap();

        let failures = sink.failures.lock();
        let (is_stall, will_retry, failed_at) = failures[0];
        assert!(is_stall && will_retry);
        assert_eq!(failed_at - begin, Duration::from_millis(3000));

        let started = sink.started.lock();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].2 - failed_at, Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_resumes_from_delivered_offset() {
        let server = Arc::new(MockServer::new(1000).with_chunk_size(64));
        server.script(r(0, 999), vec![Fault::Drop { after: 300 }, Fault::Truncate { after: 200 }]);
        let sink = RecordingSink::default();

        downloader(server.clone(), 5)
            .download(URL, r(0, 999), &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(server.requests(), vec![r(0, 999), r(300, 999), r(500, 999)]);
        assert_eq!(sink.bytes(), server.data().to_vec());
        let chunks = sink.chunks.lock();
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].0 + pair[0].1.len() as u64, pair[1].0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_chunk_is_requested_again() {
        let server = Arc::new(MockServer::new(256));
        let sink = RecordingSink::default();
        sink.reject_next.store(true, Ordering::SeqCst);

        downloader(server.clone(), 1)
            .download(URL, r(0, 255), &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(server.requests(), vec![r(0, 255), r(0, 255)]);
        assert_eq!(sink.bytes(), server.data().to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_delay_stops_immediately() {
        let server = Arc::new(MockServer::new(100));
        server.script(r(0, 99), vec![Fault::Unreachable]);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(1000)).await;
                cancel.cancel();
            })
        };
        let begin = Instant::now();
        let err = downloader(server.clone(), 5)
            .download(URL, r(0, 99), &sink, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ResumeError::Cancelled));
        assert_eq!(Instant::now() - begin, Duration::from_millis(1000));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_stalled_read() {
        let server = Arc::new(MockServer::new(100));
        server.script(r(0, 99), vec![Fault::Stall { after: 10 }]);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(1000)).await;
                cancel.cancel();
            })
        };
        let err = downloader(server.clone(), 5)
            .download(URL, r(0, 99), &sink, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ResumeError::Cancelled));
        assert!(sink.failures.lock().is_empty());
        assert_eq!(sink.bytes().len(), 10);
        assert_eq!(server.requests().len(), 1);
    }
}
