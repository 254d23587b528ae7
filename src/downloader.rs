use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::models::DownloadRange;
use crate::observer::ObserverError;
use crate::transport::{ByteStream, RequestIssuer, TransportError};

/// Reasons a single attempt at a range can end early.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("unexpected status {status} for range {range}")]
    UnexpectedStatus { status: u16, range: DownloadRange },
    #[error("stream ended after {received} of {expected} bytes")]
    PrematureEnd { expected: u64, received: u64 },
    #[error("server sent {received} bytes for range {range} of {} bytes", .range.len())]
    RangeOverrun { range: DownloadRange, received: u64 },
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("chunk rejected by observer: {0}")]
    Observer(#[from] ObserverError),
}

impl AttemptError {
    pub fn is_stall(&self) -> bool {
        matches!(self, AttemptError::Stalled(_))
    }
}

/// Progress of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Streaming,
    Completed,
    Errored,
}

/// Drives one contiguous range over a single request. Holds no retry logic.
#[derive(Clone)]
pub struct SinglePartDownloader {
    issuer: Arc<dyn RequestIssuer>,
    buffer_size: usize,
}

impl SinglePartDownloader {
    pub fn new(issuer: Arc<dyn RequestIssuer>, buffer_size: usize) -> Self {
        Self {
            issuer,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Issues the request for `range` and returns the streaming attempt.
    pub async fn start(&self, url: &str, range: DownloadRange) -> Result<PartStream, AttemptError> {
        debug!(%range, "issuing range request");
        let response = self.issuer.issue_range_request(url, range).await?;

        let status = response.meta.status;
        let acceptable = status == 206 || (status == 200 && range.start == 0);
        if !acceptable {
            return Err(AttemptError::UnexpectedStatus { status, range });
        }

        Ok(PartStream {
            range,
            body: response.body,
            pending: Bytes::new(),
            delivered: 0,
            buffer_size: self.buffer_size,
            state: AttemptState::Streaming,
        })
    }
}

/// An attempt in the `Streaming` state.
pub struct PartStream {
    range: DownloadRange,
    body: ByteStream,
    pending: Bytes,
    delivered: u64,
    buffer_size: usize,
    state: AttemptState,
}

impl std::fmt::Debug for PartStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartStream")
            .field("range", &self.range)
            .field("pending", &self.pending)
            .field("delivered", &self.delivered)
            .field("buffer_size", &self.buffer_size)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PartStream {
    pub fn range(&self) -> DownloadRange {
        self.range
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Returns the next `(offset, bytes)` slice, at most `buffer_size` long.
    ///
    /// `Ok(None)` means the whole range has been delivered. Once the attempt has
    /// errored every further call reports the stream as finished with an error.
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Bytes)>, AttemptError> {
        loop {
            match self.state {
                AttemptState::Completed => return Ok(None),
                AttemptState::Errored => {
                    return Err(AttemptError::PrematureEnd {
                        expected: self.range.len(),
                        received: self.delivered,
                    })
                }
                AttemptState::Idle | AttemptState::Streaming => {}
            }

            if !self.pending.is_empty() {
                let take = self.buffer_size.min(self.pending.len());
                let data = self.pending.split_to(take);
                let offset = self.range.start + self.delivered;
                self.delivered += take as u64;
                return Ok(Some((offset, data)));
            }

            if self.delivered == self.range.len() {
                self.state = AttemptState::Completed;
                return Ok(None);
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    let received = self.delivered + bytes.len() as u64;
                    if received > self.range.len() {
                        self.state = AttemptState::Errored;
                        return Err(AttemptError::RangeOverrun {
                            range: self.range,
                            received,
                        });
                    }
                    self.pending = bytes;
                }
                Some(Err(e)) => {
                    self.state = AttemptState::Errored;
                    return Err(e.into());
                }
                None => {
                    self.state = AttemptState::Errored;
                    return Err(AttemptError::PrematureEnd {
                        expected: self.range.len(),
                        received: self.delivered,
                    });
                }
            }
        }
    }
}
