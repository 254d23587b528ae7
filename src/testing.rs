//! Scripted in-memory server used by unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;

use crate::models::{ByteChunkEvent, DownloadRange};
use crate::observer::{DownloadEvent, DownloadObserver, ObserverError};
use crate::range_check::{RangeCheckError, RangeChecker, RangeInfo};
use crate::transport::{RangeResponse, RequestIssuer, ResponseMeta, TransportError};

/// Misbehaviour applied to one request.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The connection is refused.
    Unreachable,
    /// Sends `after` bytes, then goes silent forever.
    Stall { after: u64 },
    /// Sends `after` bytes, then closes the body.
    Truncate { after: u64 },
    /// Sends `after` bytes, then fails with a transport error.
    Drop { after: u64 },
    /// Appends `extra` bytes past the requested range.
    Overrun { extra: u64 },
    /// Answers with this status and an empty body.
    Status(u16),
}

pub struct MockServer {
    data: Bytes,
    supports_ranges: bool,
    chunk_size: usize,
    scripts: Mutex<Vec<(DownloadRange, VecDeque<Fault>)>>,
    requests: Mutex<Vec<DownloadRange>>,
}

impl MockServer {
    pub fn new(size: usize) -> Self {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        Self {
            data: Bytes::from(data),
            supports_ranges: true,
            chunk_size: 4096,
            scripts: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.supports_ranges = false;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Queues faults for requests whose start offset falls inside `range`.
    /// Each request consumes one fault; later requests are served normally.
    pub fn script(&self, range: DownloadRange, faults: Vec<Fault>) {
        self.scripts.lock().push((range, faults.into()));
    }

    pub fn requests(&self) -> Vec<DownloadRange> {
        self.requests.lock().clone()
    }

    fn next_fault(&self, start: u64) -> Option<Fault> {
        let mut scripts = self.scripts.lock();
        scripts
            .iter_mut()
            .find(|(range, faults)| {
                !faults.is_empty() && range.start <= start && start <= range.end
            })
            .and_then(|(_, faults)| faults.pop_front())
    }

    fn chunked(&self, body: Bytes) -> Vec<Result<Bytes, TransportError>> {
        let mut body = body;
        let mut chunks = Vec::new();
        while !body.is_empty() {
            let take = self.chunk_size.min(body.len());
            chunks.push(Ok(body.split_to(take)));
        }
        chunks
    }
}

#[async_trait]
impl RequestIssuer for MockServer {
    async fn issue_range_request(
        &self,
        _url: &str,
        range: DownloadRange,
    ) -> Result<RangeResponse, TransportError> {
        self.requests.lock().push(range);
        let fault = self.next_fault(range.start);
        let size = self.data.len() as u64;

        match fault {
            Some(Fault::Unreachable) => {
                return Err(TransportError::Connection("connection refused".into()))
            }
            Some(Fault::Status(status)) => {
                return Ok(RangeResponse {
                    meta: ResponseMeta {
                        status,
                        ..Default::default()
                    },
                    body: stream::empty().boxed(),
                })
            }
            _ => {}
        }

        if self.supports_ranges && range.start >= size {
            return Ok(RangeResponse {
                meta: ResponseMeta {
                    status: 416,
                    content_length: Some(0),
                    accept_ranges: true,
                    resource_size: Some(size),
                },
                body: stream::empty().boxed(),
            });
        }

        let (status, mut body, resource_size) = if self.supports_ranges {
            let end = range.end.min(size - 1);
            let slice = self.data.slice(range.start as usize..=end as usize);
            (206, slice.to_vec(), Some(size))
        } else {
            (200, self.data.to_vec(), None)
        };

        let meta = ResponseMeta {
            status,
            content_length: Some(body.len() as u64),
            accept_ranges: self.supports_ranges,
            resource_size,
        };

        let body = match fault {
            Some(Fault::Stall { after }) => {
                body.truncate(after as usize);
                stream::iter(self.chunked(body.into()))
                    .chain(stream::pending())
                    .boxed()
            }
            Some(Fault::Truncate { after }) => {
                body.truncate(after as usize);
                stream::iter(self.chunked(body.into())).boxed()
            }
            Some(Fault::Drop { after }) => {
                body.truncate(after as usize);
                let failure = Err(TransportError::Connection("connection reset".into()));
                stream::iter(self.chunked(body.into()))
                    .chain(stream::iter(vec![failure]))
                    .boxed()
            }
            Some(Fault::Overrun { extra }) => {
                body.extend(std::iter::repeat(0xAA).take(extra as usize));
                stream::iter(self.chunked(body.into())).boxed()
            }
            _ => stream::iter(self.chunked(body.into())).boxed(),
        };

        Ok(RangeResponse { meta, body })
    }
}

/// Range checker answering with fixed facts, leaving the server's scripts
/// untouched by the probe.
pub struct StaticChecker(pub RangeInfo);

#[async_trait]
impl RangeChecker for StaticChecker {
    async fn check(&self, _url: &str) -> Result<RangeInfo, RangeCheckError> {
        Ok(self.0)
    }
}

/// Observer that keeps everything it is told.
#[derive(Default)]
pub struct Collector {
    pub chunks: Mutex<Vec<ByteChunkEvent>>,
    pub events: Mutex<Vec<DownloadEvent>>,
}

impl Collector {
    /// Reassembles delivered chunks into a buffer of `size` bytes.
    pub fn assemble(&self, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        for chunk in self.chunks.lock().iter() {
            let start = chunk.offset as usize;
            out[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
        }
        out
    }

    pub fn delivered(&self) -> u64 {
        self.chunks.lock().iter().map(ByteChunkEvent::len).sum()
    }
}

#[async_trait]
impl DownloadObserver for Collector {
    async fn on_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        self.chunks.lock().push(event.clone());
        Ok(())
    }

    async fn on_event(&self, event: &DownloadEvent) {
        self.events.lock().push(event.clone());
    }
}
