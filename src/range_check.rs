use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::models::DownloadRange;
use crate::transport::{RequestIssuer, TransportError};

#[derive(Debug, Error)]
pub enum RangeCheckError {
    #[error("{url} is unreachable: {source}")]
    UnreachableResource {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("{url} answered the probe with status {status}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("{url} does not advertise a content length")]
    UnknownLength { url: String },
}

/// What the server told us about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeInfo {
    pub total_size: u64,
    pub supports_ranges: bool,
}

#[async_trait]
pub trait RangeChecker: Send + Sync {
    async fn check(&self, url: &str) -> Result<RangeInfo, RangeCheckError>;
}

/// Probes a resource with a one-byte range request.
///
/// A `206` carrying `Content-Range` yields the full size and range support. A
/// `200` means the server ignored the range; its `Content-Length` is the size.
/// A `416` with `bytes */0` is an empty resource.
#[derive(Clone)]
pub struct ProbeRangeChecker {
    issuer: Arc<dyn RequestIssuer>,
}

impl ProbeRangeChecker {
    pub fn new(issuer: Arc<dyn RequestIssuer>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl RangeChecker for ProbeRangeChecker {
    async fn check(&self, url: &str) -> Result<RangeInfo, RangeCheckError> {
        let probe = DownloadRange { start: 0, end: 0 };
        let response = self
            .issuer
            .issue_range_request(url, probe)
            .await
            .map_err(|source| RangeCheckError::UnreachableResource {
                url: url.to_string(),
                source,
            })?;
        // The body is not needed; dropping it closes the connection.
        let meta = response.meta;
        debug!(url, status = meta.status, ?meta.resource_size, "range probe answered");

        let unknown = || RangeCheckError::UnknownLength {
            url: url.to_string(),
        };

        match meta.status {
            206 => Ok(RangeInfo {
                total_size: meta.resource_size.ok_or_else(unknown)?,
                supports_ranges: true,
            }),
            200 => Ok(RangeInfo {
                total_size: meta.content_length.ok_or_else(unknown)?,
                supports_ranges: false,
            }),
            416 if meta.resource_size == Some(0) => Ok(RangeInfo {
                total_size: 0,
                supports_ranges: meta.accept_ranges,
            }),
            status => Err(RangeCheckError::UnexpectedStatus {
                url: url.to_string(),
                status,
            }),
        }
    }
}
