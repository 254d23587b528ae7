// src/transport.rs

//! Byte-range request plumbing.
//!
//! The rest of the crate talks to the network only through [`RequestIssuer`],
//! so tests can substitute scripted responses for a real server.

use crate::models::DownloadRange;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("partfetch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Body of a range response.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response metadata the downloader cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    /// `Content-Length` of this response body.
    pub content_length: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    /// Full size of the resource, from `Content-Range` (`bytes a-b/N` or `bytes */N`).
    pub resource_size: Option<u64>,
}

impl ResponseMeta {
    pub fn from_headers(status: u16, headers: &HeaderMap) -> Self {
        let header_str = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        Self {
            status,
            content_length: header_str(CONTENT_LENGTH).and_then(|s| s.trim().parse().ok()),
            accept_ranges: header_str(ACCEPT_RANGES)
                .map(|s| s.trim().eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            resource_size: header_str(CONTENT_RANGE).and_then(parse_content_range_total),
        }
    }
}

/// Extracts the complete length from a `Content-Range` header value.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

pub struct RangeResponse {
    pub meta: ResponseMeta,
    pub body: ByteStream,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse").field("meta", &self.meta).finish_non_exhaustive()
    }
}

/// Issues byte-range GET requests.
#[async_trait]
pub trait RequestIssuer: Send + Sync {
    /// Fails only when the server could not be reached; HTTP error statuses
    /// come back in [`ResponseMeta::status`] for the caller to judge.
    async fn issue_range_request(
        &self,
        url: &str,
        range: DownloadRange,
    ) -> Result<RangeResponse, TransportError>;
}

/// [`RequestIssuer`] backed by a reqwest client.
#[derive(Debug, Clone)]
pub struct HttpRequestIssuer {
    client: Client,
}

impl HttpRequestIssuer {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequestIssuer for HttpRequestIssuer {
    async fn issue_range_request(
        &self,
        url: &str,
        range: DownloadRange,
    ) -> Result<RangeResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, range.header_value())
            .send()
            .await?;

        let meta = ResponseMeta::from_headers(response.status().as_u16(), response.headers());
        let body = response.bytes_stream().map_err(TransportError::from).boxed();

        Ok(RangeResponse { meta, body })
    }
}
