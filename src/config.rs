// src/config.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Heartbeat and retry settings for one resuming downloader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// An attempt that receives no chunk within this window is stalled.
    pub heartbeat_timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub retry_delay: Duration,
    /// Retries allowed after the first attempt of a range.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(3000),
            retry_delay: Duration::from_millis(5000),
            max_retries: 5,
        }
    }
}

/// Options for a multi-part download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Number of concurrent parts a fresh download is split into.
    pub number_of_parts: usize,
    /// Largest chunk handed to observers in one notification.
    pub buffer_size: usize,
    pub heartbeat_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// Whole-part restarts allowed once a part's retries are exhausted.
    pub max_retry_download_parts: u32,
    /// Optional throttle. `None` means unlimited.
    pub max_bytes_per_second: Option<u64>,
    /// Window size for the speed monitor.
    pub sample_count: usize,
    /// Sampling window of the throttle; its burst is one window of budget.
    pub throttle_window: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            number_of_parts: 4,
            buffer_size: 4096,
            heartbeat_timeout: retry.heartbeat_timeout,
            retry_delay: retry.retry_delay,
            max_retries: retry.max_retries,
            max_retry_download_parts: 2,
            max_bytes_per_second: None,
            sample_count: 128,
            throttle_window: Duration::from_secs(1),
        }
    }
}

impl DownloadOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            heartbeat_timeout: self.heartbeat_timeout,
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
        }
    }
}
