// src/limiter.rs

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::models::ByteChunkEvent;
use crate::observer::{DownloadObserver, ObserverError};

/// Token-bucket throttle. Attached as an observer it delays the delivering
/// part until the configured rate allows the chunk through.
///
/// The bucket holds one sampling window of budget: over any window the
/// delivered bytes exceed `rate * window` by at most one chunk.
#[derive(Clone)]
pub struct Throttling {
    state: Arc<Mutex<TokenBucket>>,
}

struct TokenBucket {
    /// Burst size: `rate * window`.
    capacity: f64,
    window: Duration,
    /// Available bytes. Negative while a large chunk is being paid off.
    tokens: f64,
    /// Bytes per second. Zero means unlimited.
    rate: f64,
    last_refill: Instant,
}

impl Throttling {
    /// A rate of 0 disables the throttle. The sampling window is one second.
    pub fn new(max_bytes_per_second: u64) -> Self {
        Self::with_window(max_bytes_per_second, Duration::from_secs(1))
    }

    pub fn with_window(max_bytes_per_second: u64, window: Duration) -> Self {
        let rate = max_bytes_per_second as f64;
        let capacity = rate * window.as_secs_f64();
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity,
                window,
                tokens: capacity,
                rate,
                last_refill: Instant::now(),
            })),
        }
    }

    pub async fn set_rate(&self, max_bytes_per_second: u64) {
        let mut bucket = self.state.lock().await;
        bucket.refill();
        bucket.rate = max_bytes_per_second as f64;
        bucket.capacity = bucket.rate * bucket.window.as_secs_f64();
        bucket.tokens = bucket.tokens.min(bucket.capacity);
    }

    pub async fn window(&self) -> Duration {
        self.state.lock().await.window
    }

    pub async fn max_bytes_per_second(&self) -> u64 {
        self.state.lock().await.rate as u64
    }

    /// Takes `amount` bytes of budget, sleeping until it has been earned.
    pub async fn take(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        let wait = {
            let mut bucket = self.state.lock().await;
            if bucket.rate <= 0.0 {
                return;
            }
            bucket.refill();
            bucket.tokens -= amount as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / bucket.rate)
        };

        // Lock is released before sleeping so other parts can queue up behind us.
        tokio::time::sleep(wait).await;
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.rate > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        }
    }
}

#[async_trait]
impl DownloadObserver for Throttling {
    async fn on_chunk(&self, event: &ByteChunkEvent) -> Result<(), ObserverError> {
        self.take(event.len()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_held_after_initial_burst() {
        let throttle = Throttling::new(1000);
        let start = Instant::now();

        for _ in 0..10 {
            throttle.take(500).await;
        }

        // 1000 bytes burst for free, the remaining 4000 need four seconds.
        let elapsed = start.elapsed().as_secs_f64();
        assert!((3.99..=4.01).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_sets_the_burst() {
        let throttle = Throttling::with_window(1000, Duration::from_secs(2));
        assert_eq!(throttle.window().await, Duration::from_secs(2));
        let start = Instant::now();

        for _ in 0..10 {
            throttle.take(500).await;
        }

        // 2000 bytes burst for free, the remaining 3000 need three seconds.
        let elapsed = start.elapsed().as_secs_f64();
        assert!((2.99..=3.01).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_larger_than_bucket_goes_into_debt() {
        let throttle = Throttling::new(100);
        let start = Instant::now();

        throttle.take(350).await;

        let elapsed = start.elapsed().as_secs_f64();
        assert!((2.49..=2.51).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_parts_share_the_budget() {
        let throttle = Throttling::new(1000);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    throttle.take(250).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 5000 bytes at 1000 B/s with a 1000 byte burst.
        let elapsed = start.elapsed().as_secs_f64();
        assert!((3.99..=4.01).contains(&elapsed), "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_is_unlimited() {
        let throttle = Throttling::new(0);
        let start = Instant::now();
        throttle.take(u32::MAX as u64).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
