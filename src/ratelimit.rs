//! Rate-limit manager (C6): per-bucket concurrency gate reflecting the
//! server's token bucket headers. Safe to call from multiple tasks
//! concurrently (spec.md §5) — state mutation happens only while holding
//! the bucket map's mutex, never across an `.await` of outbound I/O.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Identifies a bucket: app-token calls share one keyed by client id alone;
/// user-token calls get `clientId + userId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    ClientOnly(String),
    ClientAndUser(String, String),
}

impl RateLimitKey {
    pub fn app(client_id: impl Into<String>) -> Self {
        RateLimitKey::ClientOnly(client_id.into())
    }

    pub fn user(client_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        RateLimitKey::ClientAndUser(client_id.into(), user_id.into())
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    remaining: i64,
    reset_at: Option<Instant>,
}

impl Bucket {
    fn fresh() -> Self {
        // Unknown buckets start optimistic: the first call always proceeds,
        // and gets corrected by the first response's headers.
        Self {
            remaining: 1,
            reset_at: None,
        }
    }
}

pub struct RateLimitManager {
    buckets: Mutex<HashMap<RateLimitKey, Bucket>>,
}

impl RateLimitManager {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks (respecting `cancel`) until a slot is available in `key`'s
    /// bucket, then optimistically decrements it.
    pub async fn acquire(&self, key: &RateLimitKey, cancel: &tokio_util::sync::CancellationToken) -> Result<()> {
        loop {
            let wait_until = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(key.clone()).or_insert_with(Bucket::fresh);

                if bucket.remaining >= 1 {
                    bucket.remaining -= 1;
                    None
                } else {
                    bucket.reset_at
                }
            };

            match wait_until {
                None => return Ok(()),
                Some(reset_at) => {
                    debug!(?key, "rate limit bucket exhausted, waiting for reset");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep_until(reset_at) => {}
                    }
                    // loop again: another waiter may have refreshed the bucket already
                }
            }
        }
    }

    /// Updates `remaining`/`resetAt` from the most recent response headers.
    pub async fn update_from_headers(&self, key: &RateLimitKey, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let reset_epoch = headers
            .get("ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        if remaining.is_none() && reset_epoch.is_none() {
            return;
        }

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.clone()).or_insert_with(Bucket::fresh);
        if let Some(r) = remaining {
            bucket.remaining = r;
        }
        if let Some(epoch) = reset_epoch {
            bucket.reset_at = Some(epoch_to_instant(epoch));
        }
    }

    /// Records a `429` carrying `ratelimit-reset = t`: no new call on this
    /// bucket proceeds until `now >= t` (spec.md §8 property 6).
    pub async fn note_429(&self, key: &RateLimitKey, reset_epoch: u64) {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.clone()).or_insert_with(Bucket::fresh);
        bucket.remaining = 0;
        bucket.reset_at = Some(epoch_to_instant(reset_epoch));
    }
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_to_instant(epoch_secs: u64) -> Instant {
    let now_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let now = Instant::now();
    if epoch_secs > now_epoch {
        now + Duration::from_secs(epoch_secs - now_epoch)
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_on_fresh_bucket_proceeds_immediately() {
        let mgr = RateLimitManager::new();
        let cancel = tokio_util::sync::CancellationToken::new();
        mgr.acquire(&RateLimitKey::app("cid"), &cancel).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_reset() {
        let mgr = RateLimitManager::new();
        let key = RateLimitKey::app("cid");
        let cancel = tokio_util::sync::CancellationToken::new();

        // Drain the optimistic first slot, then force remaining to 0 with a
        // reset one second in the future.
        mgr.acquire(&key, &cancel).await.unwrap();
        let reset_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 1;
        mgr.note_429(&key, reset_epoch).await;

        let start = tokio::time::Instant::now();
        mgr.acquire(&key, &cancel).await.unwrap();
        assert!(tokio::time::Instant::now() >= start);
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let mgr = RateLimitManager::new();
        let key = RateLimitKey::app("cid");
        let cancel = tokio_util::sync::CancellationToken::new();

        mgr.acquire(&key, &cancel).await.unwrap();
        let far_future = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
        mgr.note_429(&key, far_future).await;
        cancel.cancel();

        let err = mgr.acquire(&key, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
