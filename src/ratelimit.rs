use crate::store::CacheStore;
use crate::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Outbound API surface with its own request budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    PlatformFetch,
    PlatformPost,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::PlatformFetch => "platform-fetch",
            Surface::PlatformPost => "platform-post",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fixed-window request counters kept in the cache store, shared by every
/// process talking to the same platform account.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, max_requests: u64, window: Duration) -> Self {
        Self {
            store,
            max_requests,
            window: window.max(Duration::from_secs(1)),
        }
    }

    /// Count one call attempt against `surface`, refusing it once the window's
    /// budget is spent. Counters only ever reset by expiring.
    pub async fn acquire(&self, surface: Surface) -> Result<(), Error> {
        let window_secs = self.window.as_secs();
        let now_secs = now_millis() / 1000;
        let window_index = now_secs / window_secs;
        let key = format!("ratelimit:{surface}:{window_index}");

        let count = self.store.increment(&key, self.window).await?;
        if count > self.max_requests {
            let reset_at = (window_index + 1) * window_secs;
            let retry_after = Duration::from_secs(reset_at.saturating_sub(now_secs));
            warn!(
                %surface,
                count,
                limit = self.max_requests,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit reached"
            );
            return Err(Error::RateLimited {
                surface: surface.to_string(),
                retry_after,
            });
        }

        debug!(%surface, count, limit = self.max_requests, "Rate limit slot acquired");
        Ok(())
    }
}

/// Minimum gap between mention fetches for an account, guarding the fetch
/// quota against manual triggers.
#[derive(Clone)]
pub struct FetchGate {
    store: Arc<dyn CacheStore>,
    min_gap: Duration,
}

impl FetchGate {
    pub fn new(store: Arc<dyn CacheStore>, min_gap: Duration) -> Self {
        Self { store, min_gap }
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    fn key(account_id: &str) -> String {
        format!("ratelimit:fetch-gap:{account_id}")
    }

    /// Claim the gap for a manual fetch, failing if any fetch happened too recently.
    pub async fn try_manual(&self, account_id: &str) -> Result<(), Error> {
        let key = Self::key(account_id);
        let now = now_millis();

        if self
            .store
            .set_if_absent(&key, &now.to_string(), Some(self.min_gap))
            .await?
        {
            return Ok(());
        }

        let retry_after = self
            .store
            .get(&key)
            .await?
            .and_then(|last| last.parse::<u64>().ok())
            .map(|last| {
                let elapsed = Duration::from_millis(now.saturating_sub(last));
                self.min_gap.saturating_sub(elapsed)
            })
            .unwrap_or(self.min_gap);

        Err(Error::RateLimited {
            surface: "manual-fetch".to_string(),
            retry_after,
        })
    }

    /// Scheduled polls are never refused, but they restart the gap.
    pub async fn record_scheduled(&self, account_id: &str) -> Result<(), Error> {
        self.store
            .set(
                &Self::key(account_id),
                &now_millis().to_string(),
                Some(self.min_gap),
            )
            .await
    }
}
