use crate::cursor::CursorStore;
use crate::error::with_timeout;
use crate::model::{MentionEvent, MentionId, ServiceStatus};
use crate::platform::SocialPlatform;
use crate::queue::Queue;
use crate::ratelimit::{FetchGate, RateLimiter, Surface};
use crate::service::{Cycle, ServiceContext, Toggle};
use crate::Error;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Longest accepted polling period
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Resolved platform id of the monitored account; also the partition key
    pub account_id: String,
    pub topic: String,
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub call_timeout: Duration,
}

/// Outcome of one polling round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub fetched: usize,
    pub published: usize,
    pub cursor: Option<MentionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerMetrics {
    pub processed_count: u64,
    pub error_count: u64,
    pub topic: String,
    pub account_id: String,
    pub cursor: Option<MentionId>,
    pub poll_interval_secs: u64,
    pub min_poll_interval_secs: u64,
    pub fetch_min_gap_secs: u64,
}

/// Discovers new mentions and publishes them to the queue.
pub struct Producer {
    ctx: Arc<ServiceContext>,
    platform: Arc<dyn SocialPlatform>,
    queue: Arc<dyn Queue>,
    cursors: CursorStore,
    limiter: RateLimiter,
    gate: FetchGate,
    config: ProducerConfig,
    interval: Mutex<Duration>,
    /// Held for a whole round so scheduled and manual polls never overlap
    round: tokio::sync::Mutex<()>,
}

impl Producer {
    pub fn new(
        platform: Arc<dyn SocialPlatform>,
        queue: Arc<dyn Queue>,
        cursors: CursorStore,
        limiter: RateLimiter,
        gate: FetchGate,
        config: ProducerConfig,
    ) -> Self {
        let interval = config
            .poll_interval
            .max(config.min_poll_interval)
            .min(MAX_POLL_INTERVAL);
        Self {
            ctx: Arc::new(ServiceContext::new("producer")),
            platform,
            queue,
            cursors,
            limiter,
            gate,
            config,
            interval: Mutex::new(interval),
            round: tokio::sync::Mutex::new(()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.config.account_id
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> ServiceStatus {
        self.ctx.status()
    }

    pub async fn start(self: &Arc<Self>) -> Toggle {
        self.ctx.start(Arc::clone(self)).await
    }

    pub async fn stop(&self) -> Toggle {
        self.ctx.stop().await
    }

    /// Change the polling period. Applies to the running loop immediately.
    pub fn set_interval(&self, seconds: u64) -> Result<Duration, Error> {
        let floor = self.config.min_poll_interval.as_secs();
        if seconds < floor {
            return Err(Error::Validation(format!(
                "Interval must be at least {floor} seconds"
            )));
        }
        let ceiling = MAX_POLL_INTERVAL.as_secs();
        if seconds > ceiling {
            return Err(Error::Validation(format!(
                "Interval must be at most {ceiling} seconds"
            )));
        }

        let interval = Duration::from_secs(seconds);
        *self.interval.lock().unwrap_or_else(|p| p.into_inner()) = interval;
        self.ctx.reschedule();
        info!(interval_secs = seconds, "Polling interval updated");
        Ok(interval)
    }

    /// Out-of-band poll, refused when any fetch happened within the minimum gap.
    pub async fn fetch(&self) -> Result<PollReport, Error> {
        self.gate.try_manual(&self.config.account_id).await?;
        info!(account = %self.config.account_id, "Manual fetch triggered");
        self.poll().await
    }

    /// Publish every mention newer than the cursor, oldest first.
    ///
    /// A failed publish ends the round with the cursor on the last event that
    /// made it into the queue, so the rest are fetched again next round.
    /// Rounds are serialised: a poll waits for any round already in flight.
    #[instrument(skip(self), fields(account = %self.config.account_id))]
    pub async fn poll(&self) -> Result<PollReport, Error> {
        let _round = self.round.lock().await;
        let result = self.poll_round().await;
        if let Err(e) = &result {
            warn!(error = %e, retryable = e.is_retryable(), "Polling round failed");
            self.ctx.record_error(e.to_string());
        }
        result
    }

    async fn poll_round(&self) -> Result<PollReport, Error> {
        let account = self.config.account_id.as_str();
        let timeout = self.config.call_timeout;

        let cursor = with_timeout(timeout, "cursor read", self.cursors.load(account)).await?;
        self.limiter.acquire(Surface::PlatformFetch).await?;
        let mut mentions = with_timeout(
            timeout,
            "mention fetch",
            self.platform.fetch_mentions(account, cursor),
        )
        .await?;

        let fetched = mentions.len();
        mentions.retain(|m| cursor.map_or(true, |c| m.id > c));
        mentions.sort_by_key(|m| m.id);
        mentions.dedup_by_key(|m| m.id);
        debug!(fetched, new = mentions.len(), cursor = ?cursor, "Fetched mentions");

        let mut published = 0;
        let mut last_published = None;
        for mention in mentions {
            let id = mention.id;
            let event = MentionEvent::ingest(mention, Utc::now());

            let sent = with_timeout(
                timeout,
                "publish",
                self.queue.publish(&self.config.topic, account, &event),
            )
            .await;

            if let Err(e) = sent {
                warn!(mention_id = %id, published, error = %e, "Publish failed - ending round early");
                self.ctx.record_success(published as u64);
                if let Some(last) = last_published {
                    with_timeout(timeout, "cursor write", self.cursors.advance(account, last))
                        .await?;
                }
                return Err(e);
            }

            published += 1;
            last_published = Some(id);
        }

        let cursor = match last_published {
            Some(last) => Some(
                with_timeout(timeout, "cursor write", self.cursors.advance(account, last)).await?,
            ),
            None => cursor,
        };
        self.ctx.record_success(published as u64);

        if published > 0 {
            info!(fetched, published, cursor = ?cursor, "Published new mentions");
        }
        Ok(PollReport {
            fetched,
            published,
            cursor,
        })
    }

    pub async fn metrics(&self) -> Result<ProducerMetrics, Error> {
        let status = self.ctx.status();
        let cursor = self.cursors.load(&self.config.account_id).await?;
        Ok(ProducerMetrics {
            processed_count: status.processed_count,
            error_count: status.error_count,
            topic: self.config.topic.clone(),
            account_id: self.config.account_id.clone(),
            cursor,
            poll_interval_secs: self.interval().as_secs(),
            min_poll_interval_secs: self.config.min_poll_interval.as_secs(),
            fetch_min_gap_secs: self.gate.min_gap().as_secs(),
        })
    }
}

#[async_trait]
impl Cycle for Producer {
    async fn run_cycle(&self) {
        if let Err(e) = self.gate.record_scheduled(&self.config.account_id).await {
            warn!(error = %e, "Failed to record scheduled fetch");
        }
        // Failures are already counted and logged by poll
        let _ = self.poll().await;
    }

    fn next_delay(&self) -> Duration {
        self.interval()
    }
}
