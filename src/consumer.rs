use crate::error::with_timeout;
use crate::generator::ReplyGenerator;
use crate::marker::{Claim, ReplyGuard};
use crate::model::{truncate_reply, MentionEvent, ServiceStatus};
use crate::platform::SocialPlatform;
use crate::queue::{Delivery, Queue, Subscription};
use crate::ratelimit::{RateLimiter, Surface};
use crate::service::{Cycle, ServiceContext, Toggle};
use crate::Error;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How long one loop iteration waits for a delivery before checking for stop
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    pub style: String,
    pub max_reply_chars: usize,
    /// Redeliveries allowed before an event is dead-lettered
    pub max_retries: u32,
    pub call_timeout: Duration,
}

/// What became of a delivery that was handled without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Replied { reply_id: String },
    /// A reply had already been posted; acknowledged without posting again
    Duplicate { reply_id: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerMetrics {
    pub processed_count: u64,
    pub error_count: u64,
    pub dead_lettered_count: u64,
    pub topic: String,
    pub consumer_group: String,
    pub style: String,
    pub max_retries: u32,
}

/// Turns queued mentions into posted replies.
pub struct Consumer {
    ctx: Arc<ServiceContext>,
    subscription: tokio::sync::Mutex<Box<dyn Subscription>>,
    guard: ReplyGuard,
    generator: Arc<dyn ReplyGenerator>,
    platform: Arc<dyn SocialPlatform>,
    limiter: RateLimiter,
    config: ConsumerConfig,
    dead_lettered: AtomicU64,
}

impl Consumer {
    /// Join the consumer group. Failing to reach the queue here is fatal to the caller.
    pub async fn connect(
        queue: &dyn Queue,
        guard: ReplyGuard,
        generator: Arc<dyn ReplyGenerator>,
        platform: Arc<dyn SocialPlatform>,
        limiter: RateLimiter,
        config: ConsumerConfig,
    ) -> Result<Self, Error> {
        let subscription = queue.subscribe(&config.topic, &config.group).await?;
        info!(topic = %config.topic, group = %config.group, "Subscribed to mention queue");

        Ok(Self {
            ctx: Arc::new(ServiceContext::new("consumer")),
            subscription: tokio::sync::Mutex::new(subscription),
            guard,
            generator,
            platform,
            limiter,
            config,
            dead_lettered: AtomicU64::new(0),
        })
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

    pub fn metrics(&self) -> ConsumerMetrics {
        let status = self.ctx.status();
        ConsumerMetrics {
            processed_count: status.processed_count,
            error_count: status.error_count,
            dead_lettered_count: self.dead_lettered.load(Ordering::Relaxed),
            topic: self.config.topic.clone(),
            consumer_group: self.config.group.clone(),
            style: self.config.style.clone(),
            max_retries: self.config.max_retries,
        }
    }

    pub async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, Error> {
        self.subscription.lock().await.next(wait).await
    }

    /// Receive and handle at most one delivery. Returns `None` if nothing arrived.
    pub async fn consume_one(&self, wait: Duration) -> Result<Option<HandleOutcome>, Error> {
        match self.receive(wait).await? {
            Some(delivery) => self.handle(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Reply to one delivered mention, then acknowledge it.
    ///
    /// On failure the delivery is handed back for redelivery, or dead-lettered
    /// once it has used up its redelivery budget.
    #[instrument(skip(self, delivery), fields(mention_id = %delivery.event.id, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: &Delivery) -> Result<HandleOutcome, Error> {
        match self.reply(&delivery.event).await {
            Ok(outcome) => {
                if let Err(e) = self.subscription.lock().await.ack(delivery).await {
                    // Redelivery will hit the marker and ack without posting
                    warn!(error = %e, "Failed to acknowledge delivery");
                    self.ctx.record_error(e.to_string());
                    return Err(e);
                }
                match &outcome {
                    HandleOutcome::Replied { reply_id } => {
                        info!(reply_id = %reply_id, "Mention handled");
                        self.ctx.record_success(1);
                    }
                    HandleOutcome::Duplicate { reply_id } => {
                        info!(?reply_id, "Duplicate delivery acknowledged without reply");
                        self.ctx.record_activity();
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.ctx.record_error(e.to_string());
                self.route_failure(delivery, e).await
            }
        }
    }

    async fn route_failure(&self, delivery: &Delivery, cause: Error) -> Result<HandleOutcome, Error> {
        let mut subscription = self.subscription.lock().await;

        if delivery.attempt > self.config.max_retries {
            let failure = Error::PermanentFailure {
                mention_id: delivery.event.id.to_string(),
                attempts: delivery.attempt,
                reason: cause.to_string(),
            };
            error!(error = %failure, "Retry budget exhausted - dead-lettering");
            subscription.dead_letter(delivery, &cause.to_string()).await?;
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            return Err(failure);
        }

        warn!(
            error = %cause,
            retryable = cause.is_retryable(),
            remaining = self.config.max_retries + 1 - delivery.attempt,
            "Reply attempt failed - leaving for redelivery"
        );
        subscription.nack(delivery).await?;
        Err(cause)
    }

    async fn reply(&self, event: &MentionEvent) -> Result<HandleOutcome, Error> {
        let ticket = match self.guard.try_claim(event.id).await? {
            Claim::New(ticket) => ticket,
            Claim::Duplicate { reply_id } => return Ok(HandleOutcome::Duplicate { reply_id }),
        };

        match self.generate_and_post(event).await {
            Ok(reply_id) => {
                if let Err(e) = ticket.complete(&reply_id).await {
                    // The reply is out; acking still prevents a redelivery
                    warn!(error = %e, "Failed to mark reply as posted");
                }
                Ok(HandleOutcome::Replied { reply_id })
            }
            Err(e) => {
                if let Err(release_err) = ticket.release().await {
                    warn!(error = %release_err, "Failed to release reply claim");
                }
                Err(e)
            }
        }
    }

    async fn generate_and_post(&self, event: &MentionEvent) -> Result<String, Error> {
        let timeout = self.config.call_timeout;

        let generated = with_timeout(
            timeout,
            "reply generation",
            self.generator.generate(&event.text, &self.config.style),
        )
        .await?;

        let reply = truncate_reply(&generated, self.config.max_reply_chars);
        if reply.len() < generated.len() {
            debug!(
                generated_chars = generated.chars().count(),
                limit = self.config.max_reply_chars,
                "Truncated generated reply"
            );
        }

        self.limiter.acquire(Surface::PlatformPost).await?;
        with_timeout(
            timeout,
            "reply post",
            self.platform.post_reply(&event.reply_target(), reply),
        )
        .await
    }
}

#[async_trait]
impl Cycle for Consumer {
    async fn run_cycle(&self) {
        // Errors are counted and routed inside handle; only receive failures surface here
        match self.receive(RECEIVE_WAIT).await {
            Ok(Some(delivery)) => {
                let _ = self.handle(&delivery).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to receive from queue");
                self.ctx.record_error(e.to_string());
                // Avoid spinning on a broken subscription
                tokio::time::sleep(RECEIVE_WAIT).await;
            }
        }
    }

    fn next_delay(&self) -> Duration {
        Duration::ZERO
    }
}
