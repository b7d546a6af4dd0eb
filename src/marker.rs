use crate::error::Error;
use crate::model::{Backoff, MarkerStatus, MentionId, ReplyMarker};
use crate::store::CacheStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the reply idempotency guard
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Unique identifier for this consumer instance
    pub processor_id: Uuid,
    /// How long a pending claim is honoured before another consumer may take it over
    pub max_processing_time: Duration,
    /// Lifetime of a marker in the cache store
    pub ttl: Duration,
    /// How to wait on a claim held by someone else
    pub poll: Backoff,
}

impl GuardConfig {
    pub fn new(
        processor_id: Uuid,
        max_processing_time: Duration,
        ttl: Duration,
        poll: Backoff,
    ) -> Self {
        Self {
            processor_id,
            max_processing_time,
            ttl,
            poll,
        }
    }
}

/// The outcome of claiming a mention for reply
pub enum Claim {
    /// Nobody has replied yet; the ticket must be completed or released
    New(ClaimTicket),
    /// A reply was already posted for this mention
    Duplicate { reply_id: Option<String> },
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New(ticket) => f
                .debug_tuple("New")
                .field(&ticket.marker.mention_id)
                .finish(),
            Self::Duplicate { reply_id } => f
                .debug_struct("Duplicate")
                .field("reply_id", reply_id)
                .finish(),
        }
    }
}

/// Exclusive right to reply to one mention
pub struct ClaimTicket {
    store: Arc<dyn CacheStore>,
    key: String,
    marker: ReplyMarker,
    ttl: Duration,
}

impl ClaimTicket {
    pub fn mention_id(&self) -> MentionId {
        self.marker.mention_id
    }

    /// Record that the reply has been posted.
    pub async fn complete(self, reply_id: &str) -> Result<(), Error> {
        let mut marker = self.marker;
        marker.posted_at = Some(Utc::now());
        marker.reply_id = Some(reply_id.to_string());

        let encoded = serde_json::to_string(&marker)?;
        self.store.set(&self.key, &encoded, Some(self.ttl)).await
    }

    /// Give the claim up after a failed attempt so a redelivery can retry.
    /// Leaves the marker alone if another consumer has taken it over meanwhile.
    pub async fn release(self) -> Result<(), Error> {
        let current = match self.store.get(&self.key).await? {
            Some(raw) => decode_marker(&raw)?,
            None => return Ok(()),
        };

        if current.processor_id == self.marker.processor_id
            && current.started_at == self.marker.started_at
            && !current.is_posted()
        {
            self.store.delete(&self.key).await?;
        }
        Ok(())
    }
}

fn decode_marker(raw: &str) -> Result<ReplyMarker, Error> {
    serde_json::from_str(raw).map_err(|e| Error::Decoding(e.to_string()))
}

/// Guarantees at most one posted reply per mention across redeliveries and
/// consumer instances.
///
/// A claim is an atomic `set_if_absent` of a pending [`ReplyMarker`] under
/// `reply:{mention_id}`; completing it upgrades the marker to posted.
pub struct ReplyGuard {
    store: Arc<dyn CacheStore>,
    config: GuardConfig,
}

impl ReplyGuard {
    pub fn new(store: Arc<dyn CacheStore>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn key(id: MentionId) -> String {
        format!("reply:{id}")
    }

    /// Try to claim the right to reply to a mention.
    ///
    /// Returns either:
    /// - `Claim::New` when this consumer should generate and post the reply
    /// - `Claim::Duplicate` when a reply has already been posted
    ///
    /// A live claim held elsewhere is waited on according to the poll backoff,
    /// then taken over once it is abandoned or the wait is exhausted. A takeover
    /// only succeeds against the exact marker that was read, so two consumers
    /// racing for the same stale claim cannot both win it.
    #[instrument(skip(self), fields(mention_id = %id))]
    pub async fn try_claim(&self, id: MentionId) -> Result<Claim, Error> {
        debug!("Attempting to claim mention");

        if let Some(ticket) = self.insert_pending(id).await? {
            info!("New claim - no previous marker found");
            return Ok(Claim::New(ticket));
        }

        let poll = self.config.poll;
        let mut started = Instant::now();
        let mut attempt = 0;

        loop {
            match self.current_marker(id).await? {
                None => {
                    // Released by its holder after a failure, or expired
                    if let Some(ticket) = self.insert_pending(id).await? {
                        info!("Previous marker gone - claiming");
                        return Ok(Claim::New(ticket));
                    }
                }
                Some((_, MarkerStatus::Posted(reply_id))) => {
                    info!(?reply_id, "Reply already posted - skipping");
                    return Ok(Claim::Duplicate { reply_id });
                }
                Some((raw, MarkerStatus::Abandoned)) => {
                    info!("Previous claim abandoned - taking over");
                    if let Some(ticket) = self.take_over(id, &raw).await? {
                        return Ok(Claim::New(ticket));
                    }
                    info!("Another consumer took the claim over first - will poll");
                    started = Instant::now();
                    attempt = 0;
                }
                Some((raw, MarkerStatus::Pending)) => {
                    if started.elapsed() >= poll.max_duration() {
                        warn!("Polling exceeded max duration - treating claim as abandoned");
                        if let Some(ticket) = self.take_over(id, &raw).await? {
                            return Ok(Claim::New(ticket));
                        }
                        started = Instant::now();
                        attempt = 0;
                    } else if attempt == 0 {
                        warn!("Mention is being handled elsewhere - will poll");
                    }
                }
            }

            sleep(poll.delay_for(attempt)).await;
            attempt += 1;
            debug!(attempt, "Polling pending claim");
        }
    }

    async fn insert_pending(&self, id: MentionId) -> Result<Option<ClaimTicket>, Error> {
        let marker = ReplyMarker::pending(id, self.config.processor_id, Utc::now());
        let encoded = serde_json::to_string(&marker)?;
        let key = Self::key(id);

        let inserted = self
            .store
            .set_if_absent(&key, &encoded, Some(self.config.ttl))
            .await?;

        Ok(inserted.then(|| self.ticket(key, marker)))
    }

    /// Replace the marker that was read, if nobody has changed it since.
    async fn take_over(&self, id: MentionId, observed: &str) -> Result<Option<ClaimTicket>, Error> {
        let marker = ReplyMarker::pending(id, self.config.processor_id, Utc::now());
        let encoded = serde_json::to_string(&marker)?;
        let key = Self::key(id);

        let swapped = self
            .store
            .compare_and_set(&key, observed, &encoded, Some(self.config.ttl))
            .await?;

        Ok(swapped.then(|| self.ticket(key, marker)))
    }

    fn ticket(&self, key: String, marker: ReplyMarker) -> ClaimTicket {
        ClaimTicket {
            store: Arc::clone(&self.store),
            key,
            marker,
            ttl: self.config.ttl,
        }
    }

    async fn current_marker(
        &self,
        id: MentionId,
    ) -> Result<Option<(String, MarkerStatus)>, Error> {
        let Some(raw) = self.store.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        let status = decode_marker(&raw)?.status(Utc::now(), self.config.max_processing_time);
        Ok(Some((raw, status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn guard(store: Arc<dyn CacheStore>) -> ReplyGuard {
        ReplyGuard::new(
            store,
            GuardConfig::new(
                Uuid::new_v4(),
                Duration::from_secs(120),
                Duration::from_secs(86_400),
                Backoff::linear(Duration::from_millis(100), Duration::from_secs(5)),
            ),
        )
    }

    #[tokio::test]
    async fn test_second_claim_after_completion_is_duplicate() {
        let guard = guard(Arc::new(MemoryStore::new()));

        let Claim::New(ticket) = guard.try_claim(MentionId(101)).await.unwrap() else {
            panic!("first claim should be new");
        };
        ticket.complete("9001").await.unwrap();

        match guard.try_claim(MentionId(101)).await.unwrap() {
            Claim::Duplicate { reply_id } => assert_eq!(reply_id.as_deref(), Some("9001")),
            Claim::New(_) => panic!("expected duplicate"),
        }
    }

    #[tokio::test]
    async fn test_released_claim_can_be_retried() {
        let guard = guard(Arc::new(MemoryStore::new()));

        let Claim::New(ticket) = guard.try_claim(MentionId(7)).await.unwrap() else {
            panic!("first claim should be new");
        };
        ticket.release().await.unwrap();

        assert!(matches!(
            guard.try_claim(MentionId(7)).await.unwrap(),
            Claim::New(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_claim_elsewhere_is_taken_over_after_poll_budget() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let crashed = guard(Arc::clone(&store));
        let survivor = guard(store);

        // Claimed and never completed, as if the holder crashed mid-handle
        let Claim::New(_abandoned) = crashed.try_claim(MentionId(55)).await.unwrap() else {
            panic!("first claim should be new");
        };

        let claim = survivor.try_claim(MentionId(55)).await.unwrap();
        assert!(matches!(claim, Claim::New(_)));
    }

    /// Yields after every read so concurrent claims interleave between
    /// their read and their write
    struct InterleavingStore(MemoryStore);

    #[async_trait::async_trait]
    impl CacheStore for InterleavingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, Error> {
            let value = self.0.get(key).await?;
            tokio::task::yield_now().await;
            Ok(value)
        }

        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
            self.0.set(key, value, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, Error> {
            self.0.set_if_absent(key, value, ttl).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<bool, Error> {
            self.0.compare_and_set(key, expected, value, ttl).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
            self.0.expire(key, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            self.0.delete(key).await
        }

        async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
            self.0.increment(key, ttl).await
        }
    }

    async fn claim_and_complete(guard: &ReplyGuard, id: MentionId) -> bool {
        match guard.try_claim(id).await.unwrap() {
            Claim::New(ticket) => {
                ticket.complete("reply-1").await.unwrap();
                true
            }
            Claim::Duplicate { .. } => false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_takeovers_of_abandoned_claim_have_one_winner() {
        let store: Arc<dyn CacheStore> = Arc::new(InterleavingStore(MemoryStore::new()));
        let id = MentionId(66);

        // Left behind by a consumer that crashed ten minutes ago
        let stale = ReplyMarker::pending(
            id,
            Uuid::new_v4(),
            Utc::now() - chrono::Duration::minutes(10),
        );
        store
            .set(
                "reply:66",
                &serde_json::to_string(&stale).unwrap(),
                Some(Duration::from_secs(86_400)),
            )
            .await
            .unwrap();

        let first = guard(Arc::clone(&store));
        let second = guard(store);
        let (a, b) = tokio::join!(
            claim_and_complete(&first, id),
            claim_and_complete(&second, id)
        );

        assert!(a ^ b, "exactly one consumer should win the takeover");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_observes_completion_elsewhere() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let first = guard(Arc::clone(&store));
        let second = guard(store);

        let Claim::New(ticket) = first.try_claim(MentionId(8)).await.unwrap() else {
            panic!("first claim should be new");
        };

        let waiter = tokio::spawn(async move { second.try_claim(MentionId(8)).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(250)).await;
        ticket.complete("reply-8").await.unwrap();

        match waiter.await.unwrap() {
            Claim::Duplicate { reply_id } => assert_eq!(reply_id.as_deref(), Some("reply-8")),
            Claim::New(_) => panic!("expected duplicate after completion"),
        }
    }
}
