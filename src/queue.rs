use crate::model::{Backoff, MentionEvent};
use crate::Error;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Handle identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub partition: String,
    pub offset: u64,
    pub delivery: u64,
}

/// An event handed to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: MentionEvent,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
    pub receipt: Receipt,
}

/// Durable, at-least-once, per-partition ordered log.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append an event. Returns once the broker has durably accepted it.
    /// Events sharing a `partition_key` are delivered in publish order.
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        event: &MentionEvent,
    ) -> Result<(), Error>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, Error>;
}

/// One consumer group member's view of a topic.
///
/// A delivery that is neither acked, nacked nor dead-lettered within the
/// visibility timeout is presented again.
#[async_trait]
pub trait Subscription: Send {
    /// Wait at most `wait` for the next deliverable event.
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, Error>;

    /// Mark the event consumed. Acking an already-acked message is a no-op.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), Error>;

    /// Hand the event back for redelivery after the retry delay.
    async fn nack(&mut self, delivery: &Delivery) -> Result<(), Error>;

    /// Remove the event from redelivery and keep it for inspection.
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryQueueConfig {
    pub visibility_timeout: Duration,
    pub redelivery: Backoff,
    /// Most messages kept per topic for groups that subscribe later, and
    /// most dead letters kept per group
    pub retention: usize,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            redelivery: Backoff::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(60)),
            retention: 10_000,
        }
    }
}

/// A dead-lettered message
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub partition_key: String,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Message {
    offset: u64,
    partition_key: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    message: Message,
    deliveries: u32,
    available_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    pending: Pending,
    delivery: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Group {
    partitions: BTreeMap<String, VecDeque<Pending>>,
    in_flight: HashMap<String, InFlight>,
    acked: u64,
    dead_letters: VecDeque<DeadLetter>,
    next_delivery: u64,
}

impl Group {
    fn enqueue(&mut self, message: Message, now: Instant) {
        self.partitions
            .entry(message.partition_key.clone())
            .or_default()
            .push_back(Pending {
                message,
                deliveries: 0,
                available_at: now,
            });
    }

    /// Return deliveries whose visibility timeout elapsed to the head of their partition
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(partition, _)| partition.clone())
            .collect();

        for partition in expired {
            if let Some(mut flight) = self.in_flight.remove(&partition) {
                warn!(
                    partition = %partition,
                    offset = flight.pending.message.offset,
                    "Visibility timeout elapsed - redelivering"
                );
                flight.pending.available_at = now;
                self.partitions
                    .entry(partition)
                    .or_default()
                    .push_front(flight.pending);
            }
        }
    }

    fn take_ready(&mut self, now: Instant, visibility_timeout: Duration) -> Option<(Message, u32, u64)> {
        let partition = self
            .partitions
            .iter()
            .find(|(key, queue)| {
                !self.in_flight.contains_key(*key)
                    && queue.front().is_some_and(|p| p.available_at <= now)
            })
            .map(|(key, _)| key.clone())?;

        let mut pending = self.partitions.get_mut(&partition)?.pop_front()?;
        pending.deliveries += 1;
        self.next_delivery += 1;

        let result = (pending.message.clone(), pending.deliveries, self.next_delivery);
        self.in_flight.insert(
            partition,
            InFlight {
                pending,
                delivery: self.next_delivery,
                deadline: now + visibility_timeout,
            },
        );
        Some(result)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let ready = self
            .partitions
            .iter()
            .filter(|(key, _)| !self.in_flight.contains_key(*key))
            .filter_map(|(_, queue)| queue.front().map(|p| p.available_at));
        let deadlines = self.in_flight.values().map(|f| f.deadline);
        ready.chain(deadlines).min()
    }

    /// Take a delivery out of flight if the receipt is still current
    fn settle(&mut self, receipt: &Receipt) -> Option<InFlight> {
        match self.in_flight.get(&receipt.partition) {
            Some(flight) if flight.delivery == receipt.delivery => {
                self.in_flight.remove(&receipt.partition)
            }
            _ => None,
        }
    }

    /// Lowest offset this group has not yet settled
    fn low_watermark(&self) -> Option<u64> {
        let queued = self.partitions.values().flatten().map(|p| p.message.offset);
        let flying = self.in_flight.values().map(|f| f.pending.message.offset);
        queued.chain(flying).min()
    }

    fn push_dead_letter(&mut self, dead: DeadLetter, retention: usize) {
        self.dead_letters.push_back(dead);
        while self.dead_letters.len() > retention {
            self.dead_letters.pop_front();
        }
    }

    /// Drop a message that was already requeued by a visibility timeout
    fn remove_queued(&mut self, receipt: &Receipt) -> Option<Pending> {
        let queue = self.partitions.get_mut(&receipt.partition)?;
        let index = queue
            .iter()
            .position(|p| p.message.offset == receipt.offset)?;
        queue.remove(index)
    }
}

#[derive(Debug, Default)]
struct Topic {
    /// Oldest first; only what a group subscribing later could still need
    log: VecDeque<Message>,
    groups: HashMap<String, Group>,
}

impl Topic {
    /// Forget messages every group has settled, then cap what is left.
    fn compact(&mut self, retention: usize) {
        if !self.groups.is_empty() {
            let watermark = self
                .groups
                .values()
                .map(|g| g.low_watermark().unwrap_or(u64::MAX))
                .min()
                .unwrap_or(u64::MAX);
            while self.log.front().is_some_and(|m| m.offset < watermark) {
                self.log.pop_front();
            }
        }
        while self.log.len() > retention {
            self.log.pop_front();
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    next_offset: u64,
}

/// In-process [`Queue`] with visibility timeouts, per-partition ordering and
/// dead-letter retention. Nothing outlives the process, so it backs
/// single-process deployments and tests.
///
/// Messages every group has settled are forgotten; a group subscribing later
/// sees at most `retention` of the newest messages nobody has consumed yet.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    config: MemoryQueueConfig,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(MemoryQueueConfig::default())
    }
}

fn lock(inner: &Mutex<Inner>) -> Result<MutexGuard<'_, Inner>, Error> {
    inner
        .lock()
        .map_err(|e| Error::Queue(format!("memory queue poisoned: {e}")))
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Events still retained for `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Result<Vec<MentionEvent>, Error> {
        let inner = lock(&self.inner)?;
        inner
            .topics
            .get(topic)
            .map(|t| t.log.iter().map(|m| MentionEvent::from_payload(&m.payload)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn dead_letters(&self, topic: &str, group: &str) -> Result<Vec<DeadLetter>, Error> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.dead_letters.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Distinct messages the group has acknowledged.
    pub fn acked_count(&self, topic: &str, group: &str) -> Result<u64, Error> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.acked))
    }

    /// Messages still awaiting delivery or acknowledgment for a group.
    pub fn outstanding(&self, topic: &str, group: &str) -> Result<usize, Error> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.partitions.values().map(VecDeque::len).sum::<usize>() + g.in_flight.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        event: &MentionEvent,
    ) -> Result<(), Error> {
        let payload = event.to_payload()?;
        let now = Instant::now();
        {
            let mut inner = lock(&self.inner)?;
            inner.next_offset += 1;
            let message = Message {
                offset: inner.next_offset,
                partition_key: partition_key.to_string(),
                payload,
            };

            let topic = inner.topics.entry(topic.to_string()).or_default();
            for group in topic.groups.values_mut() {
                group.enqueue(message.clone(), now);
            }
            topic.log.push_back(message);
            topic.compact(self.config.retention);
        }
        debug!(topic, partition_key, mention_id = %event.id, "Published event");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, Error> {
        let now = Instant::now();
        {
            let mut inner = lock(&self.inner)?;
            let topic_state = inner.topics.entry(topic.to_string()).or_default();
            if !topic_state.groups.contains_key(group) {
                // New groups start from the earliest retained event
                let mut state = Group::default();
                for message in &topic_state.log {
                    state.enqueue(message.clone(), now);
                }
                topic_state.groups.insert(group.to_string(), state);
            }
        }

        Ok(Box::new(MemorySubscription {
            queue: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }
}

struct MemorySubscription {
    queue: MemoryQueue,
    topic: String,
    group: String,
}

impl MemorySubscription {
    fn with_group<T>(&self, f: impl FnOnce(&mut Group) -> T) -> Result<T, Error> {
        let mut inner = lock(&self.queue.inner)?;
        let group = inner
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.groups.get_mut(&self.group))
            .ok_or_else(|| Error::Queue(format!("unknown subscription {}/{}", self.topic, self.group)))?;
        Ok(f(group))
    }

    /// Like `with_group`, then forget whatever the topic no longer needs
    fn settle_with<T>(&self, f: impl FnOnce(&mut Group) -> T) -> Result<T, Error> {
        let retention = self.queue.config.retention;
        let mut inner = lock(&self.queue.inner)?;
        let topic = inner
            .topics
            .get_mut(&self.topic)
            .ok_or_else(|| Error::Queue(format!("unknown topic {}", self.topic)))?;
        let group = topic
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| Error::Queue(format!("unknown subscription {}/{}", self.topic, self.group)))?;
        let result = f(group);
        topic.compact(retention);
        Ok(result)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, Error> {
        let give_up_at = Instant::now() + wait;
        let notify = Arc::clone(&self.queue.notify);
        let visibility_timeout = self.queue.config.visibility_timeout;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (ready, wakeup) = self.with_group(|group| {
                group.reclaim_expired(now);
                let ready = group.take_ready(now, visibility_timeout);
                (ready, group.next_wakeup())
            })?;

            if let Some((message, attempt, delivery)) = ready {
                match MentionEvent::from_payload(&message.payload) {
                    Ok(event) => {
                        return Ok(Some(Delivery {
                            event,
                            attempt,
                            receipt: Receipt {
                                partition: message.partition_key,
                                offset: message.offset,
                                delivery,
                            },
                        }))
                    }
                    Err(e) => {
                        warn!(offset = message.offset, error = %e, "Undecodable payload - dead-lettering");
                        let receipt = Receipt {
                            partition: message.partition_key,
                            offset: message.offset,
                            delivery,
                        };
                        let retention = self.queue.config.retention;
                        self.settle_with(|group| {
                            if let Some(flight) = group.settle(&receipt) {
                                let dead = DeadLetter {
                                    partition_key: receipt.partition.clone(),
                                    offset: receipt.offset,
                                    payload: flight.pending.message.payload,
                                    attempts: attempt,
                                    reason: e.to_string(),
                                };
                                group.push_dead_letter(dead, retention);
                            }
                        })?;
                        continue;
                    }
                }
            }

            if Instant::now() >= give_up_at {
                return Ok(None);
            }
            let sleep_until = wakeup.map_or(give_up_at, |at| at.min(give_up_at));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), Error> {
        let receipt = &delivery.receipt;
        self.settle_with(|group| {
            let settled = group.settle(receipt).is_some()
                // Late ack for a delivery already requeued by its visibility timeout
                || group.remove_queued(receipt).is_some();
            if settled {
                group.acked += 1;
            }
        })?;
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<(), Error> {
        let redelivery = self.queue.config.redelivery;
        let receipt = &delivery.receipt;
        let now = Instant::now();
        self.with_group(|group| {
            if let Some(mut flight) = group.settle(receipt) {
                let delay = redelivery.delay_for(flight.pending.deliveries.saturating_sub(1));
                flight.pending.available_at = now + delay;
                group
                    .partitions
                    .entry(receipt.partition.clone())
                    .or_default()
                    .push_front(flight.pending);
            }
        })?;
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), Error> {
        let receipt = &delivery.receipt;
        let retention = self.queue.config.retention;
        self.settle_with(|group| {
            let pending = group
                .settle(receipt)
                .map(|flight| flight.pending)
                .or_else(|| group.remove_queued(receipt));
            if let Some(pending) = pending {
                let dead = DeadLetter {
                    partition_key: receipt.partition.clone(),
                    offset: receipt.offset,
                    payload: pending.message.payload,
                    attempts: delivery.attempt,
                    reason: reason.to_string(),
                };
                group.push_dead_letter(dead, retention);
            }
        })?;
        self.queue.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MentionId;
    use chrono::Utc;

    const TOPIC: &str = "twitter.mentions";
    const GROUP: &str = "twitter_roaster_group";

    fn event(id: u64) -> MentionEvent {
        let now = Utc::now();
        MentionEvent {
            id: MentionId(id),
            text: format!("mention {id}"),
            author_id: "a".to_string(),
            conversation_id: "c".to_string(),
            created_at: now,
            processed_at: now,
            referenced_tweet_id: None,
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(MemoryQueueConfig {
            visibility_timeout: Duration::from_secs(30),
            redelivery: Backoff::linear(Duration::from_secs(5), Duration::from_secs(5)),
            retention: 4,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_order_and_backlog_retention() {
        let queue = queue();
        for id in [101, 102, 103] {
            queue.publish(TOPIC, "acct", &event(id)).await.unwrap();
        }

        // Subscribing after publishing still sees the backlog
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        let mut seen = Vec::new();
        while let Some(delivery) = sub.next(Duration::from_millis(10)).await.unwrap() {
            seen.push(delivery.event.id.0);
            sub.ack(&delivery).await.unwrap();
        }

        assert_eq!(seen, vec![101, 102, 103]);
        assert_eq!(queue.acked_count(TOPIC, GROUP).unwrap(), 3);
        assert_eq!(queue.outstanding(TOPIC, GROUP).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_redelivers_before_later_events() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        queue.publish(TOPIC, "acct", &event(1)).await.unwrap();
        queue.publish(TOPIC, "acct", &event(2)).await.unwrap();

        let first = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        sub.nack(&first).await.unwrap();

        let again = sub.next(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(again.event.id, MentionId(1));
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_reappears_after_visibility_timeout() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        queue.publish(TOPIC, "acct", &event(9)).await.unwrap();

        let first = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        // Partition is blocked while the delivery is in flight
        assert!(sub.next(Duration::from_secs(5)).await.unwrap().is_none());

        let redelivered = sub.next(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(redelivered.event.id, first.event.id);
        assert_eq!(redelivered.attempt, 2);

        // Acking twice counts once
        sub.ack(&redelivered).await.unwrap();
        sub.ack(&first).await.unwrap();
        assert_eq!(queue.acked_count(TOPIC, GROUP).unwrap(), 1);
        assert_eq!(queue.outstanding(TOPIC, GROUP).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_removes_from_redelivery() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        queue.publish(TOPIC, "acct", &event(4)).await.unwrap();

        let delivery = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        sub.dead_letter(&delivery, "generation failed").await.unwrap();

        assert!(sub.next(Duration::from_secs(120)).await.unwrap().is_none());
        let dead = queue.dead_letters(TOPIC, GROUP).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "generation failed");
        assert_eq!(
            MentionEvent::from_payload(&dead[0].payload).unwrap().id,
            MentionId(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitions_do_not_block_each_other() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        queue.publish(TOPIC, "a", &event(1)).await.unwrap();
        queue.publish(TOPIC, "b", &event(2)).await.unwrap();

        let from_a = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        let from_b = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(from_a.event.id, MentionId(1));
        assert_eq!(from_b.event.id, MentionId(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_wakes_on_publish() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            publisher.publish(TOPIC, "acct", &event(77)).await.unwrap();
        });

        let delivery = sub.next(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(delivery.event.id, MentionId(77));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_messages_are_forgotten() {
        let queue = queue();
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        for id in 1..=3 {
            queue.publish(TOPIC, "acct", &event(id)).await.unwrap();
        }

        let first = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        sub.ack(&first).await.unwrap();
        let second = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        sub.dead_letter(&second, "bad").await.unwrap();

        let retained: Vec<u64> = queue
            .published(TOPIC)
            .unwrap()
            .into_iter()
            .map(|e| e.id.0)
            .collect();
        assert_eq!(retained, vec![3]);

        let third = sub.next(Duration::from_secs(1)).await.unwrap().unwrap();
        sub.ack(&third).await.unwrap();
        assert!(queue.published(TOPIC).unwrap().is_empty());
        assert_eq!(queue.acked_count(TOPIC, GROUP).unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_caps_backlog_and_dead_letters() {
        let queue = queue();
        for id in 1..=10 {
            queue.publish(TOPIC, "acct", &event(id)).await.unwrap();
        }

        // Nobody was subscribed: only the newest four are kept for later groups
        let mut sub = queue.subscribe(TOPIC, GROUP).await.unwrap();
        let mut seen = Vec::new();
        while let Some(delivery) = sub.next(Duration::from_millis(10)).await.unwrap() {
            seen.push(delivery.event.id.0);
            sub.dead_letter(&delivery, "bad").await.unwrap();
        }
        assert_eq!(seen, vec![7, 8, 9, 10]);

        for id in 11..=13 {
            queue.publish(TOPIC, "acct", &event(id)).await.unwrap();
            let delivery = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();
            sub.dead_letter(&delivery, "bad").await.unwrap();
        }
        let dead: Vec<u64> = queue
            .dead_letters(TOPIC, GROUP)
            .unwrap()
            .iter()
            .map(|d| d.offset)
            .collect();
        assert_eq!(dead, vec![10, 11, 12, 13]);
    }
}
