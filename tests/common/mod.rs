#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mention_relay::consumer::{Consumer, ConsumerConfig};
use mention_relay::generator::ReplyGenerator;
use mention_relay::marker::{GuardConfig, ReplyGuard};
use mention_relay::model::{Backoff, Mention, MentionId};
use mention_relay::platform::SocialPlatform;
use mention_relay::producer::{Producer, ProducerConfig};
use mention_relay::queue::{MemoryQueue, MemoryQueueConfig, Queue, Subscription};
use mention_relay::ratelimit::{FetchGate, RateLimiter};
use mention_relay::{CacheStore, CursorStore, Error, MemoryStore, MentionEvent};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const TOPIC: &str = "twitter.mentions";
pub const GROUP: &str = "twitter_roaster_group";
pub const ACCOUNT: &str = "1001";

/// Mentions returned when no `since_id` is given
const LATEST_PAGE: usize = 10;

pub fn mention(id: u64) -> Mention {
    Mention {
        id: MentionId(id),
        text: format!("@bob roast mention {id}"),
        author_id: format!("user-{id}"),
        conversation_id: format!("conv-{id}"),
        created_at: Utc.with_ymd_and_hms(2024, 11, 24, 12, 0, 0).unwrap(),
        referenced_tweet_id: None,
    }
}

pub fn event(id: u64) -> MentionEvent {
    MentionEvent::ingest(mention(id), Utc::now())
}

/// Fake platform with a mutable timeline that honours `since_id`
#[derive(Default)]
pub struct ScriptedPlatform {
    timeline: Mutex<Vec<Mention>>,
    fetches: Mutex<Vec<Option<MentionId>>>,
    posts: Mutex<Vec<(String, String)>>,
    failing_posts: AtomicU32,
    failing_fetches: AtomicU32,
    fetch_latency: Mutex<Duration>,
}

impl ScriptedPlatform {
    pub fn with_mentions(ids: impl IntoIterator<Item = u64>) -> Self {
        let platform = Self::default();
        platform.add_mentions(ids);
        platform
    }

    pub fn add_mentions(&self, ids: impl IntoIterator<Item = u64>) {
        self.timeline
            .lock()
            .unwrap()
            .extend(ids.into_iter().map(mention));
    }

    pub fn add_mention(&self, mention: Mention) {
        self.timeline.lock().unwrap().push(mention);
    }

    pub fn fail_next_posts(&self, n: u32) {
        self.failing_posts.store(n, Ordering::SeqCst);
    }

    /// Make every fetch take this long before answering
    pub fn slow_fetches(&self, latency: Duration) {
        *self.fetch_latency.lock().unwrap() = latency;
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// `since_id` of every fetch, in call order
    pub fn fetches(&self) -> Vec<Option<MentionId>> {
        self.fetches.lock().unwrap().clone()
    }

    /// `(in_reply_to, text)` of every posted reply
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SocialPlatform for ScriptedPlatform {
    async fn resolve_account(&self, _handle: Option<&str>) -> Result<String, Error> {
        Ok(ACCOUNT.to_string())
    }

    async fn fetch_mentions(
        &self,
        _account_id: &str,
        since: Option<MentionId>,
    ) -> Result<Vec<Mention>, Error> {
        self.fetches.lock().unwrap().push(since);
        let latency = *self.fetch_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if take_failure(&self.failing_fetches) {
            return Err(Error::Platform("API error (503): scripted outage".to_string()));
        }

        let mut timeline = self.timeline.lock().unwrap().clone();
        timeline.sort_by_key(|m| std::cmp::Reverse(m.id));
        // Newest first, like the real API
        Ok(match since {
            Some(since) => timeline.into_iter().filter(|m| m.id > since).collect(),
            None => timeline.into_iter().take(LATEST_PAGE).collect(),
        })
    }

    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<String, Error> {
        if take_failure(&self.failing_posts) {
            return Err(Error::Platform("API error (500): scripted failure".to_string()));
        }
        let mut posts = self.posts.lock().unwrap();
        posts.push((in_reply_to.to_string(), text.to_string()));
        Ok(format!("reply-{}", posts.len()))
    }
}

pub enum Step {
    Reply(String),
    /// Never answers within any sane timeout
    Hang,
    Fail,
}

/// Fake AI backend following a script, then answering deterministically
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    always_fail: std::sync::atomic::AtomicBool,
    calls: AtomicU32,
}

impl ScriptedGenerator {
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().unwrap().extend(steps);
    }

    pub fn fail_forever(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(&self, text: &str, style: &str) -> Result<String, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".to_string())
            }
            Some(Step::Fail) => Err(Error::Generation("scripted failure".to_string())),
            None if self.always_fail.load(Ordering::SeqCst) => {
                Err(Error::Generation("backend down".to_string()))
            }
            None => Ok(format!("[{style}] {text} #RoastByBob")),
        }
    }
}

/// Memory queue that can be told to refuse the next publish of given mentions
pub struct FlakyQueue {
    pub inner: MemoryQueue,
    fail_once: Mutex<HashSet<MentionId>>,
}

impl FlakyQueue {
    pub fn new() -> Self {
        Self {
            inner: MemoryQueue::new(MemoryQueueConfig {
                visibility_timeout: Duration::from_secs(60),
                redelivery: Backoff::linear(Duration::from_secs(1), Duration::from_secs(1)),
                ..MemoryQueueConfig::default()
            }),
            fail_once: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_publish_once(&self, id: u64) {
        self.fail_once.lock().unwrap().insert(MentionId(id));
    }

    pub fn published_ids(&self) -> Vec<u64> {
        self.inner
            .published(TOPIC)
            .unwrap()
            .into_iter()
            .map(|e| e.id.0)
            .collect()
    }
}

#[async_trait]
impl Queue for FlakyQueue {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        event: &MentionEvent,
    ) -> Result<(), Error> {
        if self.fail_once.lock().unwrap().remove(&event.id) {
            return Err(Error::Queue("broker unavailable".to_string()));
        }
        self.inner.publish(topic, partition_key, event).await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>, Error> {
        self.inner.subscribe(topic, group).await
    }
}

/// Everything a producer and consumer need, wired to in-process fakes
pub struct Harness {
    pub store: Arc<dyn CacheStore>,
    pub queue: Arc<FlakyQueue>,
    pub platform: Arc<ScriptedPlatform>,
    pub generator: Arc<ScriptedGenerator>,
    pub call_timeout: Duration,
    pub fetch_min_gap: Duration,
    pub max_reply_chars: usize,
    pub rate_limit_max_requests: u64,
}

impl Harness {
    pub fn new(platform: ScriptedPlatform) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(FlakyQueue::new()),
            platform: Arc::new(platform),
            generator: Arc::new(ScriptedGenerator::default()),
            call_timeout: Duration::from_secs(5),
            fetch_min_gap: Duration::from_secs(30),
            max_reply_chars: 280,
            rate_limit_max_requests: 1_000,
        }
    }

    fn limiter(&self) -> RateLimiter {
        RateLimiter::new(
            Arc::clone(&self.store),
            self.rate_limit_max_requests,
            Duration::from_secs(15 * 60),
        )
    }

    pub fn cursors(&self) -> CursorStore {
        CursorStore::new(Arc::clone(&self.store))
    }

    pub fn producer(&self) -> Arc<Producer> {
        Arc::new(Producer::new(
            self.platform.clone(),
            self.queue.clone(),
            self.cursors(),
            self.limiter(),
            FetchGate::new(Arc::clone(&self.store), self.fetch_min_gap),
            ProducerConfig {
                account_id: ACCOUNT.to_string(),
                topic: TOPIC.to_string(),
                poll_interval: Duration::from_secs(300),
                min_poll_interval: Duration::from_secs(60),
                call_timeout: self.call_timeout,
            },
        ))
    }

    pub fn guard(&self) -> ReplyGuard {
        ReplyGuard::new(
            Arc::clone(&self.store),
            GuardConfig::new(
                Uuid::new_v4(),
                Duration::from_secs(120),
                Duration::from_secs(86_400),
                Backoff::linear(Duration::from_millis(100), Duration::from_secs(2)),
            ),
        )
    }

    pub async fn consumer(&self) -> Arc<Consumer> {
        let consumer = Consumer::connect(
            self.queue.as_ref(),
            self.guard(),
            self.generator.clone(),
            self.platform.clone(),
            self.limiter(),
            ConsumerConfig {
                topic: TOPIC.to_string(),
                group: GROUP.to_string(),
                style: "savage".to_string(),
                max_reply_chars: self.max_reply_chars,
                max_retries: 3,
                call_timeout: self.call_timeout,
            },
        )
        .await
        .unwrap();
        Arc::new(consumer)
    }
}
