//! mention-relay - mention ingestion and reply dispatch
//!
//! A two-stage pipeline: the [`Producer`] polls a social platform for new
//! mentions of an account and publishes them, oldest first, to a durable
//! queue; the [`Consumer`] turns each queued mention into an AI-generated
//! reply and posts it back. A per-account cursor in the cache store keeps
//! polling from republishing history, and a per-mention reply marker keeps
//! redeliveries from posting twice.
//!
//! # Example
//!
//! ```no_run
//! use mention_relay::producer::{Producer, ProducerConfig};
//! use mention_relay::queue::MemoryQueue;
//! use mention_relay::platform::{SocialPlatform, TwitterClient, TwitterConfig};
//! use mention_relay::ratelimit::{FetchGate, RateLimiter};
//! use mention_relay::{CacheStore, CursorStore, MemoryStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
//! let platform = Arc::new(TwitterClient::new(TwitterConfig {
//!     api_base: "https://api.twitter.com/2".to_string(),
//!     bearer_token: std::env::var("TWITTER_BEARER_TOKEN")?,
//!     access_token: std::env::var("TWITTER_ACCESS_TOKEN")?,
//!     timeout: Duration::from_secs(30),
//! })?);
//! let account_id = platform.resolve_account(Some("roastbob")).await?;
//!
//! let producer = Arc::new(Producer::new(
//!     platform,
//!     Arc::new(MemoryQueue::default()),
//!     CursorStore::new(Arc::clone(&store)),
//!     RateLimiter::new(Arc::clone(&store), 50, Duration::from_secs(15 * 60)),
//!     FetchGate::new(Arc::clone(&store), Duration::from_secs(30)),
//!     ProducerConfig {
//!         account_id,
//!         topic: "twitter.mentions".to_string(),
//!         poll_interval: Duration::from_secs(300),
//!         min_poll_interval: Duration::from_secs(60),
//!         call_timeout: Duration::from_secs(30),
//!     },
//! ));
//!
//! let report = producer.poll().await?;
//! println!("published {} new mentions", report.published);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod cursor;
pub mod dynamodb;
pub mod error;
pub mod generator;
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod marker;
pub mod model;
pub mod platform;
pub mod producer;
pub mod queue;
pub mod ratelimit;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use consumer::Consumer;
pub use cursor::CursorStore;
pub use dynamodb::DynamoDbStore;
pub use error::Error;
pub use marker::{Claim, ReplyGuard};
pub use model::{MentionEvent, MentionId, ServiceStatus};
pub use producer::Producer;
pub use queue::{MemoryQueue, Queue, Subscription};
pub use store::{CacheStore, MemoryStore};
