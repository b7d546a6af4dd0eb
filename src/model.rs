use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Platform-assigned mention identifier.
///
/// Identifiers grow monotonically along an account's timeline, so numeric
/// ordering is publication ordering. On the wire they travel as decimal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MentionId(pub u64);

impl fmt::Display for MentionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MentionId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(MentionId)
            .map_err(|e| crate::Error::Decoding(format!("invalid mention id {s:?}: {e}")))
    }
}

impl Serialize for MentionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MentionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A mention as returned by the social platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub id: MentionId,
    pub text: String,
    pub author_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub referenced_tweet_id: Option<String>,
}

/// The unit moved through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionEvent {
    pub id: MentionId,
    pub text: String,
    pub author_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub referenced_tweet_id: Option<String>,
}

impl MentionEvent {
    /// Stamp a fetched mention with the producer's ingestion time.
    ///
    /// `processed_at` never precedes `created_at`, even when the platform
    /// clock runs ahead of ours.
    pub fn ingest(mention: Mention, now: DateTime<Utc>) -> Self {
        let processed_at = now.max(mention.created_at);
        Self {
            id: mention.id,
            text: mention.text,
            author_id: mention.author_id,
            conversation_id: mention.conversation_id,
            created_at: mention.created_at,
            processed_at,
            referenced_tweet_id: mention.referenced_tweet_id,
        }
    }

    /// The message a reply to this mention should be addressed to.
    pub fn reply_target(&self) -> String {
        self.referenced_tweet_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, crate::Error> {
        serde_json::from_slice(bytes).map_err(|e| crate::Error::Decoding(e.to_string()))
    }
}

/// Idempotency marker stored for a mention once a consumer claims it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMarker {
    pub mention_id: MentionId,
    /// Consumer instance holding the claim
    pub processor_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Set once the reply has been posted
    pub posted_at: Option<DateTime<Utc>>,
    pub reply_id: Option<String>,
}

/// Where a claimed mention currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Reply already posted
    Posted(Option<String>),
    /// Another attempt holds the claim and is within its processing budget
    Pending,
    /// The claim outlived the processing budget; its holder is presumed dead
    Abandoned,
}

impl ReplyMarker {
    pub fn pending(mention_id: MentionId, processor_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            mention_id,
            processor_id,
            started_at,
            posted_at: None,
            reply_id: None,
        }
    }

    pub fn is_posted(&self) -> bool {
        self.posted_at.is_some()
    }

    pub fn status(&self, now: DateTime<Utc>, max_processing_time: Duration) -> MarkerStatus {
        if self.is_posted() {
            return MarkerStatus::Posted(self.reply_id.clone());
        }

        let elapsed = (now - self.started_at).to_std().unwrap_or_default();
        if elapsed >= max_processing_time {
            MarkerStatus::Abandoned
        } else {
            MarkerStatus::Pending
        }
    }
}

/// Delay schedule for retries and polling
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay between every attempt
    Linear {
        delay: Duration,
        max_duration: Duration,
    },
    /// Delay multiplied on every attempt
    Exponential {
        base_delay: Duration,
        multiplier: f64,
        max_duration: Duration,
    },
}

impl Backoff {
    pub fn linear(delay: Duration, max_duration: Duration) -> Self {
        Self::Linear {
            delay,
            max_duration,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_duration: Duration) -> Self {
        Self::Exponential {
            base_delay,
            multiplier,
            max_duration,
        }
    }

    pub fn max_duration(&self) -> Duration {
        match self {
            Self::Linear { max_duration, .. } => *max_duration,
            Self::Exponential { max_duration, .. } => *max_duration,
        }
    }

    /// Delay before attempt `attempt` (zero-based), capped at `max_duration`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match *self {
            Self::Linear { delay, .. } => delay,
            Self::Exponential {
                base_delay,
                multiplier,
                ..
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = base_delay.as_secs_f64() * multiplier.powi(exponent);
                // Out of range (or not finite) means past any cap
                Duration::try_from_secs_f64(secs).unwrap_or(self.max_duration())
            }
        };
        delay.min(self.max_duration())
    }
}

/// Snapshot of a service's run-state, as reported by `/status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub processed_count: u64,
    pub error_count: u64,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Cut `text` to at most `max_chars` characters, always on a char boundary.
pub fn truncate_reply(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
