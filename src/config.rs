use crate::producer::MAX_POLL_INTERVAL;
use crate::Error;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Kafka,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    DynamoDb,
}

/// Runtime configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Settings {
    // Social platform
    pub twitter_bearer_token: String,
    pub twitter_access_token: String,
    pub twitter_api_base: String,
    pub monitored_account: Option<String>,

    // AI backend
    pub ai_api_key: Option<String>,
    pub ai_base_url: String,
    pub ai_model: String,
    pub reply_style: String,

    // Queue
    pub queue_backend: QueueBackend,
    pub kafka_brokers: String,
    pub queue_topic: String,
    pub consumer_group: String,
    pub visibility_timeout: Duration,

    // Cache
    pub cache_backend: CacheBackend,
    pub dynamodb_table: String,
    pub dynamodb_endpoint: Option<String>,

    // Pipeline
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub fetch_min_gap: Duration,
    pub max_reply_chars: usize,
    pub max_retries: u32,
    pub marker_ttl: Duration,
    pub max_processing_time: Duration,
    pub call_timeout: Duration,
    pub rate_limit_max_requests: u64,
    pub rate_limit_window: Duration,

    // Control surfaces
    pub producer_addr: SocketAddr,
    pub consumer_addr: SocketAddr,
    pub autostart: bool,
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, Error> {
    optional(lookup, key).ok_or_else(|| Error::Config(format!("{key} must be set")))
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    optional(lookup, key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(lookup, key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration, Error> {
    parse_or(lookup, key, default).map(Duration::from_secs)
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "kafka" => Ok(Self::Kafka),
            other => Err(format!("unknown queue backend '{other}'")),
        }
    }
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "dynamodb" => Ok(Self::DynamoDb),
            other => Err(format!("unknown cache backend '{other}'")),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, Error> {
        dotenvy::dotenv().ok();
        let settings = Self::from_lookup(|key| std::env::var(key).ok())?;
        settings.log_keys();
        Ok(settings)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let lookup = &lookup;
        let twitter_bearer_token = required(lookup, "TWITTER_BEARER_TOKEN")?;
        let twitter_access_token = optional(lookup, "TWITTER_ACCESS_TOKEN")
            .unwrap_or_else(|| twitter_bearer_token.clone());

        let min_poll_interval = secs_or(lookup, "MIN_POLL_INTERVAL_SECS", 60)?;
        let poll_interval = secs_or(lookup, "POLL_INTERVAL_SECS", 300)?;
        if poll_interval < min_poll_interval {
            return Err(Error::Config(format!(
                "POLL_INTERVAL_SECS must be at least {}",
                min_poll_interval.as_secs()
            )));
        }
        if poll_interval > MAX_POLL_INTERVAL {
            return Err(Error::Config(format!(
                "POLL_INTERVAL_SECS must be at most {}",
                MAX_POLL_INTERVAL.as_secs()
            )));
        }

        Ok(Self {
            twitter_bearer_token,
            twitter_access_token,
            twitter_api_base: string_or(lookup, "TWITTER_API_BASE", "https://api.twitter.com/2")
                .trim_end_matches('/')
                .to_string(),
            monitored_account: optional(lookup, "MONITORED_ACCOUNT"),

            ai_api_key: optional(lookup, "AI_API_KEY"),
            ai_base_url: string_or(lookup, "AI_BASE_URL", "https://api.together.xyz/v1")
                .trim_end_matches('/')
                .to_string(),
            ai_model: string_or(
                lookup,
                "AI_MODEL",
                "meta-llama/Meta-Llama-3.1-405B-Instruct-Turbo",
            ),
            reply_style: string_or(lookup, "REPLY_STYLE", "savage"),

            queue_backend: parse_or(lookup, "QUEUE_BACKEND", QueueBackend::Memory)?,
            kafka_brokers: string_or(lookup, "KAFKA_BROKERS", "localhost:9092"),
            queue_topic: string_or(lookup, "QUEUE_TOPIC", "twitter.mentions"),
            consumer_group: string_or(lookup, "CONSUMER_GROUP", "twitter_roaster_group"),
            visibility_timeout: secs_or(lookup, "VISIBILITY_TIMEOUT_SECS", 60)?,

            cache_backend: parse_or(lookup, "CACHE_BACKEND", CacheBackend::Memory)?,
            dynamodb_table: string_or(lookup, "DYNAMODB_TABLE", "mention-relay-cache"),
            dynamodb_endpoint: optional(lookup, "DYNAMODB_ENDPOINT"),

            poll_interval,
            min_poll_interval,
            fetch_min_gap: secs_or(lookup, "FETCH_MIN_GAP_SECS", 30)?,
            max_reply_chars: parse_or(lookup, "MAX_REPLY_CHARS", 280)?,
            max_retries: parse_or(lookup, "MAX_RETRIES", 3)?,
            marker_ttl: secs_or(lookup, "MARKER_TTL_SECS", 86_400)?,
            max_processing_time: secs_or(lookup, "MAX_PROCESSING_SECS", 120)?,
            call_timeout: secs_or(lookup, "CALL_TIMEOUT_SECS", 30)?,
            rate_limit_max_requests: parse_or(lookup, "RATE_LIMIT_MAX_REQUESTS", 50)?,
            rate_limit_window: parse_or(lookup, "RATE_LIMIT_WINDOW_MINUTES", 15u64)
                .map(|minutes| Duration::from_secs(minutes * 60))?,

            producer_addr: parse_or(lookup, "PRODUCER_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            consumer_addr: parse_or(lookup, "CONSUMER_ADDR", SocketAddr::from(([0, 0, 0, 0], 8001)))?,
            autostart: parse_or(lookup, "AUTOSTART", true)?,
        })
    }

    /// The AI credential, which only the consumer needs.
    pub fn require_ai_api_key(&self) -> Result<&str, Error> {
        self.ai_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("AI_API_KEY must be set to run the consumer".to_string()))
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(5).collect();
            format!("{head}...({} chars)", val.chars().count())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) => preview(v),
                None => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  TWITTER_BEARER_TOKEN: {}", preview(&self.twitter_bearer_token));
        tracing::info!("  TWITTER_ACCESS_TOKEN: {}", preview(&self.twitter_access_token));
        tracing::info!("  AI_API_KEY: {}", preview_opt(&self.ai_api_key));
        tracing::info!("  MONITORED_ACCOUNT: {}", self.monitored_account.as_deref().unwrap_or("<own account>"));
        tracing::info!("  QUEUE_BACKEND: {:?} ({})", self.queue_backend, self.queue_topic);
        tracing::info!("  CACHE_BACKEND: {:?}", self.cache_backend);
    }
}
