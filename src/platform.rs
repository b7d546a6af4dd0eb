//! Social platform client.
//!
//! [`TwitterClient`] speaks the Twitter API v2: mentions are read with the
//! app bearer token, replies are posted with the user-context access token.

use crate::model::{Mention, MentionId};
use crate::ratelimit::Surface;
use crate::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Window assumed when a 429 arrives without a reset header
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Page size for mention fetches
const MENTIONS_PAGE_SIZE: &str = "100";

const TWEET_FIELDS: &str = "created_at,author_id,conversation_id,referenced_tweets";

#[async_trait]
pub trait SocialPlatform: Send + Sync {
    /// Resolve the account to monitor. `None` means the authenticated account.
    async fn resolve_account(&self, handle: Option<&str>) -> Result<String, Error>;

    /// Mentions of `account_id` strictly newer than `since`, in any order.
    /// Without `since` only the most recent page is returned.
    async fn fetch_mentions(
        &self,
        account_id: &str,
        since: Option<MentionId>,
    ) -> Result<Vec<Mention>, Error>;

    /// Post `text` as a reply to message `in_reply_to`, returning the new message id.
    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<String, Error>;
}

#[derive(Debug, Clone)]
pub struct TwitterConfig {
    pub api_base: String,
    pub bearer_token: String,
    pub access_token: String,
    pub timeout: Duration,
}

pub struct TwitterClient {
    http: reqwest::Client,
    config: TwitterConfig,
}

#[derive(Debug, Deserialize)]
struct MentionsResponse {
    data: Option<Vec<Tweet>>,
    meta: Option<MentionsMeta>,
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Deserialize)]
struct MentionsMeta {
    result_count: Option<i64>,
    newest_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    author_id: Option<String>,
    conversation_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    referenced_tweets: Option<Vec<ReferencedTweet>>,
}

#[derive(Debug, Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    ref_type: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: Option<User>,
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct PostTweetResponse {
    data: Option<PostedTweet>,
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Deserialize)]
struct PostedTweet {
    id: String,
}

fn join_errors(errors: &[ApiError]) -> String {
    errors
        .iter()
        .filter_map(|e| e.message.as_deref().or(e.detail.as_deref()))
        .collect::<Vec<_>>()
        .join("; ")
}

fn retry_after(response: &reqwest::Response) -> Duration {
    let reset_at = response
        .headers()
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    match reset_at {
        Some(reset) => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Duration::from_secs(reset.saturating_sub(now))
        }
        None => DEFAULT_RATE_LIMIT_WINDOW,
    }
}

impl Tweet {
    fn into_mention(self) -> Result<Mention, Error> {
        let referenced_tweet_id = self
            .referenced_tweets
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.ref_type == "replied_to")
            .map(|r| r.id);

        Ok(Mention {
            id: self.id.parse()?,
            text: self.text,
            author_id: self.author_id.unwrap_or_default(),
            conversation_id: self.conversation_id.unwrap_or_default(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
            referenced_tweet_id,
        })
    }
}

impl TwitterClient {
    pub fn new(config: TwitterConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Read the body of a response, mapping throttling and non-2xx statuses
    async fn read_body(response: reqwest::Response, surface: Surface) -> Result<String, Error> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(&response);
            warn!(%surface, retry_after_secs = retry_after.as_secs(), "Platform throttled request");
            return Err(Error::RateLimited {
                surface: surface.to_string(),
                retry_after,
            });
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Platform(format!("API error ({status}): {body}")));
        }
        Ok(body)
    }

    async fn get_user(&self, url: &str) -> Result<String, Error> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await?;
        let body = Self::read_body(response, Surface::PlatformFetch).await?;

        let parsed: UserResponse =
            serde_json::from_str(&body).map_err(|e| Error::Decoding(e.to_string()))?;
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            return Err(Error::Platform(join_errors(&errors)));
        }

        let user = parsed
            .data
            .ok_or_else(|| Error::Platform("No user data returned".to_string()))?;
        info!(account = %user.id, username = %user.username, "Resolved monitored account");
        Ok(user.id)
    }
}

#[async_trait]
impl SocialPlatform for TwitterClient {
    async fn resolve_account(&self, handle: Option<&str>) -> Result<String, Error> {
        let url = match handle.map(|h| h.trim_start_matches('@')) {
            Some(handle) if !handle.is_empty() => {
                format!("{}/users/by/username/{handle}", self.config.api_base)
            }
            _ => format!("{}/users/me", self.config.api_base),
        };
        self.get_user(&url).await
    }

    async fn fetch_mentions(
        &self,
        account_id: &str,
        since: Option<MentionId>,
    ) -> Result<Vec<Mention>, Error> {
        let url = format!("{}/users/{account_id}/mentions", self.config.api_base);

        let mut params = vec![
            ("tweet.fields", TWEET_FIELDS.to_string()),
            ("max_results", MENTIONS_PAGE_SIZE.to_string()),
        ];
        if let Some(since) = since {
            params.push(("since_id", since.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&params)
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await?;
        let body = Self::read_body(response, Surface::PlatformFetch).await?;

        let parsed: MentionsResponse =
            serde_json::from_str(&body).map_err(|e| Error::Decoding(e.to_string()))?;

        // Partial errors can accompany data; only fail when nothing came back
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            if parsed.data.is_none() {
                return Err(Error::Platform(join_errors(&errors)));
            }
            warn!(errors = %join_errors(&errors), "Mentions response carried partial errors");
        }

        if let Some(meta) = &parsed.meta {
            debug!(
                account = account_id,
                result_count = ?meta.result_count,
                newest_id = ?meta.newest_id,
                "Fetched mentions page"
            );
        }

        parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .map(Tweet::into_mention)
            .collect()
    }

    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<String, Error> {
        let url = format!("{}/tweets", self.config.api_base);
        let body = serde_json::json!({
            "text": text,
            "reply": { "in_reply_to_tweet_id": in_reply_to },
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;
        let body = Self::read_body(response, Surface::PlatformPost).await?;

        let parsed: PostTweetResponse =
            serde_json::from_str(&body).map_err(|e| Error::Decoding(e.to_string()))?;
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            return Err(Error::Platform(join_errors(&errors)));
        }

        let reply_id = parsed
            .data
            .map(|tweet| tweet.id)
            .ok_or_else(|| Error::Platform("No tweet data returned".to_string()))?;
        info!(in_reply_to, reply_id = %reply_id, chars = text.chars().count(), "Posted reply");
        Ok(reply_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_response_maps_to_mentions() {
        let body = r#"{
            "data": [
                {
                    "id": "1860861236134715764",
                    "text": "@bob roast my commit history",
                    "author_id": "42",
                    "conversation_id": "1860861236134715700",
                    "created_at": "2024-11-24T23:59:01.000Z",
                    "referenced_tweets": [
                        {"type": "quoted", "id": "11"},
                        {"type": "replied_to", "id": "1860861236134715700"}
                    ]
                },
                {"id": "5", "text": "@bob hi", "author_id": "7"}
            ],
            "meta": {"result_count": 2, "newest_id": "1860861236134715764"}
        }"#;

        let parsed: MentionsResponse = serde_json::from_str(body).unwrap();
        let mentions: Vec<Mention> = parsed
            .data
            .unwrap()
            .into_iter()
            .map(Tweet::into_mention)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(mentions[0].id, MentionId(1860861236134715764));
        assert_eq!(
            mentions[0].referenced_tweet_id.as_deref(),
            Some("1860861236134715700")
        );
        assert_eq!(mentions[1].referenced_tweet_id, None);
        assert_eq!(mentions[1].conversation_id, "");
    }

    #[test]
    fn test_non_numeric_id_is_rejected() {
        let tweet = Tweet {
            id: "abc".to_string(),
            text: String::new(),
            author_id: None,
            conversation_id: None,
            created_at: None,
            referenced_tweets: None,
        };
        assert!(matches!(tweet.into_mention(), Err(Error::Decoding(_))));
    }

    #[test]
    fn test_join_errors() {
        let errors = vec![
            ApiError {
                message: Some("Too Many Requests".into()),
                detail: None,
            },
            ApiError {
                message: None,
                detail: Some("Usage cap exceeded".into()),
            },
        ];
        assert_eq!(join_errors(&errors), "Too Many Requests; Usage cap exceeded");
    }
}
