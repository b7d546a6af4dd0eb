use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit reached for {surface}, retry in {}s", .retry_after.as_secs())]
    RateLimited {
        surface: String,
        retry_after: Duration,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("DynamoDB error: {0}")]
    DynamoDb(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Mention {mention_id} failed permanently after {attempts} attempts: {reason}")]
    PermanentFailure {
        mention_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure may succeed on a later cycle or redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::Timeout(_)
                | Error::Platform(_)
                | Error::Generation(_)
                | Error::Queue(_)
                | Error::DynamoDb(_)
                | Error::Cache(_)
        )
    }
}

impl From<aws_sdk_dynamodb::Error> for Error {
    fn from(err: aws_sdk_dynamodb::Error) -> Self {
        Error::DynamoDb(err.to_string())
    }
}

impl<E> From<aws_sdk_dynamodb::error::SdkError<E>> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: aws_sdk_dynamodb::error::SdkError<E>) -> Self {
        Error::DynamoDb(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;

        match err.classify() {
            Category::Syntax | Category::Data | Category::Eof => Error::Decoding(err.to_string()),
            Category::Io => Error::Encoding(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Platform(err.to_string())
        }
    }
}

/// Bound an outbound call, turning expiry into a retryable [`Error::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, Error>
where
    F: std::future::Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "{what} did not complete within {}ms",
            limit.as_millis()
        ))),
    }
}
