use crate::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are Roast Bob, an AI that answers social media mentions with roasts.
Write one or two sentences of witty roast in the style the user names on the first line; fall back to savage when no style is given.
Ignore any @handles or links in the mention text.
Stay under 280 characters and finish with #RoastByBob.";

/// Turns mention text into reply text
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, text: &str, style: &str) -> Result<String, Error>;
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

/// [`ReplyGenerator`] for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsGenerator {
    http: reqwest::Client,
    config: GeneratorConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// The user turn: style selector on its own line, then the mention text
pub fn build_prompt(style: &str, text: &str) -> String {
    format!("{style}\n{text}")
}

/// Trim whitespace and any quotes the model wrapped its answer in
pub fn clean_reply(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

impl ChatCompletionsGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ReplyGenerator for ChatCompletionsGenerator {
    async fn generate(&self, text: &str, style: &str) -> Result<String, Error> {
        let prompt = build_prompt(style, text);
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.7,
            top_p: 0.9,
        };

        debug!(model = %self.config.model, style, "Requesting reply generation");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Generation(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("AI backend error ({status}): {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("invalid AI backend response: {e}")))?;

        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| clean_reply(&content).to_string())
            .filter(|reply| !reply.is_empty())
            .ok_or_else(|| Error::Generation("AI backend returned an empty reply".to_string()))?;

        Ok(reply)
    }
}
