use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use pacer_core::config::{LlmConfig, LlmProvider};
use pacer_core::domain::prospect::Prospect;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly sales representative chatting over a \
messaging app. Keep replies short, warm and conversational. Never invent prices or commitments.";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 512;
const RETRY_DELAY_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("responder request failed: {0}")]
    Request(String),
    #[error("responder returned an unusable reply: {0}")]
    InvalidResponse(String),
    #[error("responder is misconfigured: {0}")]
    Configuration(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub direction: TurnDirection,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPurpose {
    /// Answer the batched inbound text.
    Reply,
    /// Re-engage a prospect who went quiet.
    FollowUp { attempt: u32 },
}

#[derive(Clone, Debug)]
pub struct ConversationContext {
    pub prospect: Prospect,
    pub recent_turns: Vec<ConversationTurn>,
    pub purpose: ReplyPurpose,
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        batched_text: &str,
        context: &ConversationContext,
    ) -> Result<String, ResponderError>;
}

/// Local stand-in that needs no model; handy for smoke runs.
#[derive(Clone, Debug, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(
        &self,
        batched_text: &str,
        context: &ConversationContext,
    ) -> Result<String, ResponderError> {
        let name = &context.prospect.display_name;
        Ok(match context.purpose {
            ReplyPurpose::Reply => format!("Thanks {name}, you said: {batched_text}"),
            ReplyPurpose::FollowUp { attempt } => {
                format!("Hi {name}, just checking in again ({attempt}). Any thoughts?")
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

pub struct HttpResponder {
    client: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    system_prompt: String,
    max_retries: u32,
}

impl HttpResponder {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ResponderError> {
        let base_url = match (config.provider, config.base_url.as_deref()) {
            (_, Some(url)) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            (LlmProvider::OpenAi, _) => "https://api.openai.com".to_string(),
            (LlmProvider::Anthropic, _) => "https://api.anthropic.com".to_string(),
            (LlmProvider::Ollama, _) => "http://localhost:11434".to_string(),
            (LlmProvider::Echo, _) => {
                return Err(ResponderError::Configuration(
                    "echo provider does not use an HTTP responder".to_string(),
                ))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| ResponderError::Configuration(error.to_string()))?;

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_retries: config.max_retries,
        })
    }

    async fn request_once(&self, messages: &[ChatMessage]) -> Result<String, ResponderError> {
        let response = match self.provider {
            LlmProvider::Anthropic => {
                let body = json!({
                    "model": self.model,
                    "max_tokens": ANTHROPIC_MAX_TOKENS,
                    "system": self.system_prompt,
                    "messages": messages,
                });
                let mut request =
                    self.client.post(format!("{}/v1/messages", self.base_url)).json(&body);
                if let Some(key) = &self.api_key {
                    request = request
                        .header("x-api-key", key.expose_secret())
                        .header("anthropic-version", ANTHROPIC_VERSION);
                }
                request.send().await
            }
            _ => {
                let mut all = Vec::with_capacity(messages.len() + 1);
                all.push(ChatMessage { role: "system", content: self.system_prompt.clone() });
                all.extend_from_slice(messages);
                let body = json!({ "model": self.model, "messages": all });
                let mut request =
                    self.client.post(format!("{}/v1/chat/completions", self.base_url)).json(&body);
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key.expose_secret());
                }
                request.send().await
            }
        }
        .map_err(|error| ResponderError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ResponderError::Request(format!("status {status}: {detail}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| ResponderError::InvalidResponse(error.to_string()))?;

        match self.provider {
            LlmProvider::Anthropic => parse_anthropic_reply(&payload),
            _ => parse_openai_reply(&payload),
        }
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(
        &self,
        batched_text: &str,
        context: &ConversationContext,
    ) -> Result<String, ResponderError> {
        let messages = build_messages(batched_text, context);

        let mut attempt = 0;
        loop {
            match self.request_once(&messages).await {
                Ok(reply) => {
                    debug!(
                        event_name = "responder.reply_received",
                        conversation_id = %context.prospect.id,
                        attempt,
                        "language model replied"
                    );
                    return Ok(reply);
                }
                Err(ResponderError::Request(message)) if attempt < self.max_retries => {
                    warn!(
                        event_name = "responder.retry",
                        conversation_id = %context.prospect.id,
                        attempt,
                        error = %message,
                        "language model request failed; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS << attempt.min(4)))
                        .await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

pub fn responder_from_config(config: &LlmConfig) -> Result<Arc<dyn Responder>, ResponderError> {
    match config.provider {
        LlmProvider::Echo => Ok(Arc::new(EchoResponder)),
        _ => Ok(Arc::new(HttpResponder::from_config(config)?)),
    }
}

/// Chat history in provider-neutral form. Consecutive turns in the same
/// direction are merged because chat APIs expect alternating roles.
pub fn build_messages(batched_text: &str, context: &ConversationContext) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut push = |role: &'static str, content: &str| match messages.last_mut() {
        Some(last) if last.role == role => {
            last.content.push('\n');
            last.content.push_str(content);
        }
        _ => messages.push(ChatMessage { role, content: content.to_string() }),
    };

    for turn in &context.recent_turns {
        let role = match turn.direction {
            TurnDirection::Inbound => "user",
            TurnDirection::Outbound => "assistant",
        };
        push(role, &turn.text);
    }

    match context.purpose {
        ReplyPurpose::Reply => push("user", batched_text),
        ReplyPurpose::FollowUp { attempt } => push(
            "user",
            &format!(
                "[{} has not replied. Write follow-up message number {attempt}: one or two \
                 friendly sentences that invite a reply without being pushy.]",
                context.prospect.display_name
            ),
        ),
    }

    messages
}

fn parse_openai_reply(payload: &Value) -> Result<String, ResponderError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ResponderError::InvalidResponse(format!("missing reply text in {payload}")))
}

fn parse_anthropic_reply(payload: &Value) -> Result<String, ResponderError> {
    let text = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(ResponderError::InvalidResponse(format!("missing reply text in {payload}")))
    } else {
        Ok(trimmed.to_string())
    }
}
