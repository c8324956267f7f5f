//! Assistant replies for AI-directed chat messages.
//!
//! The responder keeps a per-room sliding context window in the cache and
//! dispatches to one of a closed set of strategies chosen at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::cache::{self, Cache};
use crate::config::AiConfig;
use crate::error::{Error, Result};
use crate::models::Message;
use crate::rate_limit::RateLimiter;

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub content: String,
    pub is_ai: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for ContextEntry {
    fn from(message: &Message) -> Self {
        ContextEntry {
            content: message.content.clone(),
            is_ai: message.is_ai,
            timestamp: message.timestamp,
        }
    }
}

fn has_prefix(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// `@ai ...` (any case) or a word starting with `ai:`.
pub fn is_ai_directed(content: &str) -> bool {
    has_prefix(content.trim_start(), "@ai")
        || content
            .split_whitespace()
            .any(|word| has_prefix(word, "ai:"))
}

/// Removes the trigger tokens, leaving the question itself.
pub fn strip_trigger(content: &str) -> String {
    let mut rest = content.trim_start();
    if has_prefix(rest, "@ai") {
        rest = &rest[3..];
    }
    rest.split_whitespace()
        .filter_map(|word| {
            if has_prefix(word, "ai:") {
                let tail = &word[3..];
                (!tail.is_empty()).then_some(tail)
            } else {
                Some(word)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn keep_recent(entries: &mut Vec<ContextEntry>, size: usize) {
    if entries.len() > size {
        let excess = entries.len() - size;
        entries.drain(..excess);
    }
}

/// Narrow seam for text generation backends.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(&self, window: &[ContextEntry]) -> Result<String>;
}

/// Keyword-driven replies; needs no network and never fails.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedResponder;

const FALLBACK_REPLIES: &[&str] = &[
    "I'm not sure about that one. Try asking about deadlines, task status or priorities.",
    "Could you rephrase that? I can help with deadlines, task status and prioritising work.",
    "I don't have an answer for that yet. Ask me about deadlines, status updates or priorities.",
];

#[async_trait]
impl AiProvider for RuleBasedResponder {
    async fn generate(&self, window: &[ContextEntry]) -> Result<String> {
        let query = window
            .iter()
            .rev()
            .find(|entry| !entry.is_ai)
            .map(|entry| entry.content.to_lowercase())
            .unwrap_or_default();
        let has = |words: &[&str]| words.iter().any(|w| query.contains(w));

        let reply = if query.trim().is_empty() {
            "Hi! Mention me with @ai followed by a question about your tasks.".to_string()
        } else if has(&["help", "what can you"]) {
            "I can suggest how to prioritise work, explain task statuses, remind you about \
             deadlines and summarise this conversation."
                .to_string()
        } else if has(&["summar", "recap"]) {
            let user_messages = window.iter().filter(|e| !e.is_ai).count();
            format!(
                "This conversation has {} recent messages, {} from people and {} from me.",
                window.len(),
                user_messages,
                window.len() - user_messages
            )
        } else if has(&["deadline", "due", "late", "overdue"]) {
            "Check the task's due date and, if it is at risk, split the remaining work and tell \
             the assignee early. You get a reminder two days, one day and two hours before it is due."
                .to_string()
        } else if has(&["priorit", "first", "urgent"]) {
            "Start with tasks that are due soonest and block others, then high-impact work, \
             then the rest."
                .to_string()
        } else if has(&["status", "progress", "done", "complete"]) {
            "Tasks move through todo, in progress, review and completed. Update the status \
             as you go so the project room stays in sync."
                .to_string()
        } else if has(&["hello", "hi", "hey"]) {
            "Hello! How can I help with your project today?".to_string()
        } else {
            FALLBACK_REPLIES
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(FALLBACK_REPLIES[0])
                .to_string()
        };
        Ok(reply)
    }
}

#[derive(Debug, Serialize)]
struct ChatTurn {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatTurn>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Adapter for any `/chat/completions` endpoint (OpenAI, Ollama, ...).
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    persona: String,
}

impl OpenAiCompatible {
    pub fn new(config: &AiConfig, default_base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::UpstreamUnavailable(format!("Failed to create HTTP client: {e}")))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url.to_string())
            .trim_end_matches('/')
            .to_string();
        info!("AI adapter: url={}, model={}", base_url, config.model);
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            persona: config.persona.clone(),
        })
    }
}

#[async_trait]
impl AiProvider for OpenAiCompatible {
    async fn generate(&self, window: &[ContextEntry]) -> Result<String> {
        let mut messages = Vec::with_capacity(window.len() + 1);
        if !self.persona.is_empty() {
            messages.push(ChatTurn {
                role: "system",
                content: self.persona.clone(),
            });
        }
        messages.extend(window.iter().map(|entry| ChatTurn {
            role: if entry.is_ai { "assistant" } else { "user" },
            content: entry.content.clone(),
        }));

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("AI request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "AI provider returned {}",
                response.status()
            )));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("Failed to parse AI response: {e}")))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(Error::UpstreamUnavailable("AI provider returned no content".to_string()));
        }
        Ok(content)
    }
}

/// Strategies selectable by name in `AI_PROVIDER`.
#[derive(Debug, Clone)]
pub enum AiStrategy {
    RuleBased(RuleBasedResponder),
    OpenAiCompatible(OpenAiCompatible),
}

impl AiStrategy {
    /// Unknown names, and adapters that cannot be built, fall back to rule-based.
    pub fn from_config(config: &AiConfig) -> Self {
        let adapter = match config.provider.as_str() {
            "rule-based" | "rules" | "default" => None,
            "openai" if config.api_key.is_none() && config.base_url.is_none() => {
                warn!("AI provider 'openai' has no AI_API_KEY, using rule-based responder");
                None
            }
            "openai" => Some(OpenAiCompatible::new(config, DEFAULT_OPENAI_URL)),
            "ollama" => Some(OpenAiCompatible::new(config, DEFAULT_OLLAMA_URL)),
            other => {
                warn!("Unknown AI provider '{}', using rule-based responder", other);
                None
            }
        };
        match adapter {
            Some(Ok(adapter)) => AiStrategy::OpenAiCompatible(adapter),
            Some(Err(e)) => {
                warn!("{}, using rule-based responder", e);
                AiStrategy::RuleBased(RuleBasedResponder)
            }
            None => AiStrategy::RuleBased(RuleBasedResponder),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AiStrategy::RuleBased(_) => "rule-based",
            AiStrategy::OpenAiCompatible(_) => "openai-compatible",
        }
    }
}

#[async_trait]
impl AiProvider for AiStrategy {
    async fn generate(&self, window: &[ContextEntry]) -> Result<String> {
        match self {
            AiStrategy::RuleBased(responder) => responder.generate(window).await,
            AiStrategy::OpenAiCompatible(adapter) => adapter.generate(window).await,
        }
    }
}

pub struct AiResponder {
    strategy: AiStrategy,
    cache: Arc<dyn Cache>,
    limiter: RateLimiter,
    window_size: usize,
    context_ttl: Duration,
    timeout: Duration,
}

impl AiResponder {
    pub fn new(config: &AiConfig, cache: Arc<dyn Cache>) -> Self {
        let strategy = AiStrategy::from_config(config);
        info!("AI responder using {} strategy", strategy.name());
        Self::with_strategy(strategy, config, cache)
    }

    pub fn with_strategy(strategy: AiStrategy, config: &AiConfig, cache: Arc<dyn Cache>) -> Self {
        AiResponder {
            strategy,
            cache,
            limiter: RateLimiter::new(config.max_requests, config.time_window),
            window_size: config.context_window.max(1),
            context_ttl: config.context_ttl,
            timeout: config.timeout,
        }
    }

    /// One rate-limited, time-bounded generation over `window`.
    pub async fn reply(&self, window: &[ContextEntry]) -> Result<String> {
        if !self.limiter.check().await {
            return Err(Error::UpstreamUnavailable("AI rate limit exceeded".to_string()));
        }
        match tokio::time::timeout(self.timeout, self.strategy.generate(window)).await {
            Ok(result) => result,
            Err(_) => Err(Error::UpstreamUnavailable(format!(
                "AI provider timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Answers `query` in the context of `room_id`. `history` is the room's
    /// persisted tail, used only when no cached context exists.
    pub async fn respond(&self, room_id: &str, query: &str, history: &[Message]) -> Result<String> {
        let mut window = self.context(room_id).await;
        if window.is_empty() {
            window = history.iter().map(ContextEntry::from).collect();
        }
        window.push(ContextEntry {
            content: query.to_string(),
            is_ai: false,
            timestamp: Utc::now(),
        });
        keep_recent(&mut window, self.window_size);

        let reply = self.reply(&window).await?;
        debug!("AI replied in {} ({} chars)", room_id, reply.len());

        window.push(ContextEntry {
            content: reply.clone(),
            is_ai: true,
            timestamp: Utc::now(),
        });
        keep_recent(&mut window, self.window_size);
        let key = cache::ai_context_key(room_id);
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &window, self.context_ttl).await {
            warn!("Failed to cache AI context for {}: {}", room_id, e);
        }
        Ok(reply)
    }

    /// Cached context for the room; empty when absent, expired or unreadable.
    pub async fn context(&self, room_id: &str) -> Vec<ContextEntry> {
        let key = cache::ai_context_key(room_id);
        match cache::get_json::<Vec<ContextEntry>>(self.cache.as_ref(), &key).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to read AI context for {}: {}", room_id, e);
                Vec::new()
            }
        }
    }
}
