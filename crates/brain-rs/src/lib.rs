//! Brain-as-LLM pipeline: compress a document into a canvas, let a small
//! controller model pick a reasoning strategy, then reason against a small or
//! large model tier.
//!
//! Instead of stuffing a whole document into one expensive call, `brain-rs`
//! runs three stages against an abstract chat-completion capability
//! ([`ChatModel`]):
//!
//! 1. [`TextEncoder`](encoder::TextEncoder) chunks the raw text and asks a
//!    small model to summarize each chunk into a multi-resolution
//!    [`Canvas`](canvas::Canvas). Canvases are cached per document id.
//! 2. [`Controller`](controller::Controller) reads the canvas, the question,
//!    its own prior decision, and an optional budget contract, then returns a
//!    [`ControlPlan`](controller::ControlPlan).
//! 3. [`Reasoner`](reasoner::Reasoner) executes the plan: one or more
//!    sequential draft/critique/final passes on the small tier, the large
//!    tier, or a small-then-large cascade with confidence-based escalation.
//!
//! [`BrainPipeline`](pipeline::BrainPipeline) wires the three together and
//! reports token usage and latency per stage so runs can be compared against
//! the single-call [`run_baseline`](pipeline::run_baseline).
//!
//! # Getting started
//!
//! ```ignore
//! use brain_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let settings = Settings::from_env()?;
//!     let client = OpenAiClient::from_settings(&settings)?;
//!
//!     let record = BrainPipeline::new(&client, &client, &settings)
//!         .with_policy_name("default_brain_v1")
//!         .run("long document ...", "What changed?", None, None)
//!         .await?;
//!
//!     println!("{}", record.answer);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`canvas`] | Multi-resolution document representation |
//! | [`encoder`] | Chunking, per-chunk summarization, canvas merge and caching |
//! | [`controller`] | Strategy selection and plan normalization |
//! | [`reasoner`] | Multi-pass reasoning stages and the escalation cascade |
//! | [`pipeline`] | End-to-end brain pipeline and the raw-text baseline |
//! | [`store`] | Canvas and controller-state persistence |
//! | [`api`] | Scripted stub client and per-model pricing |
//! | [`experiments`] | Batch runner and policy analytics |
//!
//! Model output is treated as untrusted text: every JSON response has a
//! heuristic fallback (see [`parse::ParseOutcome`]), so a bad completion
//! degrades quality but never aborts a run. Transport and store failures, on
//! the other hand, propagate to the caller as `Err`.

pub mod api;
pub mod canvas;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod experiments;
pub mod logging;
pub mod parse;
pub mod pipeline;
pub mod prelude;
pub mod reasoner;
pub mod store;
pub mod text;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::Settings;

// ── Constants ──────────────────────────────────────────────────────

/// Default OpenAI-compatible API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model for the encoder, controller, and small reasoning tier.
pub const DEFAULT_SMALL_MODEL: &str = "gpt-4o-mini";

/// Default model for the large reasoning tier and the baseline.
pub const DEFAULT_LARGE_MODEL: &str = "gpt-4o";

/// Request timeout for live completions.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A role-tagged message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Request / reply ────────────────────────────────────────────────

/// Chat completion request. Serializes directly as an OpenAI-compatible
/// request body.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// The common system + user request shape used by every pipeline stage.
    pub fn system_user(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::system(system), Message::user(user)],
            temperature,
            max_tokens,
        }
    }

    /// Content of the last message, or `""` for an empty request.
    pub fn last_content(&self) -> &str {
        self.messages.last().map_or("", |m| m.content.as_str())
    }

    /// Total characters across all message contents.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Token usage accounting for one or more completions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), Add::add)
    }
}

impl<'a> Sum<&'a TokenUsage> for TokenUsage {
    fn sum<I: Iterator<Item = &'a TokenUsage>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Generated text plus usage accounting. `raw` holds the provider payload
/// (or a stub description) and is never interpreted by the pipeline.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub usage: TokenUsage,
    pub raw: serde_json::Value,
}

// ── Capability ─────────────────────────────────────────────────────

/// Boxed future returned by [`ChatModel::chat`].
pub type ChatFuture<'a> = Pin<Box<dyn Future<Output = Result<ChatReply, String>> + Send + 'a>>;

/// An opaque chat-completion capability.
///
/// Implementations must not be assumed to return valid JSON even when the
/// prompt asks for it; every consumer in this crate tolerates free text.
/// Errors are transport or credential failures and are fatal for the
/// pipeline invocation that hit them.
///
/// Uses a boxed future so that the trait is dyn-compatible.
pub trait ChatModel: Send + Sync {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ChatFuture<'a>;
}

// ── Live client ────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug)]
struct RawUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl From<RawUsage> for TokenUsage {
    fn from(raw: RawUsage) -> Self {
        let prompt = raw.prompt_tokens.unwrap_or(0);
        let completion = raw.completion_tokens.unwrap_or(0);
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: raw.total_tokens.unwrap_or(prompt + completion),
        }
    }
}

/// Async HTTP client for OpenAI-compatible chat completions APIs.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiClient {
    /// Create a client for the given API root (e.g. `https://api.openai.com/v1`).
    pub fn new(api_key: impl Into<String>, base_url: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("brain-rs/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }

    /// Build a client from settings. Fails when no API key is configured.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let key = settings
            .api_key
            .as_deref()
            .ok_or_else(|| "OPENAI_API_KEY is not set".to_string())?;
        Self::new(key, &settings.base_url)
    }

    async fn send(&self, body: &ChatRequest) -> Result<ChatReply, String> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!("Request prompt size: {} chars", body.prompt_chars());

        let start = Instant::now();

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("chat API HTTP {status}: {text}"));
        }

        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;
        let parsed: RawChatResponse = serde_json::from_value(raw.clone())
            .map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("chat API error: {}", err.message));
        }

        let usage = parsed.usage.map(TokenUsage::from).unwrap_or_default();
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens,
        );

        let text = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatReply { text, usage, raw })
    }
}

impl ChatModel for OpenAiClient {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ChatFuture<'a> {
        Box::pin(self.send(request))
    }
}
