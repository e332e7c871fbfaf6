//! Deterministic, rule-based chat client for local runs and tests.
//!
//! [`ScriptedClient`] replays scripted responses in order, then falls back to
//! canned responses chosen by the shape of the prompt. Token usage is
//! estimated from character counts, so pipeline accounting still produces
//! meaningful comparisons without a network.

use crate::{ChatFuture, ChatModel, ChatReply, ChatRequest, TokenUsage};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Characters per token used for stub usage estimates.
const CHARS_PER_TOKEN: usize = 4;

/// Upper bound on the simulated per-call latency.
const MAX_SIMULATED_LATENCY: Duration = Duration::from_millis(50);

/// Markers in a model name that select the small-tier canned answer.
const SMALL_MODEL_MARKERS: [&str; 3] = ["mini", "small", "lite"];

/// Stub [`ChatModel`] with scripted and rule-based responses.
///
/// ```ignore
/// let client = ScriptedClient::new([summary_json, plan_json, "SMALL answer final"]);
/// let record = BrainPipeline::new(&client, &client, &settings).run(...).await?;
/// assert_eq!(client.call_count(), 3);
/// ```
#[derive(Debug, Default)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    counter: AtomicU64,
    simulate_latency: bool,
}

impl ScriptedClient {
    /// A client that replays `responses` in order before using defaults.
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// A client that only produces rule-based default responses.
    pub fn rule_based() -> Self {
        Self::default()
    }

    /// Sleep `min(2ms × prompt_tokens, 50ms)` per call.
    pub fn with_simulated_latency(mut self) -> Self {
        self.simulate_latency = true;
        self
    }

    /// Number of `chat` calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().map_or(0, |r| r.len())
    }

    /// Copies of every request received, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map_or(0, |r| r.len())
    }

    fn next_text(&self, request: &ChatRequest) -> Result<String, String> {
        let scripted = self
            .responses
            .lock()
            .map_err(|e| format!("scripted client lock poisoned: {e}"))?
            .pop_front();
        Ok(scripted.unwrap_or_else(|| self.default_response(request)))
    }

    fn default_response(&self, request: &ChatRequest) -> String {
        let last = request.last_content();
        let lowered = last.to_lowercase();

        if lowered.contains("provide the control json") {
            return json!({
                "difficulty": "medium",
                "max_reasoning_passes": 2,
                "needs_full_context": false,
                "strategy": "cascade_small_then_big",
                "target_expert_tokens": 256,
                "target_latency_ms": 400,
                "speculation_mode": "off",
                "notes_for_reasoner": "Answer succinctly and cite facts."
            })
            .to_string();
        }
        if lowered.starts_with("chunk ") {
            return json!({
                "summary": "Chunk summary",
                "facts": ["Fact A"],
                "entities": [{"name": "Example", "type": "concept", "description": "placeholder"}],
                "quotes": ["\"Quoted detail\""],
                "notes_for_reasoner": ""
            })
            .to_string();
        }
        if lowered.contains("critique") {
            return format!("Refined: {}", crate::text::truncate_chars(last, 100));
        }

        let prefix = if is_small_model(&request.model) {
            "SMALL"
        } else {
            "EXPERT"
        };
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{prefix} answer {n}: {}",
            crate::text::truncate_chars(last, 120)
        )
    }

    async fn respond(&self, request: &ChatRequest) -> Result<ChatReply, String> {
        self.requests
            .lock()
            .map_err(|e| format!("scripted client lock poisoned: {e}"))?
            .push(request.clone());

        let text = self.next_text(request)?;

        let prompt_tokens = (request.prompt_chars() / CHARS_PER_TOKEN).max(1);
        let completion_tokens = text.chars().count() / CHARS_PER_TOKEN + 1;
        let usage = TokenUsage::new(prompt_tokens as u64, completion_tokens as u64);

        if self.simulate_latency {
            let delay = Duration::from_millis(2 * prompt_tokens as u64).min(MAX_SIMULATED_LATENCY);
            tokio::time::sleep(delay).await;
        }

        Ok(ChatReply {
            text,
            usage,
            raw: json!({
                "model": request.model,
                "messages": request.messages,
            }),
        })
    }
}

/// Whether a model name looks like a small tier (`mini`, `small`, `lite`).
/// An empty name counts as small.
pub fn is_small_model(model: &str) -> bool {
    if model.is_empty() {
        return true;
    }
    let lowered = model.to_lowercase();
    SMALL_MODEL_MARKERS.iter().any(|m| lowered.contains(m))
}

impl ChatModel for ScriptedClient {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ChatFuture<'a> {
        Box::pin(self.respond(request))
    }
}
