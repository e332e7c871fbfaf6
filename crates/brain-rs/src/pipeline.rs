//! End-to-end runs: the brain pipeline and the raw-text baseline.
//!
//! [`BrainPipeline::run`] is encoder → controller → reasoner, strictly in
//! sequence, producing a [`PipelineRecord`] with per-stage usage and timing.
//! [`run_baseline`] is the comparison point: one large-model call with the
//! (truncated) raw text stuffed into the prompt.

use crate::api::CostTracker;
use crate::canvas::Canvas;
use crate::config::Settings;
use crate::controller::{
    BudgetContract, ControlPlan, Controller, ControllerConfig, SpeculationMode, Strategy,
};
use crate::encoder::{ChunkSummary, EncoderConfig, TextEncoder};
use crate::reasoner::{Reasoner, ReasonerConfig, StageResult};
use crate::store::{CanvasStore, StateStore};
use crate::text::truncate_chars;
use crate::{ChatModel, ChatRequest, Message, TokenUsage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const DEFAULT_POLICY_NAME: &str = "default_brain_v1";
pub const DEFAULT_BASELINE_POLICY: &str = "baseline_full_context";

/// Raw-text cap for the baseline prompt.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 12_000;

// ── Records ────────────────────────────────────────────────────────

/// Token usage per pipeline stage.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PipelineUsage {
    pub encoder_tokens: TokenUsage,
    pub controller_tokens: TokenUsage,
    pub reasoner_tokens: TokenUsage,
}

impl PipelineUsage {
    pub fn total(&self) -> TokenUsage {
        self.encoder_tokens + self.controller_tokens + self.reasoner_tokens
    }
}

/// Everything needed to audit how an answer was produced.
#[derive(Serialize, Clone, Debug)]
pub struct PipelineDebug {
    pub canvas: Canvas,
    pub intermediate_steps: Vec<String>,
    pub chunk_summaries: Vec<ChunkSummary>,
    pub stages: Vec<StageResult>,
    pub encoder_from_cache: bool,
}

/// Output of one brain pipeline run.
#[derive(Serialize, Clone, Debug)]
pub struct PipelineRecord {
    pub answer: String,
    pub plan: ControlPlan,
    pub policy_name: String,
    pub strategy_used: Strategy,
    pub speculation_mode: SpeculationMode,
    pub debug: PipelineDebug,
    pub usage: PipelineUsage,
    /// Wall clock for the whole run.
    pub latency_seconds: f64,
    /// Sum of reasoning pass latencies only.
    pub reasoner_latency_seconds: f64,
    pub estimated_cost_usd: f64,
}

// ── Brain pipeline ─────────────────────────────────────────────────

/// Encoder, controller, and reasoner wired together.
///
/// The encoder and controller run on the small client; the reasoner uses
/// the small client for its small tier and the large client for its large
/// tier. Model names default to the settings' small and large models.
pub struct BrainPipeline<'a> {
    small: &'a dyn ChatModel,
    large: &'a dyn ChatModel,
    encoder_model: String,
    controller_model: String,
    reasoner_model: String,
    encoder_config: EncoderConfig,
    controller_config: ControllerConfig,
    reasoner_config: ReasonerConfig,
    canvas_store: Option<Arc<dyn CanvasStore>>,
    state_store: Option<Arc<dyn StateStore>>,
    policy_name: String,
}

impl<'a> BrainPipeline<'a> {
    pub fn new(small: &'a dyn ChatModel, large: &'a dyn ChatModel, settings: &Settings) -> Self {
        Self {
            small,
            large,
            encoder_model: settings.small_model.clone(),
            controller_model: settings.small_model.clone(),
            reasoner_model: settings.large_model.clone(),
            encoder_config: EncoderConfig::default(),
            controller_config: ControllerConfig::default(),
            reasoner_config: ReasonerConfig::default(),
            canvas_store: None,
            state_store: None,
            policy_name: DEFAULT_POLICY_NAME.to_string(),
        }
    }

    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = name.into();
        self
    }

    pub fn with_canvas_store(mut self, store: Arc<dyn CanvasStore>) -> Self {
        self.canvas_store = Some(store);
        self
    }

    /// Share controller state across runs. Without one, every run starts
    /// from an empty in-memory state.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_encoder_config(mut self, config: EncoderConfig) -> Self {
        self.encoder_config = config;
        self
    }

    pub fn with_controller_config(mut self, config: ControllerConfig) -> Self {
        self.controller_config = config;
        self
    }

    pub fn with_reasoner_config(mut self, config: ReasonerConfig) -> Self {
        self.reasoner_config = config;
        self
    }

    /// Override the model names. The reasoner's small tier uses the encoder
    /// model.
    pub fn with_models(
        mut self,
        encoder: impl Into<String>,
        controller: impl Into<String>,
        reasoner: impl Into<String>,
    ) -> Self {
        self.encoder_model = encoder.into();
        self.controller_model = controller.into();
        self.reasoner_model = reasoner.into();
        self
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    /// Run encoder, controller, and reasoner once. The first error from any
    /// stage aborts the run with no partial record.
    pub async fn run(
        &self,
        raw_text: &str,
        question: &str,
        doc_id: Option<&str>,
        budget: Option<&BudgetContract>,
    ) -> Result<PipelineRecord, String> {
        let start = Instant::now();
        info!(
            "Brain pipeline [{}]: {} chars, doc_id={}",
            self.policy_name,
            raw_text.chars().count(),
            doc_id.unwrap_or("-")
        );

        let mut encoder = TextEncoder::new(self.small, self.encoder_model.as_str())
            .with_config(self.encoder_config.clone());
        if let Some(store) = &self.canvas_store {
            encoder = encoder.with_canvas_store(Arc::clone(store));
        }
        let mut controller = Controller::new(self.small, self.controller_model.as_str())
            .with_config(self.controller_config.clone());
        if let Some(store) = &self.state_store {
            controller = controller.with_state_store(Arc::clone(store));
        }
        let reasoner = Reasoner::new(
            self.small,
            self.encoder_model.as_str(),
            self.large,
            self.reasoner_model.as_str(),
        )
        .with_config(self.reasoner_config.clone());

        let encoded = encoder.encode(raw_text, question, doc_id).await?;
        let plan = controller.plan(question, &encoded.canvas, budget).await?;
        let reasoned = reasoner
            .reason(question, &encoded.canvas, &plan, Some(raw_text))
            .await?;

        let usage = PipelineUsage {
            encoder_tokens: encoded.usage(),
            controller_tokens: plan.usage,
            reasoner_tokens: reasoned.total_usage(),
        };

        let mut cost = CostTracker::new();
        cost.record(&self.encoder_model, &usage.encoder_tokens);
        cost.record(&self.controller_model, &usage.controller_tokens);
        for stage in &reasoned.stages {
            for step in &stage.usage {
                cost.record(&stage.model, step);
            }
        }

        let latency_seconds = start.elapsed().as_secs_f64();
        info!(
            "Brain pipeline [{}] done: strategy={}, stages={}, tokens={}, {:.2}s{}",
            self.policy_name,
            reasoned.strategy_used,
            reasoned.stages.len(),
            usage.total().total_tokens,
            latency_seconds,
            if encoded.from_cache { " (cached canvas)" } else { "" },
        );

        Ok(PipelineRecord {
            answer: reasoned.final_answer.clone(),
            policy_name: self.policy_name.clone(),
            strategy_used: reasoned.strategy_used,
            speculation_mode: reasoned.speculation_mode,
            reasoner_latency_seconds: reasoned.total_latency(),
            debug: PipelineDebug {
                canvas: encoded.canvas,
                intermediate_steps: reasoned.intermediate_steps,
                chunk_summaries: encoded.chunk_summaries,
                stages: reasoned.stages,
                encoder_from_cache: encoded.from_cache,
            },
            plan,
            usage,
            latency_seconds,
            estimated_cost_usd: cost.estimated_cost_usd,
        })
    }
}

// ── Baseline ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BaselineConfig {
    pub model: String,
    pub temperature: f32,
    pub max_context_chars: usize,
    pub max_tokens: Option<u32>,
    pub policy_name: String,
}

impl BaselineConfig {
    /// Large model, default temperature, and token cap from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            model: settings.large_model.clone(),
            temperature: settings.default_temperature,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            max_tokens: settings.max_tokens,
            policy_name: DEFAULT_BASELINE_POLICY.to_string(),
        }
    }

    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = name.into();
        self
    }

    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct BaselineRecord {
    pub answer: String,
    pub usage: TokenUsage,
    pub latency_seconds: f64,
    pub prompt_chars: usize,
    pub policy_name: String,
    pub estimated_cost_usd: f64,
}

/// One call, one user message, raw text truncated to `max_context_chars`.
pub async fn run_baseline(
    llm: &dyn ChatModel,
    raw_text: &str,
    question: &str,
    config: &BaselineConfig,
) -> Result<BaselineRecord, String> {
    let context = truncate_chars(raw_text, config.max_context_chars);
    let prompt = format!(
        "You are an expert analyst. Answer the QUESTION using the CONTEXT below.\nQUESTION: {}\nCONTEXT:\n{}",
        question.trim(),
        context.trim()
    )
    .trim()
    .to_string();

    let request = ChatRequest {
        model: config.model.clone(),
        messages: vec![Message::user(prompt.as_str())],
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };

    let start = Instant::now();
    let reply = llm.chat(&request).await?;
    let latency_seconds = start.elapsed().as_secs_f64();
    info!(
        "Baseline [{}]: {} tokens in {:.2}s",
        config.policy_name, reply.usage.total_tokens, latency_seconds
    );

    let mut cost = CostTracker::new();
    cost.record(&config.model, &reply.usage);

    Ok(BaselineRecord {
        answer: reply.text,
        usage: reply.usage,
        latency_seconds,
        prompt_chars: prompt.chars().count(),
        policy_name: config.policy_name.clone(),
        estimated_cost_usd: cost.estimated_cost_usd,
    })
}
