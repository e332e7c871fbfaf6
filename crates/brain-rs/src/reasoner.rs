//! Multi-pass reasoning over a canvas, with small-to-large escalation.
//!
//! A *stage* is a run of sequential passes against one model tier. A single
//! pass gets a direct-answer instruction; longer runs draft, critique, and
//! then polish, each pass seeing the previous output. The plan's strategy
//! picks the stages:
//!
//! | strategy | stages |
//! |---|---|
//! | `small_only` | small tier, all passes |
//! | `cascade_small_then_big` | small tier, `min(2, passes)`; then large tier, all passes, if the small answer looks weak |
//! | `full_brain` | large tier, all passes |
//!
//! The cascade is driven by [`CascadeState`]. "Looks weak" is
//! [`needs_escalation`]: low [`estimate_confidence`] or a short answer.

use crate::canvas::Canvas;
use crate::controller::{ControlPlan, SpeculationMode, Strategy};
use crate::text::shorten;
use crate::{ChatModel, ChatRequest, TokenUsage};
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

/// Default system prompt for reasoning passes.
pub const DEFAULT_REASONER_PROMPT: &str = "You are an expert analyst. Given a compressed canvas \
and a question, reason carefully and provide clear, well-supported answers. Cite relevant key \
points when possible.";

/// Phrases that halve the confidence estimate.
const UNCERTAINTY_PHRASES: [&str; 3] = ["not sure", "uncertain", "unknown"];

/// Answer length (chars) at which confidence saturates.
const CONFIDENCE_FULL_CHARS: f64 = 500.0;

#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Cap on the raw-text excerpt appended when the plan needs full context.
    pub context_excerpt_chars: usize,
    /// Escalate when the small stage's confidence is below this.
    pub escalation_confidence: f64,
    /// Escalate when the small stage's trimmed answer is shorter than this.
    pub escalation_min_chars: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_REASONER_PROMPT.to_string(),
            temperature: 0.2,
            max_tokens: Some(600),
            context_excerpt_chars: 1200,
            escalation_confidence: 0.6,
            escalation_min_chars: 120,
        }
    }
}

impl ReasonerConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Model tier a stage runs on.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Small,
    Large,
}

/// One stage's passes, in order.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StageResult {
    pub stage_name: String,
    pub tier: Tier,
    pub model: String,
    /// Output of the last pass, verbatim.
    pub final_answer: String,
    pub intermediate_steps: Vec<String>,
    pub usage: Vec<TokenUsage>,
    pub step_latencies: Vec<f64>,
    pub confidence: f64,
}

/// All stages of one `reason` call, plus flattened per-pass logs.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ReasonerResult {
    /// The last stage's answer. An escalated cascade discards the small answer.
    pub final_answer: String,
    pub intermediate_steps: Vec<String>,
    pub usage: Vec<TokenUsage>,
    pub step_latencies: Vec<f64>,
    pub stages: Vec<StageResult>,
    pub strategy_used: Strategy,
    pub speculation_mode: SpeculationMode,
}

impl ReasonerResult {
    fn from_stages(stages: Vec<StageResult>, plan: &ControlPlan) -> Self {
        let intermediate_steps = stages
            .iter()
            .flat_map(|s| s.intermediate_steps.iter().cloned())
            .collect();
        let usage = stages.iter().flat_map(|s| s.usage.iter().copied()).collect();
        let step_latencies = stages
            .iter()
            .flat_map(|s| s.step_latencies.iter().copied())
            .collect();
        Self {
            final_answer: stages
                .last()
                .map(|s| s.final_answer.clone())
                .unwrap_or_default(),
            intermediate_steps,
            usage,
            step_latencies,
            stages,
            strategy_used: plan.strategy,
            speculation_mode: plan.speculation_mode,
        }
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.usage.iter().sum()
    }

    /// Sum of per-pass latencies (excludes prompt building).
    pub fn total_latency(&self) -> f64 {
        self.step_latencies.iter().sum()
    }
}

/// States of the small-then-large cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeState {
    SmallStage,
    EscalateToLarge,
    Done,
}

impl CascadeState {
    /// Transition after the small stage has run.
    pub fn after_small(stage: &StageResult, config: &ReasonerConfig) -> Self {
        if needs_escalation(stage, config) {
            CascadeState::EscalateToLarge
        } else {
            CascadeState::Done
        }
    }
}

/// Crude answer-quality proxy: length up to 500 chars maps to `0.1..=1.0`,
/// halved on uncertainty phrases. Empty text scores 0.
pub fn estimate_confidence(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let len = text.chars().count() as f64;
    let mut confidence = (len / CONFIDENCE_FULL_CHARS).clamp(0.1, 1.0);
    let lowered = text.to_lowercase();
    if UNCERTAINTY_PHRASES.iter().any(|p| lowered.contains(p)) {
        confidence *= 0.5;
    }
    confidence
}

pub fn needs_escalation(stage: &StageResult, config: &ReasonerConfig) -> bool {
    stage.confidence < config.escalation_confidence
        || stage.final_answer.trim().chars().count() < config.escalation_min_chars
}

/// Render the canvas as the reasoner sees it.
pub fn format_canvas(canvas: &Canvas) -> String {
    fn bullets<T: ToString>(items: &[T]) -> String {
        if items.is_empty() {
            return "(none)".to_string();
        }
        items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n - ")
    }

    format!(
        "[Canvas]\nSummaries:\n - {}\nEntities:\n - {}\nFacts:\n - {}\nQuotes:\n - {}\nNotes:\n{}",
        bullets(&canvas.summaries),
        bullets(&canvas.entities),
        bullets(&canvas.facts),
        bullets(&canvas.quotes),
        canvas.notes_for_reasoner,
    )
    .trim()
    .to_string()
}

fn step_instructions(step: u32, total: u32) -> &'static str {
    if total == 1 {
        "Provide a direct, well-structured answer."
    } else if step == 1 {
        "Draft reasoning with numbered arguments and highlight gaps."
    } else if step == total {
        "Produce the final polished answer that resolves earlier critiques."
    } else {
        "Critique the previous draft and outline concrete improvements."
    }
}

/// Prompt for pass `step` of `total`. The canvas only rides along on the
/// first pass; later passes get the previous output instead.
fn build_step_prompt(
    step: u32,
    total: u32,
    question: &str,
    canvas_text: &str,
    prior: &str,
    plan: &ControlPlan,
) -> String {
    let mut parts = vec![format!("QUESTION: {}", question.trim())];
    if (step == 1 || total == 1) && !canvas_text.is_empty() {
        parts.push(canvas_text.to_string());
    }
    parts.push(format!("Controller notes: {}", plan.notes_for_reasoner));
    parts.push(format!(
        "Strategy: {} | Speculation: {}",
        plan.strategy, plan.speculation_mode
    ));

    let mut budget = Vec::new();
    if let Some(tokens) = plan.target_expert_tokens.filter(|t| *t > 0) {
        budget.push(format!("Target expert tokens: {tokens}."));
    }
    if let Some(ms) = plan.target_latency_ms.filter(|m| *m > 0) {
        budget.push(format!("Target latency: {ms} ms."));
    }
    if !budget.is_empty() {
        parts.push(budget.join(" "));
    }

    parts.push(format!(
        "Step {step}/{total}. {}",
        step_instructions(step, total)
    ));
    if !prior.is_empty() {
        parts.push(format!("Prior output:\n{}", prior.trim()));
    }
    parts.join("\n")
}

/// A stage to run: display name, tier, and pass count.
struct StageSpec {
    name: &'static str,
    tier: Tier,
    passes: u32,
}

/// Executes control plans against a small and a large model.
pub struct Reasoner<'a> {
    small: &'a dyn ChatModel,
    large: &'a dyn ChatModel,
    small_model: String,
    large_model: String,
    config: ReasonerConfig,
}

impl<'a> Reasoner<'a> {
    pub fn new(
        small: &'a dyn ChatModel,
        small_model: impl Into<String>,
        large: &'a dyn ChatModel,
        large_model: impl Into<String>,
    ) -> Self {
        Self {
            small,
            large,
            small_model: small_model.into(),
            large_model: large_model.into(),
            config: ReasonerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReasonerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the plan's strategy. Any chat error aborts the whole call.
    pub async fn reason(
        &self,
        question: &str,
        canvas: &Canvas,
        plan: &ControlPlan,
        raw_text: Option<&str>,
    ) -> Result<ReasonerResult, String> {
        debug!("Reasoner strategy: {}", plan.strategy);
        let passes = plan.max_reasoning_passes;
        let mut stages = Vec::new();

        match plan.strategy {
            Strategy::SmallOnly => {
                let spec = StageSpec {
                    name: "small_only",
                    tier: Tier::Small,
                    passes,
                };
                stages.push(self.run_stage(&spec, question, canvas, plan, raw_text).await?);
            }
            Strategy::FullBrain => {
                let spec = StageSpec {
                    name: "full_brain",
                    tier: Tier::Large,
                    passes,
                };
                stages.push(self.run_stage(&spec, question, canvas, plan, raw_text).await?);
            }
            Strategy::CascadeSmallThenBig => {
                let mut state = CascadeState::SmallStage;
                while state != CascadeState::Done {
                    state = match state {
                        CascadeState::SmallStage => {
                            let spec = StageSpec {
                                name: "cascade_small",
                                tier: Tier::Small,
                                passes: passes.min(2),
                            };
                            let stage =
                                self.run_stage(&spec, question, canvas, plan, raw_text).await?;
                            let next = CascadeState::after_small(&stage, &self.config);
                            if next == CascadeState::EscalateToLarge {
                                debug!(
                                    "Escalating to large tier (small-stage confidence {:.2})",
                                    stage.confidence
                                );
                            }
                            stages.push(stage);
                            next
                        }
                        CascadeState::EscalateToLarge => {
                            let spec = StageSpec {
                                name: "cascade_expert",
                                tier: Tier::Large,
                                passes,
                            };
                            stages.push(
                                self.run_stage(&spec, question, canvas, plan, raw_text).await?,
                            );
                            CascadeState::Done
                        }
                        CascadeState::Done => CascadeState::Done,
                    };
                }
            }
        }

        Ok(ReasonerResult::from_stages(stages, plan))
    }

    async fn run_stage(
        &self,
        spec: &StageSpec,
        question: &str,
        canvas: &Canvas,
        plan: &ControlPlan,
        raw_text: Option<&str>,
    ) -> Result<StageResult, String> {
        let (client, model) = match spec.tier {
            Tier::Small => (self.small, self.small_model.as_str()),
            Tier::Large => (self.large, self.large_model.as_str()),
        };

        let mut canvas_text = format_canvas(canvas);
        if plan.needs_full_context
            && let Some(raw) = raw_text.filter(|r| !r.is_empty())
        {
            canvas_text.push_str("\n\n[Additional Context]\n");
            canvas_text.push_str(&shorten(raw, self.config.context_excerpt_chars, " ..."));
        }

        let total = spec.passes.max(1);
        let mut steps: Vec<String> = Vec::with_capacity(total as usize);
        let mut usage = Vec::with_capacity(total as usize);
        let mut latencies = Vec::with_capacity(total as usize);

        for step in 1..=total {
            let prior = steps.last().map_or("", String::as_str);
            let prompt = build_step_prompt(step, total, question, &canvas_text, prior, plan);
            debug!("Reasoner {} step {step}/{total} on {model}", spec.name);

            let request = ChatRequest::system_user(
                model,
                self.config.system_prompt.as_str(),
                prompt,
                self.config.temperature,
                self.config.max_tokens,
            );
            let start = Instant::now();
            let reply = client.chat(&request).await?;
            latencies.push(start.elapsed().as_secs_f64());
            usage.push(reply.usage);
            steps.push(reply.text);
        }

        let final_answer = steps.last().cloned().unwrap_or_default();
        Ok(StageResult {
            stage_name: spec.name.to_string(),
            tier: spec.tier,
            model: model.to_string(),
            confidence: estimate_confidence(&final_answer),
            final_answer,
            intermediate_steps: steps,
            usage,
            step_latencies: latencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScriptedClient;
    use crate::canvas::Entity;

    fn plan(strategy: Strategy, passes: u32) -> ControlPlan {
        ControlPlan {
            strategy,
            max_reasoning_passes: passes,
            notes_for_reasoner: "cite facts".into(),
            ..ControlPlan::default()
        }
    }

    fn stage(answer: &str) -> StageResult {
        StageResult {
            stage_name: "cascade_small".into(),
            tier: Tier::Small,
            model: "small".into(),
            final_answer: answer.into(),
            intermediate_steps: vec![answer.into()],
            usage: vec![TokenUsage::default()],
            step_latencies: vec![0.0],
            confidence: estimate_confidence(answer),
        }
    }

    #[test]
    fn confidence_follows_length_and_hedging() {
        assert_eq!(estimate_confidence(""), 0.0);
        assert_eq!(estimate_confidence("ok"), 0.1);
        assert!((estimate_confidence(&"a".repeat(250)) - 0.5).abs() < 1e-9);
        assert_eq!(estimate_confidence(&"a".repeat(900)), 1.0);
        let hedged = format!("{} I am Not Sure", "a".repeat(600));
        assert!((estimate_confidence(&hedged) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cascade_transitions() {
        let cfg = ReasonerConfig::default();
        assert_eq!(
            CascadeState::after_small(&stage("short"), &cfg),
            CascadeState::EscalateToLarge
        );
        assert_eq!(
            CascadeState::after_small(&stage(&"a".repeat(600)), &cfg),
            CascadeState::Done
        );
        // Long enough but hedged: confidence 0.5 < 0.6.
        let hedged = format!("{} unknown", "a".repeat(600));
        assert_eq!(
            CascadeState::after_small(&stage(&hedged), &cfg),
            CascadeState::EscalateToLarge
        );
        // Confident by length ratio but under 120 chars after trimming.
        let mut s = stage(&"a".repeat(100));
        s.confidence = 0.9;
        assert!(needs_escalation(&s, &cfg));
    }

    #[test]
    fn format_canvas_lists_sections() {
        let canvas = Canvas {
            summaries: vec!["s1".into(), "s2".into()],
            entities: vec![Entity::new("Acme", "org", "vendor")],
            notes_for_reasoner: "watch dates".into(),
            ..Canvas::default()
        };
        let text = format_canvas(&canvas);
        assert!(text.starts_with("[Canvas]\nSummaries:\n - s1\n - s2\nEntities:\n - {"));
        assert!(text.contains(r#""name":"Acme""#));
        assert!(text.contains("Facts:\n - (none)\nQuotes:\n - (none)"));
        assert!(text.ends_with("Notes:\nwatch dates"));

        assert!(format_canvas(&Canvas::default()).ends_with("Notes:"));
    }

    #[test]
    fn step_prompts_vary_by_position() {
        let mut p = plan(Strategy::FullBrain, 3);
        p.target_expert_tokens = Some(256);
        p.target_latency_ms = Some(0);

        let first = build_step_prompt(1, 3, " Q ", "[Canvas]", "", &p);
        assert!(first.starts_with("QUESTION: Q\n[Canvas]\nController notes: cite facts\n"));
        assert!(first.contains("Strategy: full_brain | Speculation: off"));
        assert!(first.contains("Target expert tokens: 256."));
        assert!(!first.contains("Target latency"));
        assert!(first.contains("Step 1/3. Draft reasoning"));
        assert!(!first.contains("Prior output"));

        let middle = build_step_prompt(2, 3, "Q", "[Canvas]", "draft", &p);
        assert!(!middle.contains("[Canvas]"));
        assert!(middle.contains("Step 2/3. Critique the previous draft"));
        assert!(middle.ends_with("Prior output:\ndraft"));

        let last = build_step_prompt(3, 3, "Q", "[Canvas]", "critique", &p);
        assert!(last.contains("Step 3/3. Produce the final polished answer"));

        let single = build_step_prompt(1, 1, "Q", "[Canvas]", "", &p);
        assert!(single.contains("[Canvas]"));
        assert!(single.contains("Step 1/1. Provide a direct, well-structured answer."));
    }

    #[tokio::test]
    async fn small_only_runs_one_small_stage() {
        let client = ScriptedClient::new(["SMALL answer final"]);
        let reasoner = Reasoner::new(&client, "small", &client, "large");
        let result = reasoner
            .reason("q", &Canvas::default(), &plan(Strategy::SmallOnly, 1), None)
            .await
            .unwrap();
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].stage_name, "small_only");
        assert_eq!(result.stages[0].tier, Tier::Small);
        assert_eq!(result.strategy_used, Strategy::SmallOnly);
        assert_eq!(result.final_answer, "SMALL answer final");
        assert_eq!(client.requests()[0].model, "small");
    }

    #[tokio::test]
    async fn full_brain_runs_all_passes_on_large_tier() {
        let client = ScriptedClient::new(["draft", "critique", "final"]);
        let reasoner = Reasoner::new(&client, "small", &client, "large");
        let result = reasoner
            .reason("q", &Canvas::default(), &plan(Strategy::FullBrain, 3), None)
            .await
            .unwrap();
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].stage_name, "full_brain");
        assert_eq!(result.intermediate_steps, vec!["draft", "critique", "final"]);
        assert_eq!(result.final_answer, "final");
        assert_eq!(result.usage.len(), 3);
        assert_eq!(result.step_latencies.len(), 3);
        assert!(client.requests().iter().all(|r| r.model == "large"));
        assert!(client.requests()[2].last_content().contains("Prior output:\ncritique"));
    }

    #[tokio::test]
    async fn short_cascade_answer_escalates() {
        let small = ScriptedClient::new(["too short", "still short"]);
        let large = ScriptedClient::new(["e1", "e2", "expert final"]);
        let reasoner = Reasoner::new(&small, "small", &large, "large");
        let result = reasoner
            .reason(
                "q",
                &Canvas::default(),
                &plan(Strategy::CascadeSmallThenBig, 3),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.stages[0].stage_name, "cascade_small");
        assert_eq!(result.stages[0].intermediate_steps.len(), 2);
        assert_eq!(result.stages[1].stage_name, "cascade_expert");
        assert_eq!(result.stages[1].tier, Tier::Large);
        assert_eq!(result.stages[1].intermediate_steps.len(), 3);
        assert_eq!(result.final_answer, "expert final");
        assert_eq!(result.intermediate_steps.len(), 5);
        assert_eq!(result.intermediate_steps[1], "still short");
    }

    #[tokio::test]
    async fn confident_cascade_answer_stays_small() {
        let long_answer = "The evidence supports the claim. ".repeat(20);
        let small = ScriptedClient::new([long_answer.clone()]);
        let large = ScriptedClient::new(Vec::<String>::new());
        let reasoner = Reasoner::new(&small, "small", &large, "large");
        let result = reasoner
            .reason(
                "q",
                &Canvas::default(),
                &plan(Strategy::CascadeSmallThenBig, 1),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.final_answer, long_answer);
        assert_eq!(large.call_count(), 0);
    }

    #[tokio::test]
    async fn full_context_appends_raw_excerpt() {
        let client = ScriptedClient::new(["a"]);
        let reasoner = Reasoner::new(&client, "small", &client, "large");
        let mut p = plan(Strategy::SmallOnly, 1);
        p.needs_full_context = true;
        reasoner
            .reason("q", &Canvas::default(), &p, Some(&"word ".repeat(1000)))
            .await
            .unwrap();
        let prompt = client.requests()[0].last_content().to_string();
        assert!(prompt.contains("\n\n[Additional Context]\nword word"));
        assert!(prompt.contains(" ...\nController notes:"));
    }

    #[tokio::test]
    async fn chat_failure_propagates() {
        struct Failing;
        impl ChatModel for Failing {
            fn chat<'a>(&'a self, _request: &'a ChatRequest) -> crate::ChatFuture<'a> {
                Box::pin(async { Err::<crate::ChatReply, String>("connection refused".into()) })
            }
        }
        let failing = Failing;
        let reasoner = Reasoner::new(&failing, "small", &failing, "large");
        let err = reasoner
            .reason("q", &Canvas::default(), &plan(Strategy::FullBrain, 2), None)
            .await
            .unwrap_err();
        assert!(err.contains("connection refused"));
    }
}
