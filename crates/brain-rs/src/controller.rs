//! Cost-aware controller: picks a reasoning strategy for a question.
//!
//! One chat call per [`Controller::plan`]. The prompt carries the previous
//! decision (from the [`StateStore`]), the question, a capped slice of the
//! canvas, and the budget contract. The reply is normalized into a
//! [`ControlPlan`] whose enums are always in their closed sets and whose pass
//! count is always in `1..=3`, whatever the model said.

use crate::canvas::Canvas;
use crate::parse::{self, ParseOutcome};
use crate::store::{MemoryStateStore, StateMap, StateStore};
use crate::text::shorten;
use crate::{ChatModel, ChatRequest, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Default system prompt describing the plan schema.
pub const DEFAULT_CONTROLLER_PROMPT: &str = "You are a metacognitive controller that routes \
questions to a reasoning engine. Given a multi-resolution canvas, a question, optional state, and \
a budget contract, decide the reasoning strategy. Respond with JSON containing: difficulty \
(easy/medium/hard), max_reasoning_passes (1-3), needs_full_context (bool), strategy (small_only | \
cascade_small_then_big | full_brain), target_expert_tokens (int or null), target_latency_ms (int or \
null), speculation_mode (off | conservative | aggressive), and notes_for_reasoner.";

pub const MIN_PASSES: u32 = 1;
pub const MAX_PASSES: u32 = 3;
const DEFAULT_PASSES: u32 = 2;

// ── Closed sets ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

/// How the reasoner should spend model calls.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One stage on the small tier.
    SmallOnly,
    /// Small tier first, large tier only if the small answer looks weak.
    CascadeSmallThenBig,
    /// One stage on the large tier. Also the fallback for unknown names.
    #[default]
    FullBrain,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::SmallOnly => "small_only",
            Strategy::CascadeSmallThenBig => "cascade_small_then_big",
            Strategy::FullBrain => "full_brain",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "small_only" => Some(Strategy::SmallOnly),
            "cascade_small_then_big" => Some(Strategy::CascadeSmallThenBig),
            "full_brain" => Some(Strategy::FullBrain),
            _ => None,
        }
    }
}

/// Reserved for a future escalation policy. Validated and threaded through
/// prompts and results but never changes control flow.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationMode {
    #[default]
    Off,
    Conservative,
    Aggressive,
}

impl SpeculationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SpeculationMode::Off => "off",
            SpeculationMode::Conservative => "conservative",
            SpeculationMode::Aggressive => "aggressive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(SpeculationMode::Off),
            "conservative" => Some(SpeculationMode::Conservative),
            "aggressive" => Some(SpeculationMode::Aggressive),
            _ => None,
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Difficulty, Strategy, SpeculationMode);

// ── Budget and plan ────────────────────────────────────────────────

/// Advisory latency/cost constraints. Shown to the controller model, never
/// enforced.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BudgetContract {
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub max_expert_tokens: Option<u64>,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

impl Default for BudgetContract {
    fn default() -> Self {
        Self {
            max_latency_ms: None,
            max_expert_tokens: None,
            priority: default_priority(),
        }
    }
}

impl BudgetContract {
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn with_max_expert_tokens(mut self, tokens: u64) -> Self {
        self.max_expert_tokens = Some(tokens);
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }
}

/// The controller's decision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ControlPlan {
    pub difficulty: Difficulty,
    /// Always within `MIN_PASSES..=MAX_PASSES`.
    pub max_reasoning_passes: u32,
    pub needs_full_context: bool,
    pub strategy: Strategy,
    pub target_expert_tokens: Option<u64>,
    pub target_latency_ms: Option<u64>,
    pub speculation_mode: SpeculationMode,
    pub notes_for_reasoner: String,
    /// Usage of the controller's own call.
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub latency_seconds: f64,
}

impl Default for ControlPlan {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::Medium,
            max_reasoning_passes: DEFAULT_PASSES,
            needs_full_context: false,
            strategy: Strategy::FullBrain,
            target_expert_tokens: None,
            target_latency_ms: None,
            speculation_mode: SpeculationMode::Off,
            notes_for_reasoner: String::new(),
            usage: TokenUsage::default(),
            latency_seconds: 0.0,
        }
    }
}

impl ControlPlan {
    /// Interpret a controller reply.
    ///
    /// A JSON object is read field by field, with missing or unusable fields
    /// taken from [`ControlPlan::default`]. Anything else goes through
    /// [`ControlPlan::heuristic`]. Either way the result is normalized.
    pub fn parse(text: &str) -> ParseOutcome<Self> {
        match parse::json_object(text) {
            Some(obj) => ParseOutcome::Structured(Self::from_object(&obj)),
            None => ParseOutcome::Heuristic(Self::heuristic(text)),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let name = |key: &str| obj.get(key).and_then(Value::as_str);

        Self {
            difficulty: name("difficulty")
                .and_then(Difficulty::from_name)
                .unwrap_or(defaults.difficulty),
            max_reasoning_passes: clamp_passes(
                obj.get("max_reasoning_passes")
                    .and_then(integer_value)
                    .unwrap_or(i64::from(DEFAULT_PASSES)),
            ),
            needs_full_context: obj
                .get("needs_full_context")
                .map(flag_value)
                .unwrap_or(defaults.needs_full_context),
            strategy: name("strategy")
                .and_then(Strategy::from_name)
                .unwrap_or(defaults.strategy),
            target_expert_tokens: obj
                .get("target_expert_tokens")
                .and_then(integer_value)
                .and_then(|v| u64::try_from(v).ok()),
            target_latency_ms: obj
                .get("target_latency_ms")
                .and_then(integer_value)
                .and_then(|v| u64::try_from(v).ok()),
            speculation_mode: name("speculation_mode")
                .and_then(SpeculationMode::from_name)
                .unwrap_or(defaults.speculation_mode),
            notes_for_reasoner: parse::text_field(obj, "notes_for_reasoner").unwrap_or_default(),
            ..defaults
        }
    }

    /// Keyword scan of a free-text reply: "hard" picks the large tier with
    /// three passes, "easy" or nothing picks a one-pass cascade, "full" asks
    /// for raw context. The text itself becomes the reasoner notes.
    pub fn heuristic(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let difficulty = if lowered.contains("hard") {
            Difficulty::Hard
        } else if lowered.contains("easy") {
            Difficulty::Easy
        } else {
            Difficulty::Medium
        };
        let hard = difficulty == Difficulty::Hard;
        Self {
            difficulty,
            max_reasoning_passes: if hard { 3 } else { 1 },
            needs_full_context: lowered.contains("full"),
            strategy: if hard {
                Strategy::FullBrain
            } else {
                Strategy::CascadeSmallThenBig
            },
            notes_for_reasoner: text.trim().to_string(),
            ..Self::default()
        }
    }

    /// The `{last_difficulty, last_strategy}` snapshot persisted after planning.
    pub fn state_snapshot(&self) -> StateMap {
        let mut state = StateMap::new();
        state.insert("last_difficulty".into(), json!(self.difficulty.as_str()));
        state.insert("last_strategy".into(), json!(self.strategy.as_str()));
        state
    }
}

fn clamp_passes(value: i64) -> u32 {
    value.clamp(i64::from(MIN_PASSES), i64::from(MAX_PASSES)) as u32
}

/// Integers, truncated floats, numeric strings, and booleans.
fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn flag_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

// ── Controller ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// How many canvas summaries to show the model.
    pub summary_limit: usize,
    pub entity_limit: usize,
    pub fact_limit: usize,
    /// Character cap on the canvas notes (ellipsis when cut).
    pub notes_chars: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_CONTROLLER_PROMPT.to_string(),
            temperature: 0.0,
            max_tokens: Some(256),
            summary_limit: 6,
            entity_limit: 5,
            fact_limit: 5,
            notes_chars: 400,
        }
    }
}

impl ControllerConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Small-model router deciding how the reasoner should operate.
pub struct Controller<'a> {
    llm: &'a dyn ChatModel,
    model: String,
    state_store: Arc<dyn StateStore>,
    config: ControllerConfig,
}

impl<'a> Controller<'a> {
    /// A controller with a fresh in-memory state store.
    pub fn new(llm: &'a dyn ChatModel, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            state_store: Arc::new(MemoryStateStore::new()),
            config: ControllerConfig::default(),
        }
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Ask the model for a plan, normalize it, and persist the new state.
    pub async fn plan(
        &self,
        question: &str,
        canvas: &Canvas,
        budget: Option<&BudgetContract>,
    ) -> Result<ControlPlan, String> {
        let state = self.state_store.load_state()?.unwrap_or_default();
        let prompt = self.build_prompt(question, canvas, &state, budget);
        let request = ChatRequest::system_user(
            self.model.as_str(),
            self.config.system_prompt.as_str(),
            prompt,
            self.config.temperature,
            self.config.max_tokens,
        );

        let start = Instant::now();
        let reply = self.llm.chat(&request).await?;
        let latency = start.elapsed().as_secs_f64();

        let parsed = ControlPlan::parse(&reply.text);
        if parsed.is_heuristic() {
            warn!("Controller reply was not a JSON object, applying keyword heuristic");
        }
        let plan = ControlPlan {
            usage: reply.usage,
            latency_seconds: latency,
            ..parsed.into_inner()
        };
        debug!(
            "Plan: difficulty={}, strategy={}, passes={}, full_context={}, speculation={}",
            plan.difficulty,
            plan.strategy,
            plan.max_reasoning_passes,
            plan.needs_full_context,
            plan.speculation_mode,
        );

        self.state_store.save_state(&plan.state_snapshot())?;
        Ok(plan)
    }

    fn build_prompt(
        &self,
        question: &str,
        canvas: &Canvas,
        state: &StateMap,
        budget: Option<&BudgetContract>,
    ) -> String {
        let cfg = &self.config;
        let head = |items: &[String], n: usize| json!(items.iter().take(n).collect::<Vec<_>>());
        let entities = json!(
            canvas
                .entities
                .iter()
                .take(cfg.entity_limit)
                .collect::<Vec<_>>()
        );
        let budget = match budget {
            Some(b) => json!(b),
            None => json!({ "priority": "normal" }),
        };

        format!(
            "STATE: {}\nQUESTION: {}\nCANVAS SUMMARIES: {}\nENTITIES: {}\nFACTS: {}\nNOTES: {}\nBUDGET: {}\nProvide the control JSON.",
            Value::Object(state.clone()),
            question.trim(),
            head(&canvas.summaries, cfg.summary_limit),
            entities,
            head(&canvas.facts, cfg.fact_limit),
            shorten(&canvas.notes_for_reasoner, cfg.notes_chars, "..."),
            budget,
        )
    }
}
