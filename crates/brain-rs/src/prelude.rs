//! Convenience re-exports for common `brain-rs` types.
//!
//! ```ignore
//! use brain_rs::prelude::*;
//! ```
//!
//! Covers running the pipeline end to end: the chat capability and its two
//! implementations, settings, the pipeline and baseline, and the stores.
//! Component internals (chunk digests, cascade states, prompt builders) are
//! left out; import those from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatModel, ChatReply, ChatRequest, Message, OpenAiClient, TokenUsage};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::Settings;

// ── Pipeline stages ─────────────────────────────────────────────────
pub use crate::canvas::{Canvas, Entity};
pub use crate::controller::{BudgetContract, ControlPlan, Controller, Strategy};
pub use crate::encoder::TextEncoder;
pub use crate::reasoner::{Reasoner, ReasonerResult};

// ── End-to-end ──────────────────────────────────────────────────────
pub use crate::pipeline::{
    BaselineConfig, BaselineRecord, BrainPipeline, PipelineRecord, run_baseline,
};

// ── Persistence ─────────────────────────────────────────────────────
pub use crate::store::{
    CanvasStore, FileCanvasStore, JsonStateStore, MemoryCanvasStore, MemoryStateStore, StateStore,
};

// ── Testing ─────────────────────────────────────────────────────────
pub use crate::api::ScriptedClient;
