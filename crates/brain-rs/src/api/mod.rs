//! Chat-capability implementations and cost accounting.
//!
//! - [`scripted`]: [`ScriptedClient`], the deterministic stub used by tests
//!   and `--use-dummy` runs. The live client,
//!   [`OpenAiClient`](crate::OpenAiClient), lives at the crate root.
//! - [`pricing`]: per-model pricing tables and [`CostTracker`].

pub mod pricing;
pub mod scripted;

pub use pricing::{CostTracker, ModelPricing, pricing_for_model};
pub use scripted::ScriptedClient;
