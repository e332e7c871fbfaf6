//! Batch comparison of the brain pipeline against the baseline.
//!
//! - [`runner`] executes JSONL test cases and writes result files.
//! - [`policy`] aggregates result files per policy and per test case.

pub mod policy;
pub mod runner;

pub use policy::{PolicyStats, Recommendation, compute_policy_stats, recommend_policies_by_testcase};
pub use runner::{
    Batch, CaseMetrics, CaseRecord, ExperimentRunner, LoopOptions, LoopOutcome, Summary, TestCase,
    load_cases,
};
