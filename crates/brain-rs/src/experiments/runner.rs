//! Batch experiments: baseline vs brain pipeline over JSONL test cases.
//!
//! Each line of a test-case file is a [`TestCase`]. For every case the
//! runner executes the baseline and then the brain pipeline, writes one
//! [`CaseRecord`] per line to a timestamped JSONL file, and summarizes the
//! token and latency differences.

use crate::ChatModel;
use crate::config::Settings;
use crate::controller::BudgetContract;
use crate::pipeline::{BaselineConfig, BaselineRecord, BrainPipeline, PipelineRecord, run_baseline};
use crate::store::CanvasStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// One experiment input.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TestCase {
    #[serde(default)]
    pub id: Option<String>,
    pub raw_text_path: PathBuf,
    pub question: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetContract>,
    /// Free-form reviewer notes, copied to the output untouched.
    #[serde(default)]
    pub expected_notes: Option<Value>,
}

impl TestCase {
    /// Cache key for the canvas: `doc_id`, else `id`, else the file stem.
    pub fn resolved_doc_id(&self) -> String {
        [self.doc_id.as_deref(), self.id.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.raw_text_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }
}

/// Parse a JSONL file of test cases. Blank lines are skipped.
pub fn load_cases(path: &Path) -> Result<Vec<TestCase>, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: invalid test case: {e}", path.display(), i + 1))
        })
        .collect()
}

/// One output line.
#[derive(Serialize, Clone, Debug)]
pub struct CaseRecord {
    pub id: Option<String>,
    pub question: String,
    pub baseline: BaselineRecord,
    pub brain: PipelineRecord,
    pub expected_notes: Option<Value>,
    pub doc_id: String,
    pub policy_name: String,
}

/// Per-case numbers used for summaries and loop checks.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CaseMetrics {
    pub id: Option<String>,
    pub baseline_tokens: u64,
    pub baseline_latency: f64,
    /// Encoder + controller + reasoner.
    pub brain_tokens: u64,
    pub brain_reasoner_tokens: u64,
    pub brain_latency: f64,
    pub brain_reasoner_latency: f64,
}

impl CaseMetrics {
    fn from_records(id: Option<String>, baseline: &BaselineRecord, brain: &PipelineRecord) -> Self {
        Self {
            id,
            baseline_tokens: baseline.usage.total_tokens,
            baseline_latency: baseline.latency_seconds,
            brain_tokens: brain.usage.total().total_tokens,
            brain_reasoner_tokens: brain.usage.reasoner_tokens.total_tokens,
            brain_latency: brain.latency_seconds,
            brain_reasoner_latency: brain.reasoner_latency_seconds,
        }
    }

    /// The brain's expert spend is no worse than the baseline's.
    pub fn brain_is_cheaper(&self) -> bool {
        self.brain_reasoner_tokens <= self.baseline_tokens
            && self.brain_reasoner_latency <= self.baseline_latency
    }
}

/// Averages over a batch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Summary {
    pub cases: usize,
    pub avg_baseline_tokens: f64,
    pub avg_brain_tokens: f64,
    pub avg_baseline_latency: f64,
    pub avg_brain_latency: f64,
    pub avg_brain_reasoner_tokens: f64,
    pub avg_brain_reasoner_latency: f64,
}

impl Summary {
    /// `None` for an empty batch.
    pub fn from_metrics(metrics: &[CaseMetrics]) -> Option<Self> {
        if metrics.is_empty() {
            return None;
        }
        let n = metrics.len() as f64;
        let avg = |f: fn(&CaseMetrics) -> f64| metrics.iter().map(f).sum::<f64>() / n;
        Some(Self {
            cases: metrics.len(),
            avg_baseline_tokens: avg(|m| m.baseline_tokens as f64),
            avg_brain_tokens: avg(|m| m.brain_tokens as f64),
            avg_baseline_latency: avg(|m| m.baseline_latency),
            avg_brain_latency: avg(|m| m.brain_latency),
            avg_brain_reasoner_tokens: avg(|m| m.brain_reasoner_tokens as f64),
            avg_brain_reasoner_latency: avg(|m| m.brain_reasoner_latency),
        })
    }

    /// One-line comparison of expert tokens and end-to-end latency.
    pub fn human_line(&self) -> String {
        let token_delta = self.avg_brain_reasoner_tokens - self.avg_baseline_tokens;
        let latency_delta = self.avg_brain_latency - self.avg_baseline_latency;
        format!(
            "Summary over {} cases -> expert tokens baseline={:.1}, brain={:.1} (delta {:+.1}); \
             latency baseline={:.3}s, brain={:.3}s (delta {:+.3}s)",
            self.cases,
            self.avg_baseline_tokens,
            self.avg_brain_reasoner_tokens,
            token_delta,
            self.avg_baseline_latency,
            self.avg_brain_latency,
            latency_delta,
        )
    }
}

/// Records and metrics from one pass over the test cases.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub records: Vec<CaseRecord>,
    pub metrics: Vec<CaseMetrics>,
}

impl Batch {
    pub fn summary(&self) -> Option<Summary> {
        Summary::from_metrics(&self.metrics)
    }

    /// Every case spent no more expert tokens and reasoner time than its
    /// baseline.
    pub fn expectations_met(&self) -> bool {
        self.metrics.iter().all(CaseMetrics::brain_is_cheaper)
    }

    /// Write `{prefix}_{UTC timestamp}[_iterNN].jsonl` under `output_dir`.
    pub fn write_jsonl(
        &self,
        output_dir: &Path,
        prefix: &str,
        iteration: Option<u32>,
    ) -> Result<PathBuf, String> {
        std::fs::create_dir_all(output_dir)
            .map_err(|e| format!("failed to create {}: {e}", output_dir.display()))?;
        let path = output_dir.join(results_file_name(prefix, iteration));

        let lines = self
            .records
            .iter()
            .map(|r| serde_json::to_string(r).map_err(|e| format!("failed to serialize record: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        std::fs::write(&path, lines.join("\n"))
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        Ok(path)
    }
}

fn results_file_name(prefix: &str, iteration: Option<u32>) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    match iteration {
        Some(i) => format!("{prefix}_{timestamp}_iter{i:02}.jsonl"),
        None => format!("{prefix}_{timestamp}.jsonl"),
    }
}

/// Loop bounds for [`ExperimentRunner::run_loop`].
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub min_iterations: u32,
    pub max_iterations: u32,
    pub output_dir: PathBuf,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            min_iterations: 10,
            max_iterations: 20,
            output_dir: PathBuf::from("results/loop"),
        }
    }
}

/// One finished loop iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub path: PathBuf,
    pub summary: Option<Summary>,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub iterations: Vec<IterationReport>,
    /// First iteration (at or after the minimum) where expectations held.
    pub successful_iteration: Option<u32>,
}

/// Runs test cases against a pair of clients.
pub struct ExperimentRunner<'a> {
    small: &'a dyn ChatModel,
    large: &'a dyn ChatModel,
    settings: &'a Settings,
    canvas_store: Arc<dyn CanvasStore>,
    policy_name: String,
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(
        small: &'a dyn ChatModel,
        large: &'a dyn ChatModel,
        settings: &'a Settings,
        canvas_store: Arc<dyn CanvasStore>,
    ) -> Self {
        Self {
            small,
            large,
            settings,
            canvas_store,
            policy_name: crate::pipeline::DEFAULT_POLICY_NAME.to_string(),
        }
    }

    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = name.into();
        self
    }

    /// Baseline (tagged `{policy}_baseline`) then brain pipeline for one case.
    pub async fn run_case(&self, case: &TestCase) -> Result<(CaseRecord, CaseMetrics), String> {
        let raw_text = std::fs::read_to_string(&case.raw_text_path)
            .map_err(|e| format!("failed to read {}: {e}", case.raw_text_path.display()))?;
        let doc_id = case.resolved_doc_id();

        let baseline_config = BaselineConfig::from_settings(self.settings)
            .with_policy_name(format!("{}_baseline", self.policy_name));
        let baseline = run_baseline(self.large, &raw_text, &case.question, &baseline_config).await?;

        let brain = BrainPipeline::new(self.small, self.large, self.settings)
            .with_canvas_store(Arc::clone(&self.canvas_store))
            .with_policy_name(self.policy_name.as_str())
            .run(&raw_text, &case.question, Some(&doc_id), case.budget.as_ref())
            .await?;

        let metrics = CaseMetrics::from_records(case.id.clone(), &baseline, &brain);
        let record = CaseRecord {
            id: case.id.clone(),
            question: case.question.clone(),
            baseline,
            brain,
            expected_notes: case.expected_notes.clone(),
            doc_id,
            policy_name: self.policy_name.clone(),
        };
        Ok((record, metrics))
    }

    /// Run every case in order. The first failing case aborts the batch.
    pub async fn run_batch(&self, cases: &[TestCase]) -> Result<Batch, String> {
        let mut batch = Batch::default();
        for (i, case) in cases.iter().enumerate() {
            info!(
                "Case {}/{}: {}",
                i + 1,
                cases.len(),
                case.id.as_deref().unwrap_or(&case.question)
            );
            let (record, metrics) = self.run_case(case).await?;
            batch.records.push(record);
            batch.metrics.push(metrics);
        }
        Ok(batch)
    }

    /// Repeat the batch until expectations hold (checked only from
    /// `min_iterations` on) or `max_iterations` is reached. Each iteration is
    /// written to its own `loop_..._iterNN.jsonl` file.
    pub async fn run_loop(
        &self,
        cases: &[TestCase],
        options: &LoopOptions,
    ) -> Result<LoopOutcome, String> {
        if options.max_iterations < options.min_iterations {
            return Err("max_iterations must be >= min_iterations".to_string());
        }

        let mut outcome = LoopOutcome {
            iterations: Vec::new(),
            successful_iteration: None,
        };
        for iteration in 1..=options.max_iterations {
            let batch = self.run_batch(cases).await?;
            let path = batch.write_jsonl(&options.output_dir, "loop", Some(iteration))?;
            let summary = batch.summary();
            info!("Iteration {iteration} saved to {}", path.display());

            outcome.iterations.push(IterationReport {
                iteration,
                path,
                summary,
            });
            if iteration >= options.min_iterations && batch.expectations_met() {
                outcome.successful_iteration = Some(iteration);
                break;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(baseline_tokens: u64, reasoner_tokens: u64) -> CaseMetrics {
        CaseMetrics {
            id: None,
            baseline_tokens,
            baseline_latency: 1.0,
            brain_tokens: reasoner_tokens + 50,
            brain_reasoner_tokens: reasoner_tokens,
            brain_latency: 2.0,
            brain_reasoner_latency: 0.5,
        }
    }

    #[test]
    fn doc_id_falls_back_to_id_then_stem() {
        let mut case: TestCase = serde_json::from_str(
            r#"{"raw_text_path": "data/report_q3.txt", "question": "q"}"#,
        )
        .unwrap();
        assert_eq!(case.resolved_doc_id(), "report_q3");
        case.id = Some("case-1".into());
        assert_eq!(case.resolved_doc_id(), "case-1");
        case.doc_id = Some(String::new());
        assert_eq!(case.resolved_doc_id(), "case-1");
        case.doc_id = Some("doc-9".into());
        assert_eq!(case.resolved_doc_id(), "doc-9");
    }

    #[test]
    fn load_cases_skips_blank_lines_and_reports_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.jsonl");
        std::fs::write(
            &path,
            "{\"raw_text_path\": \"a.txt\", \"question\": \"q1\", \"budget\": {\"max_expert_tokens\": 300}}\n\n{\"raw_text_path\": \"b.txt\", \"question\": \"q2\"}\n",
        )
        .unwrap();
        let cases = load_cases(&path).unwrap();
        assert_eq!(cases.len(), 2);
        let budget = cases[0].budget.as_ref().unwrap();
        assert_eq!(budget.max_expert_tokens, Some(300));
        assert_eq!(budget.priority, "normal");

        std::fs::write(&path, "{\"question\": \"no path\"}\n").unwrap();
        let err = load_cases(&path).unwrap_err();
        assert!(err.contains(":1: invalid test case"));
    }

    #[test]
    fn summary_averages_metrics() {
        let summary = Summary::from_metrics(&[metrics(100, 40), metrics(200, 60)]).unwrap();
        assert_eq!(summary.cases, 2);
        assert_eq!(summary.avg_baseline_tokens, 150.0);
        assert_eq!(summary.avg_brain_reasoner_tokens, 50.0);
        assert_eq!(summary.avg_brain_tokens, 100.0);
        assert!(summary.human_line().contains("delta -100.0"));
        assert!(Summary::from_metrics(&[]).is_none());
    }

    #[test]
    fn expectations_need_every_case_cheaper() {
        let mut batch = Batch {
            records: Vec::new(),
            metrics: vec![metrics(100, 40), metrics(100, 100)],
        };
        assert!(batch.expectations_met());
        batch.metrics.push(metrics(100, 101));
        assert!(!batch.expectations_met());
    }

    #[test]
    fn results_file_names_carry_prefix_and_iteration() {
        let name = results_file_name("loop", Some(3));
        assert!(name.starts_with("loop_"));
        assert!(name.ends_with("_iter03.jsonl"));
        let name = results_file_name("experiments", None);
        assert!(name.starts_with("experiments_") && name.ends_with(".jsonl"));
        assert!(!name.contains("iter"));
    }
}
