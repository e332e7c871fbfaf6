//! Batch experiments over the stub client: test cases in, JSONL results out,
//! then policy analytics over those files.

use std::path::Path;
use std::sync::Arc;

use brain_rs::experiments::{
    self, ExperimentRunner, LoopOptions, compute_policy_stats, recommend_policies_by_testcase,
};
use brain_rs::prelude::*;

/// Helper: write two documents and a JSONL case file pointing at them.
fn write_cases(dir: &Path) -> Vec<experiments::TestCase> {
    let alpha = dir.join("alpha.txt");
    let beta = dir.join("beta.txt");
    std::fs::write(&alpha, "Alpha ships in March. Revenue rose 4%.").unwrap();
    std::fs::write(&beta, "Beta was delayed. ".repeat(150)).unwrap();

    let cases_path = dir.join("cases.jsonl");
    let lines = [
        serde_json::json!({
            "id": "alpha",
            "raw_text_path": alpha,
            "question": "When does Alpha ship?",
            "expected_notes": {"answer": "March"}
        }),
        serde_json::json!({
            "id": "beta",
            "raw_text_path": beta,
            "question": "What happened to Beta?",
            "budget": {"max_expert_tokens": 200, "priority": "cost"}
        }),
    ]
    .map(|v| v.to_string());
    std::fs::write(&cases_path, lines.join("\n")).unwrap();

    experiments::load_cases(&cases_path).unwrap()
}

// ── Batch ────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_writes_one_record_per_case() {
    let dir = tempfile::tempdir().unwrap();
    let cases = write_cases(dir.path());
    assert_eq!(cases.len(), 2);

    let client = ScriptedClient::rule_based();
    let settings = Settings::default();
    let store = Arc::new(MemoryCanvasStore::new());
    let runner = ExperimentRunner::new(&client, &client, &settings, store.clone())
        .with_policy_name("trial_v2");

    let batch = runner.run_batch(&cases).await.unwrap();
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.metrics.len(), 2);
    // One canvas cached per document.
    assert_eq!(store.len(), 2);

    let alpha = &batch.records[0];
    assert_eq!(alpha.doc_id, "alpha");
    assert_eq!(alpha.policy_name, "trial_v2");
    assert_eq!(alpha.baseline.policy_name, "trial_v2_baseline");
    assert_eq!(alpha.brain.policy_name, "trial_v2");
    assert_eq!(alpha.expected_notes, Some(serde_json::json!({"answer": "March"})));
    assert!(!alpha.brain.answer.is_empty());

    let summary = batch.summary().unwrap();
    assert_eq!(summary.cases, 2);
    assert!(summary.avg_baseline_tokens > 0.0);

    let out = dir.path().join("results");
    let path = batch.write_jsonl(&out, "experiments", None).unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("experiments_"));
    assert!(name.ends_with(".jsonl"));
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.lines().count(), 2);
}

#[tokio::test]
async fn second_batch_reuses_cached_canvases() {
    let dir = tempfile::tempdir().unwrap();
    let cases = write_cases(dir.path());
    let client = ScriptedClient::rule_based();
    let settings = Settings::default();
    let store: Arc<dyn CanvasStore> =
        Arc::new(FileCanvasStore::new(dir.path().join("canvas")).unwrap());
    let runner = ExperimentRunner::new(&client, &client, &settings, store);

    runner.run_batch(&cases).await.unwrap();
    let batch = runner.run_batch(&cases).await.unwrap();
    assert!(batch.records.iter().all(|r| r.brain.debug.encoder_from_cache));
}

#[tokio::test]
async fn missing_document_fails_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cases_path = dir.path().join("cases.jsonl");
    std::fs::write(
        &cases_path,
        r#"{"raw_text_path": "/nonexistent/doc.txt", "question": "q"}"#,
    )
    .unwrap();
    let cases = experiments::load_cases(&cases_path).unwrap();

    let client = ScriptedClient::rule_based();
    let settings = Settings::default();
    let runner =
        ExperimentRunner::new(&client, &client, &settings, Arc::new(MemoryCanvasStore::new()));
    let err = runner.run_batch(&cases).await.unwrap_err();
    assert!(err.contains("failed to read"));
    assert_eq!(client.call_count(), 0);
}

// ── Loop ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn loop_writes_one_file_per_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let cases = write_cases(dir.path());
    let client = ScriptedClient::rule_based();
    let settings = Settings::default();
    let runner =
        ExperimentRunner::new(&client, &client, &settings, Arc::new(MemoryCanvasStore::new()));

    let options = LoopOptions {
        min_iterations: 2,
        max_iterations: 2,
        output_dir: dir.path().join("loop"),
    };
    let outcome = runner.run_loop(&cases, &options).await.unwrap();
    assert_eq!(outcome.iterations.len(), 2);
    assert!(outcome.iterations[0].path.to_string_lossy().ends_with("_iter01.jsonl"));
    assert!(outcome.iterations[1].path.to_string_lossy().ends_with("_iter02.jsonl"));
    if let Some(i) = outcome.successful_iteration {
        assert_eq!(i, 2);
    }

    let bad = LoopOptions {
        min_iterations: 3,
        max_iterations: 1,
        ..options
    };
    assert!(runner.run_loop(&cases, &bad).await.is_err());
}

// ── Policy analytics ─────────────────────────────────────────────────

#[tokio::test]
async fn analytics_read_back_batch_results() {
    let dir = tempfile::tempdir().unwrap();
    let cases = write_cases(dir.path());
    let client = ScriptedClient::rule_based();
    let settings = Settings::default();
    let runner =
        ExperimentRunner::new(&client, &client, &settings, Arc::new(MemoryCanvasStore::new()))
            .with_policy_name("p");

    let batch = runner.run_batch(&cases).await.unwrap();
    batch
        .write_jsonl(&dir.path().join("results"), "experiments", None)
        .unwrap();

    let pattern = format!("{}/results/**/*.jsonl", dir.path().display());
    let paths = experiments::policy::find_result_files(&pattern).unwrap();
    assert_eq!(paths.len(), 1);
    let records = experiments::policy::load_results(&paths).unwrap();
    assert_eq!(records.len(), 2);

    let stats = compute_policy_stats(&records);
    assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["p", "p_baseline"]);
    assert_eq!(stats["p"].samples, 2);
    assert_eq!(stats["p_baseline"].samples, 2);
    let expected_baseline = batch
        .metrics
        .iter()
        .map(|m| m.baseline_tokens as f64)
        .sum::<f64>()
        / 2.0;
    assert_eq!(stats["p_baseline"].avg_expert_tokens, expected_baseline);

    let recs = recommend_policies_by_testcase(&records);
    assert_eq!(recs.keys().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    for (metrics, rec) in batch.metrics.iter().zip(recs.values()) {
        let cheapest = metrics.baseline_tokens.min(metrics.brain_reasoner_tokens);
        assert_eq!(rec.expert_tokens, cheapest as f64);
    }
}
