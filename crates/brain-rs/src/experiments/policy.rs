//! Policy analytics over stored experiment results.
//!
//! Works on raw JSON records rather than [`CaseRecord`](super::runner::CaseRecord)
//! so that files written by older versions still load. Only a handful of
//! fields are read: `id`, `doc_id`, `policy_name`, and for each of
//! `baseline`/`brain` its `policy_name`, `usage`, and `latency_seconds`.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The two sides of every record.
const RUN_KEYS: [&str; 2] = ["baseline", "brain"];

/// Files matching a glob pattern (`**` recurses), sorted.
pub fn find_result_files(pattern: &str) -> Result<Vec<PathBuf>, String> {
    let entries =
        glob::glob(pattern).map_err(|e| format!("invalid results glob {pattern:?}: {e}"))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| format!("failed to read glob entry: {e}"))?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Load every non-blank JSONL line from the given files.
pub fn load_results(paths: &[PathBuf]) -> Result<Vec<Value>, String> {
    let mut records = Vec::new();
    for path in paths {
        records.extend(load_file(path)?);
    }
    debug!("Loaded {} records from {} files", records.len(), paths.len());
    Ok(records)
}

fn load_file(path: &Path) -> Result<Vec<Value>, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: invalid record: {e}", path.display(), i + 1))
        })
        .collect()
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PolicyStats {
    pub avg_expert_tokens: f64,
    pub avg_expert_latency: f64,
    pub samples: usize,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Recommendation {
    pub policy_name: String,
    pub expert_tokens: f64,
    pub expert_latency: f64,
}

/// First non-empty string (or non-null scalar) among `values`.
fn first_text<'v>(values: impl IntoIterator<Item = Option<&'v Value>>) -> Option<String> {
    values.into_iter().flatten().find_map(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

/// Present and not null, `false`, or empty.
fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(o) => !o.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(_) => true,
    }
}

/// `(run key, run entry)` pairs of a record that are populated.
fn runs(record: &Value) -> impl Iterator<Item = (&'static str, &Value)> {
    RUN_KEYS
        .into_iter()
        .filter_map(move |key| record.get(key).filter(|v| is_populated(v)).map(|v| (key, v)))
}

fn policy_name(record: &Value, key: &str, entry: &Value) -> String {
    first_text([entry.get("policy_name"), record.get("policy_name")])
        .unwrap_or_else(|| format!("{key}_unknown"))
}

/// Average expert tokens and latency per policy.
///
/// Expert tokens are `usage.total_tokens` when present (baseline records),
/// else `usage.reasoner_tokens.total_tokens` (brain records).
pub fn compute_policy_stats(records: &[Value]) -> BTreeMap<String, PolicyStats> {
    let mut sums: BTreeMap<String, (f64, f64, usize)> = BTreeMap::new();
    for record in records {
        for (key, entry) in runs(record) {
            let usage = entry.get("usage");
            let tokens = match usage.and_then(|u| u.get("total_tokens")) {
                Some(total) => number(Some(total)),
                None => number(usage.and_then(|u| u.pointer("/reasoner_tokens/total_tokens"))),
            };
            let latency = number(entry.get("latency_seconds"));

            let slot = sums.entry(policy_name(record, key, entry)).or_default();
            slot.0 += tokens;
            slot.1 += latency;
            slot.2 += 1;
        }
    }

    sums.into_iter()
        .map(|(policy, (tokens, latency, samples))| {
            let n = samples.max(1) as f64;
            (
                policy,
                PolicyStats {
                    avg_expert_tokens: tokens / n,
                    avg_expert_latency: latency / n,
                    samples,
                },
            )
        })
        .collect()
}

/// Cheapest run per test case, by expert tokens then latency.
///
/// Test cases are keyed by `id`, else `doc_id`, else `"unknown"`; a later
/// record for the same key replaces the earlier recommendation.
pub fn recommend_policies_by_testcase(records: &[Value]) -> BTreeMap<String, Recommendation> {
    let mut recommendations = BTreeMap::new();
    for record in records {
        let testcase = first_text([record.get("id"), record.get("doc_id")])
            .unwrap_or_else(|| "unknown".to_string());

        let best = runs(record)
            .map(|(key, entry)| {
                let tokens_path = if key == "brain" {
                    "/usage/reasoner_tokens/total_tokens"
                } else {
                    "/usage/total_tokens"
                };
                Recommendation {
                    policy_name: policy_name(record, key, entry),
                    expert_tokens: number(entry.pointer(tokens_path)),
                    expert_latency: number(entry.get("latency_seconds")),
                }
            })
            .min_by(|a, b| {
                a.expert_tokens
                    .total_cmp(&b.expert_tokens)
                    .then(a.expert_latency.total_cmp(&b.expert_latency))
            });

        if let Some(best) = best {
            recommendations.insert(testcase, best);
        }
    }
    recommendations
}
