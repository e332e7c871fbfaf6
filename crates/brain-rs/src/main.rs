//! `brain`: run the brain-as-LLM pipeline and compare it to the baseline.
//!
//! Reads the API key from `OPENAI_API_KEY` (see [`Settings::from_env`] for
//! the other variables). Every command accepts `--use-dummy` to run against
//! the deterministic stub client instead.
//!
//! # Examples
//!
//! ```sh
//! # One question against one document
//! brain ask notes/report.txt --question "What changed in Q3?"
//!
//! # Batch comparison, results under results/
//! brain run data/testcases.jsonl --use-dummy
//!
//! # Repeat until the brain beats the baseline on every case
//! brain loop data/testcases.jsonl --min-iterations 2 --max-iterations 5
//!
//! # Aggregate earlier results
//! brain analyze-policies --results-glob "results/**/*.jsonl"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use brain_rs::experiments::{self, ExperimentRunner, LoopOptions};
use brain_rs::logging;
use brain_rs::prelude::*;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "brain")]
#[command(version)]
#[command(about = "Compare a canvas + controller + reasoner pipeline against a raw-context baseline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question about one document and print the record as JSON
    Ask {
        /// Document to read
        raw_text_path: PathBuf,

        /// Question to answer
        #[arg(short, long)]
        question: String,

        /// Cache key for the canvas (requires --canvas-store-dir)
        #[arg(long, requires = "canvas_store_dir")]
        doc_id: Option<String>,

        /// Directory for cached canvases
        #[arg(long)]
        canvas_store_dir: Option<PathBuf>,

        /// JSON file carrying controller state between runs
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Also run the single-call baseline
        #[arg(long)]
        baseline: bool,

        /// Policy name for tagging output
        #[arg(long, default_value = "default_brain_v1")]
        policy_name: String,

        /// Use the stub client instead of the live API
        #[arg(long)]
        use_dummy: bool,
    },

    /// Run baseline and brain over JSONL test cases and save results
    Run {
        /// Path to JSONL test cases
        testcases_path: PathBuf,

        /// Directory for result files
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,

        /// Use the stub client instead of the live API
        #[arg(long)]
        use_dummy: bool,

        /// Policy name for tagging output
        #[arg(long, default_value = "default_brain_v1")]
        policy_name: String,

        /// Directory for cached canvases
        #[arg(long, default_value = "data/canvas_store")]
        canvas_store_dir: PathBuf,
    },

    /// Repeat the batch until the brain is no more expensive than the baseline
    Loop {
        /// Path to JSONL test cases
        testcases_path: PathBuf,

        /// Directory for per-iteration result files
        #[arg(long, default_value = "results/loop")]
        output_dir: PathBuf,

        /// Use the live API (the stub client is the default here)
        #[arg(long)]
        live: bool,

        /// Iterations to run before checking expectations
        #[arg(long, default_value_t = 10)]
        min_iterations: u32,

        /// Upper bound on iterations
        #[arg(long, default_value_t = 20)]
        max_iterations: u32,

        /// Policy name for tagging output
        #[arg(long, default_value = "default_brain_v1")]
        policy_name: String,

        /// Directory for cached canvases
        #[arg(long, default_value = "data/canvas_store")]
        canvas_store_dir: PathBuf,
    },

    /// Aggregate result files per policy and recommend one per test case
    AnalyzePolicies {
        /// Glob for result JSONL files
        #[arg(long, default_value = "results/**/*.jsonl")]
        results_glob: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(logging::DEFAULT_DIRECTIVE) {
        eprintln!("Warning: {e}");
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Ask {
            raw_text_path,
            question,
            doc_id,
            canvas_store_dir,
            state_file,
            baseline,
            policy_name,
            use_dummy,
        } => {
            let settings = Settings::from_env()?;
            let client = build_client(use_dummy, &settings)?;
            let client = client.as_ref();
            let raw_text = std::fs::read_to_string(&raw_text_path)
                .map_err(|e| format!("failed to read {}: {e}", raw_text_path.display()))?;

            let mut pipeline =
                BrainPipeline::new(client, client, &settings).with_policy_name(policy_name.as_str());
            if let Some(dir) = canvas_store_dir {
                pipeline = pipeline.with_canvas_store(Arc::new(FileCanvasStore::new(dir)?));
            }
            if let Some(path) = state_file {
                pipeline = pipeline.with_state_store(Arc::new(JsonStateStore::new(path)?));
            }
            let brain = pipeline
                .run(&raw_text, &question, doc_id.as_deref(), None)
                .await?;

            let output = if baseline {
                let config = BaselineConfig::from_settings(&settings)
                    .with_policy_name(format!("{policy_name}_baseline"));
                let baseline = run_baseline(client, &raw_text, &question, &config).await?;
                json!({ "brain": brain, "baseline": baseline })
            } else {
                json!(brain)
            };
            print_json(&output)
        }

        Commands::Run {
            testcases_path,
            output_dir,
            use_dummy,
            policy_name,
            canvas_store_dir,
        } => {
            let cases = load_nonempty_cases(&testcases_path)?;
            let settings = Settings::from_env()?;
            let client = build_client(use_dummy, &settings)?;
            let client = client.as_ref();
            let store = Arc::new(FileCanvasStore::new(canvas_store_dir)?);

            let runner = ExperimentRunner::new(client, client, &settings, store)
                .with_policy_name(policy_name);
            let batch = runner.run_batch(&cases).await?;
            let path = batch.write_jsonl(&output_dir, "experiments", None)?;

            println!("Saved results to {}", path.display());
            if let Some(summary) = batch.summary() {
                print_json(&json!(summary))?;
                println!("{}", summary.human_line());
            }
            Ok(())
        }

        Commands::Loop {
            testcases_path,
            output_dir,
            live,
            min_iterations,
            max_iterations,
            policy_name,
            canvas_store_dir,
        } => {
            if max_iterations < min_iterations {
                return Err("--max-iterations must be >= --min-iterations".to_string());
            }
            let cases = load_nonempty_cases(&testcases_path)?;
            let settings = Settings::from_env()?;
            let client = build_client(!live, &settings)?;
            let client = client.as_ref();
            let store = Arc::new(FileCanvasStore::new(canvas_store_dir)?);

            let runner = ExperimentRunner::new(client, client, &settings, store)
                .with_policy_name(policy_name);
            let options = LoopOptions {
                min_iterations,
                max_iterations,
                output_dir,
            };
            let outcome = runner.run_loop(&cases, &options).await?;

            for report in &outcome.iterations {
                println!(
                    "Iteration {} saved to {}",
                    report.iteration,
                    report.path.display()
                );
                if let Some(summary) = &report.summary {
                    let line = serde_json::to_string(summary)
                        .map_err(|e| format!("failed to serialize summary: {e}"))?;
                    println!("Summary: {line}");
                }
            }
            match outcome.successful_iteration {
                Some(i) => println!("Efficiency expectations met on iteration {i}"),
                None => println!("Expectations not satisfied within allotted iterations."),
            }
            Ok(())
        }

        Commands::AnalyzePolicies { results_glob } => {
            let paths = experiments::policy::find_result_files(&results_glob)?;
            if paths.is_empty() {
                return Err(format!("no results found for {results_glob}"));
            }
            let records = experiments::policy::load_results(&paths)?;
            if records.is_empty() {
                return Err("result files were empty".to_string());
            }

            println!("Policy performance summary:");
            for (name, stats) in experiments::compute_policy_stats(&records) {
                println!(
                    "- {name}: expert_tokens={:.2}, expert_latency={:.4}s over {} samples",
                    stats.avg_expert_tokens, stats.avg_expert_latency, stats.samples
                );
            }

            println!("\nPer-testcase recommendations:");
            for (testcase, rec) in experiments::recommend_policies_by_testcase(&records) {
                println!(
                    "- {testcase}: best_policy={} (tokens={}, latency={:.4}s)",
                    rec.policy_name, rec.expert_tokens, rec.expert_latency
                );
            }
            Ok(())
        }
    }
}

/// Stub client with simulated latency, or the live client (key required).
fn build_client(use_dummy: bool, settings: &Settings) -> Result<Box<dyn ChatModel>, String> {
    if use_dummy {
        return Ok(Box::new(ScriptedClient::rule_based().with_simulated_latency()));
    }
    if settings.api_key.is_none() {
        return Err("OPENAI_API_KEY needs to be configured, or pass --use-dummy".to_string());
    }
    Ok(Box::new(OpenAiClient::from_settings(settings)?))
}

fn load_nonempty_cases(path: &std::path::Path) -> Result<Vec<experiments::TestCase>, String> {
    let cases = experiments::load_cases(path)?;
    if cases.is_empty() {
        return Err(format!("no test cases found in {}", path.display()));
    }
    Ok(cases)
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| format!("failed to serialize output: {e}"))?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_needs_a_canvas_store() {
        let err = Cli::try_parse_from(["brain", "ask", "doc.txt", "-q", "why?", "--doc-id", "d1"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from([
            "brain",
            "ask",
            "doc.txt",
            "-q",
            "why?",
            "--doc-id",
            "d1",
            "--canvas-store-dir",
            "cache",
        ])
        .unwrap();
        match cli.command {
            Commands::Ask {
                doc_id,
                canvas_store_dir,
                ..
            } => {
                assert_eq!(doc_id.as_deref(), Some("d1"));
                assert_eq!(canvas_store_dir, Some(PathBuf::from("cache")));
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn ask_without_doc_id_needs_no_store() {
        assert!(Cli::try_parse_from(["brain", "ask", "doc.txt", "-q", "why?"]).is_ok());
    }
}
