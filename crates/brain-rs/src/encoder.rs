//! Text encoder: chunk raw text, summarize each chunk, merge into a canvas.
//!
//! The encoder issues one chat call per chunk, strictly in order. Each
//! response is parsed into a [`ChunkDigest`] (structured JSON or a heuristic
//! fallback) and merged into the growing [`Canvas`]. With a document id and
//! a [`CanvasStore`], finished canvases are cached and later calls for the
//! same document skip the model entirely.

use crate::canvas::{Canvas, Entity};
use crate::parse::{self, ParseOutcome};
use crate::store::CanvasStore;
use crate::{ChatModel, ChatRequest, TokenUsage};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default system prompt for chunk summarization.
pub const DEFAULT_ENCODER_PROMPT: &str = "You are a meticulous research assistant. Given a chunk \
of a document and a question, produce a compact JSON summary with fields summary (string), facts \
(list of strings), entities (list of {name, type, description}), quotes (list of key quotes), and \
notes_for_reasoner (string). Keep entries short and relevant.";

/// Encoder tuning knobs.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Window size in characters. Text at or below this length is one chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive windows.
    pub chunk_overlap: usize,
    /// Hard cap on windows; text past the last window is dropped.
    pub max_chunks: usize,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1800,
            chunk_overlap: 300,
            max_chunks: 8,
            system_prompt: DEFAULT_ENCODER_PROMPT.to_string(),
            temperature: 0.0,
            max_tokens: Some(600),
        }
    }
}

impl EncoderConfig {
    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// One chunk's parsed summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkDigest {
    pub summary: String,
    pub facts: Vec<String>,
    pub entities: Vec<Entity>,
    pub quotes: Vec<String>,
    pub notes_for_reasoner: String,
}

impl ChunkDigest {
    /// Interpret a model response. Never fails: anything that is not a JSON
    /// object is turned into a digest by [`ChunkDigest::heuristic`].
    pub fn parse(text: &str) -> ParseOutcome<Self> {
        match parse::json_object(text) {
            Some(obj) => ParseOutcome::Structured(Self {
                summary: parse::text_field(&obj, "summary").unwrap_or_default(),
                facts: parse::text_list(&obj, "facts"),
                entities: match obj.get("entities") {
                    Some(Value::Array(items)) => {
                        items.iter().filter_map(Entity::from_model_value).collect()
                    }
                    _ => Vec::new(),
                },
                quotes: parse::text_list(&obj, "quotes"),
                notes_for_reasoner: parse::text_field(&obj, "notes_for_reasoner")
                    .unwrap_or_default(),
            }),
            None => ParseOutcome::Heuristic(Self::heuristic(text)),
        }
    }

    /// Whole text as summary and notes, non-blank lines as facts.
    pub fn heuristic(text: &str) -> Self {
        let trimmed = text.trim();
        Self {
            summary: trimmed.to_string(),
            facts: text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| line.trim_matches(|c| c == '-' || c == ' ').to_string())
                .collect(),
            entities: Vec::new(),
            quotes: Vec::new(),
            notes_for_reasoner: trimmed.to_string(),
        }
    }

    /// Fold this digest into the canvas.
    fn merge_into(&self, canvas: &mut Canvas) {
        if !self.summary.is_empty() {
            canvas.summaries.push(self.summary.clone());
        }
        canvas.facts.extend(self.facts.iter().cloned());
        canvas.entities.extend(self.entities.iter().cloned());
        canvas.quotes.extend(self.quotes.iter().cloned());
        canvas.push_note(&self.notes_for_reasoner);
    }
}

/// Per-chunk record kept for debugging output.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    /// 1-based position of the chunk.
    pub chunk_index: usize,
    pub usage: TokenUsage,
    pub summary: ChunkDigest,
}

/// Output of [`TextEncoder::encode`].
#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub canvas: Canvas,
    /// Empty on a cache hit.
    pub chunk_summaries: Vec<ChunkSummary>,
    pub from_cache: bool,
}

impl EncodeResult {
    /// Total encoder usage across all chunk calls.
    pub fn usage(&self) -> TokenUsage {
        self.chunk_summaries.iter().map(|c| c.usage).sum()
    }
}

/// Builds canvases from raw text with a chat model.
pub struct TextEncoder<'a> {
    llm: &'a dyn ChatModel,
    model: String,
    config: EncoderConfig,
    canvas_store: Option<Arc<dyn CanvasStore>>,
}

impl<'a> TextEncoder<'a> {
    pub fn new(llm: &'a dyn ChatModel, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            config: EncoderConfig::default(),
            canvas_store: None,
        }
    }

    pub fn with_config(mut self, config: EncoderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_canvas_store(mut self, store: Arc<dyn CanvasStore>) -> Self {
        self.canvas_store = Some(store);
        self
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Produce (or load) the canvas for `raw_text` with respect to `question`.
    ///
    /// The cache is consulted and written only when `doc_id` is non-empty and
    /// a canvas store is configured. Chat or store errors abort the encode and
    /// nothing is cached.
    pub async fn encode(
        &self,
        raw_text: &str,
        question: &str,
        doc_id: Option<&str>,
    ) -> Result<EncodeResult, String> {
        let cache = match (doc_id.filter(|id| !id.is_empty()), &self.canvas_store) {
            (Some(id), Some(store)) => Some((id, store)),
            _ => None,
        };

        if let Some((id, store)) = cache
            && let Some(canvas) = store.load_canvas(id)?
        {
            debug!("Using cached canvas for doc_id={id}");
            return Ok(EncodeResult {
                canvas,
                chunk_summaries: Vec::new(),
                from_cache: true,
            });
        }

        let chunks = self.chunk_text(raw_text);
        let total = chunks.len();
        let mut canvas = Canvas::with_chunks(chunks.clone());
        let mut chunk_summaries = Vec::with_capacity(total);

        for (i, chunk) in chunks.iter().enumerate() {
            let index = i + 1;
            debug!(
                "Encoding chunk {index}/{total} ({} chars)",
                chunk.chars().count()
            );
            let request = ChatRequest::system_user(
                self.model.as_str(),
                self.config.system_prompt.as_str(),
                build_chunk_prompt(chunk, question, index, total),
                self.config.temperature,
                self.config.max_tokens,
            );
            let reply = self.llm.chat(&request).await?;

            let parsed = ChunkDigest::parse(&reply.text);
            if parsed.is_heuristic() {
                warn!("Chunk {index}/{total}: response was not a JSON object, using heuristic summary");
            }
            let digest = parsed.into_inner();
            digest.merge_into(&mut canvas);
            chunk_summaries.push(ChunkSummary {
                chunk_index: index,
                usage: reply.usage,
                summary: digest,
            });
        }

        if let Some((id, store)) = cache {
            store.save_canvas(id, &canvas)?;
        }

        Ok(EncodeResult {
            canvas,
            chunk_summaries,
            from_cache: false,
        })
    }

    /// Split text into trimmed, overlapping character windows.
    ///
    /// Empty input yields a single empty chunk. Text no longer than
    /// `chunk_size` is a single chunk. Longer text is cut into at most
    /// `max_chunks` windows advancing by `chunk_size - chunk_overlap`.
    pub fn chunk_text(&self, raw_text: &str) -> Vec<String> {
        if raw_text.is_empty() {
            return vec![String::new()];
        }
        let size = self.config.chunk_size.max(1);
        let chars: Vec<char> = raw_text.chars().collect();
        if chars.len() <= size {
            return vec![raw_text.trim().to_string()];
        }

        let stride = size.saturating_sub(self.config.chunk_overlap).max(1);
        let chunks: Vec<String> = (0..chars.len())
            .step_by(stride)
            .take(self.config.max_chunks)
            .map(|start| {
                let end = (start + size).min(chars.len());
                chars[start..end].iter().collect::<String>().trim().to_string()
            })
            .collect();
        debug!(
            "Chunked {} chars into {} pieces (max={})",
            chars.len(),
            chunks.len(),
            self.config.max_chunks
        );
        if chunks.is_empty() {
            vec![raw_text.trim().to_string()]
        } else {
            chunks
        }
    }
}

fn build_chunk_prompt(chunk: &str, question: &str, index: usize, total: usize) -> String {
    format!(
        "Chunk {index}/{total}\nQUESTION: {}\nCHUNK:\n{}\n\nRespond with valid JSON only.",
        question.trim(),
        chunk.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScriptedClient;
    use crate::store::MemoryCanvasStore;
    use serde_json::json;

    fn summary_json(summary: &str, note: &str) -> String {
        json!({
            "summary": summary,
            "facts": ["fact"],
            "entities": [{"name": "Acme", "type": "org", "description": "vendor"}],
            "quotes": ["\"q\""],
            "notes_for_reasoner": note
        })
        .to_string()
    }

    #[test]
    fn short_text_is_one_trimmed_chunk() {
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "m");
        assert_eq!(encoder.chunk_text("  Short text here.  "), vec!["Short text here."]);
        assert_eq!(encoder.chunk_text(""), vec![""]);
    }

    #[test]
    fn long_text_uses_overlapping_windows() {
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "m")
            .with_config(EncoderConfig::default().with_chunking(10, 4));
        let text: String = ('a'..='z').collect();
        let chunks = encoder.chunk_text(&text);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ghijklmnop");
        assert_eq!(chunks.last().map(String::as_str), Some("yz"));
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn windows_stop_at_max_chunks() {
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "m").with_config(
            EncoderConfig::default()
                .with_chunking(10, 0)
                .with_max_chunks(2),
        );
        let chunks = encoder.chunk_text(&"x".repeat(100));
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn overlap_larger_than_window_still_advances() {
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "m").with_config(
            EncoderConfig::default()
                .with_chunking(4, 10)
                .with_max_chunks(3),
        );
        let chunks = encoder.chunk_text("abcdefgh");
        assert_eq!(chunks, vec!["abcd", "bcde", "cdef"]);
    }

    #[test]
    fn heuristic_digest_splits_lines() {
        let parsed = ChunkDigest::parse("- first point\n\n - second -\nplain");
        assert!(parsed.is_heuristic());
        let digest = parsed.into_inner();
        assert_eq!(digest.facts, vec!["first point", "second", "plain"]);
        assert!(digest.entities.is_empty());
        assert_eq!(digest.summary, "- first point\n\n - second -\nplain");
        assert_eq!(digest.notes_for_reasoner, digest.summary);
    }

    #[test]
    fn structured_digest_backfills_missing_fields() {
        let parsed = ChunkDigest::parse(r#"{"summary": "only summary"}"#);
        assert!(!parsed.is_heuristic());
        let digest = parsed.into_inner();
        assert_eq!(digest.summary, "only summary");
        assert!(digest.facts.is_empty());
        assert!(digest.notes_for_reasoner.is_empty());
    }

    #[tokio::test]
    async fn encode_merges_chunks_in_order() {
        let client = ScriptedClient::new([summary_json("one", "n1"), summary_json("", "n2")]);
        let encoder = TextEncoder::new(&client, "small")
            .with_config(EncoderConfig::default().with_chunking(10, 0));
        let result = encoder
            .encode("0123456789abcdefghij", "What?", None)
            .await
            .unwrap();

        assert!(!result.from_cache);
        assert_eq!(result.canvas.raw_chunks, vec!["0123456789", "abcdefghij"]);
        assert_eq!(result.canvas.summaries, vec!["one"]);
        assert_eq!(result.canvas.facts.len(), 2);
        assert_eq!(result.canvas.entities.len(), 2);
        assert_eq!(result.canvas.notes_for_reasoner, "n1\nn2");
        assert_eq!(result.chunk_summaries[1].chunk_index, 2);
        assert!(result.usage().total_tokens > 0);

        let prompt = client.requests()[0].last_content().to_string();
        assert!(prompt.starts_with("Chunk 1/2\nQUESTION: What?\nCHUNK:\n0123456789"));
        assert!(prompt.ends_with("Respond with valid JSON only."));
    }

    #[tokio::test]
    async fn free_text_response_still_yields_canvas() {
        let client = ScriptedClient::new(["not json at all\n- but a fact"]);
        let encoder = TextEncoder::new(&client, "small");
        let result = encoder.encode("doc", "q", None).await.unwrap();
        assert_eq!(result.canvas.summaries, vec!["not json at all\n- but a fact"]);
        assert_eq!(result.canvas.facts, vec!["not json at all", "but a fact"]);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_model() {
        let store = Arc::new(MemoryCanvasStore::new());
        let client = ScriptedClient::new([summary_json("cached", "")]);
        let encoder = TextEncoder::new(&client, "small").with_canvas_store(store.clone());

        let first = encoder.encode("text", "q", Some("doc-1")).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(client.call_count(), 1);
        assert_eq!(store.len(), 1);

        let second = encoder.encode("text", "q", Some("doc-1")).await.unwrap();
        assert!(second.from_cache);
        assert!(second.chunk_summaries.is_empty());
        assert_eq!(second.canvas, first.canvas);
        assert_eq!(client.call_count(), 1);
    }

    /// Chat model that answers with a summary until call `fail_on`, then errors.
    struct FailsOnCall {
        fail_on: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ChatModel for FailsOnCall {
        fn chat<'a>(&'a self, _request: &'a ChatRequest) -> crate::ChatFuture<'a> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n == self.fail_on {
                    return Err::<crate::ChatReply, String>("boom".into());
                }
                Ok(crate::ChatReply {
                    text: summary_json("ok", ""),
                    usage: TokenUsage::new(1, 1),
                    raw: Value::Null,
                })
            })
        }
    }

    /// Canvas store that loads nothing and refuses every save.
    struct ReadOnlyStore;

    impl CanvasStore for ReadOnlyStore {
        fn load_canvas(&self, _doc_id: &str) -> Result<Option<Canvas>, String> {
            Ok(None)
        }

        fn save_canvas(&self, _doc_id: &str, _canvas: &Canvas) -> Result<(), String> {
            Err("disk full".to_string())
        }
    }

    #[tokio::test]
    async fn failure_mid_document_caches_nothing() {
        let store = Arc::new(MemoryCanvasStore::new());
        let client = FailsOnCall {
            fail_on: 2,
            calls: Default::default(),
        };
        let encoder = TextEncoder::new(&client, "small")
            .with_config(EncoderConfig::default().with_chunking(10, 0))
            .with_canvas_store(store.clone());

        let err = encoder
            .encode(&"x".repeat(30), "q", Some("doc-1"))
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_errors_reach_the_caller() {
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "small").with_canvas_store(Arc::new(ReadOnlyStore));
        let err = encoder
            .encode("text", "q", Some("doc-1"))
            .await
            .unwrap_err();
        assert_eq!(err, "disk full");
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_doc_id_bypasses_cache() {
        let store = Arc::new(MemoryCanvasStore::new());
        let client = ScriptedClient::rule_based();
        let encoder = TextEncoder::new(&client, "small").with_canvas_store(store.clone());
        encoder.encode("text", "q", Some("")).await.unwrap();
        assert!(store.is_empty());
    }
}
