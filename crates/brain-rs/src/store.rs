//! Persistence for canvases (keyed by document id) and controller state
//! (one current value per store).
//!
//! Both stores are read-then-written without any locking: concurrent encodes
//! of the same document or concurrent controller calls race, and the last
//! write wins.

use crate::canvas::Canvas;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Controller state: one flat JSON object.
pub type StateMap = Map<String, Value>;

// ── Traits ─────────────────────────────────────────────────────────

/// Canvas cache keyed by an arbitrary document id.
pub trait CanvasStore: Send + Sync {
    /// Load a cached canvas, or `None` if nothing is stored for `doc_id`.
    fn load_canvas(&self, doc_id: &str) -> Result<Option<Canvas>, String>;

    /// Store a canvas, replacing any previous entry for `doc_id`.
    fn save_canvas(&self, doc_id: &str, canvas: &Canvas) -> Result<(), String>;
}

/// Single-slot store for the controller's last decision.
pub trait StateStore: Send + Sync {
    fn load_state(&self) -> Result<Option<StateMap>, String>;

    /// Overwrite the stored state.
    fn save_state(&self, state: &StateMap) -> Result<(), String>;
}

// ── File-backed stores ─────────────────────────────────────────────

/// Atomic write: serialize to a temp file, then rename into place.
fn write_json_atomic(path: &Path, value: &Value) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("failed to serialize {}: {e}", path.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)
        .map_err(|e| format!("failed to write {}: {e}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("failed to rename into {}: {e}", path.display()))
}

fn read_json(path: &Path) -> Result<Option<Value>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let value = serde_json::from_str(&data)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    Ok(Some(value))
}

/// One pretty-printed JSON file per document under a root directory.
///
/// ```text
/// root/
///   doc-1.json
///   reports_q3.json     <- doc id "reports/q3"
/// ```
#[derive(Debug, Clone)]
pub struct FileCanvasStore {
    root: PathBuf,
}

impl FileCanvasStore {
    /// Create a store, ensuring the root directory exists.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, String> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("failed to create canvas store {}: {e}", root.display()))?;
        Ok(Self { root })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, doc_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", doc_id.replace('/', "_")))
    }
}

impl CanvasStore for FileCanvasStore {
    fn load_canvas(&self, doc_id: &str) -> Result<Option<Canvas>, String> {
        match read_json(&self.path_for(doc_id))? {
            Some(value) => {
                debug!("Loaded cached canvas for doc_id={doc_id}");
                Canvas::from_value(value).map(Some)
            }
            None => Ok(None),
        }
    }

    fn save_canvas(&self, doc_id: &str, canvas: &Canvas) -> Result<(), String> {
        write_json_atomic(&self.path_for(doc_id), &canvas.to_value()?)?;
        debug!("Saved canvas for doc_id={doc_id}");
        Ok(())
    }
}

/// Controller state in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    /// Create a store, ensuring the parent directory exists.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create state dir {}: {e}", parent.display()))?;
        }
        Ok(Self { path })
    }
}

impl StateStore for JsonStateStore {
    fn load_state(&self) -> Result<Option<StateMap>, String> {
        match read_json(&self.path)? {
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(format!(
                "state file {} does not hold a JSON object",
                self.path.display()
            )),
            None => Ok(None),
        }
    }

    fn save_state(&self, state: &StateMap) -> Result<(), String> {
        write_json_atomic(&self.path, &Value::Object(state.clone()))
    }
}

// ── In-memory stores ───────────────────────────────────────────────

/// Volatile canvas store, primarily for tests.
#[derive(Debug, Default)]
pub struct MemoryCanvasStore {
    canvases: Mutex<HashMap<String, Canvas>>,
}

impl MemoryCanvasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.canvases.lock().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CanvasStore for MemoryCanvasStore {
    fn load_canvas(&self, doc_id: &str) -> Result<Option<Canvas>, String> {
        let canvases = self
            .canvases
            .lock()
            .map_err(|e| format!("canvas store lock poisoned: {e}"))?;
        Ok(canvases.get(doc_id).cloned())
    }

    fn save_canvas(&self, doc_id: &str, canvas: &Canvas) -> Result<(), String> {
        let mut canvases = self
            .canvases
            .lock()
            .map_err(|e| format!("canvas store lock poisoned: {e}"))?;
        canvases.insert(doc_id.to_string(), canvas.clone());
        Ok(())
    }
}

/// Volatile state store. The controller's default.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<StateMap>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load_state(&self) -> Result<Option<StateMap>, String> {
        let state = self
            .state
            .lock()
            .map_err(|e| format!("state store lock poisoned: {e}"))?;
        Ok(state.clone())
    }

    fn save_state(&self, new_state: &StateMap) -> Result<(), String> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| format!("state store lock poisoned: {e}"))?;
        *state = Some(new_state.clone());
        Ok(())
    }
}
