//! Runtime settings for the pipeline and the experiment runner.
//!
//! [`Settings`] is an explicitly constructed, immutable value passed into
//! constructors. [`Settings::from_env`] reads it once at startup; tests build
//! it directly.

use crate::{DEFAULT_BASE_URL, DEFAULT_LARGE_MODEL, DEFAULT_SMALL_MODEL};

/// Model selection and sampling defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// API key for the live client. `None` restricts callers to the stub.
    pub api_key: Option<String>,
    /// OpenAI-compatible API root. Default: [`DEFAULT_BASE_URL`].
    pub base_url: String,
    /// Encoder, controller, and small reasoning tier. Default: `gpt-4o-mini`.
    pub small_model: String,
    /// Large reasoning tier and baseline. Default: `gpt-4o`.
    pub large_model: String,
    /// Temperature for baseline calls. Default: `0.2`.
    pub default_temperature: f32,
    /// Token cap for baseline calls. Default: none.
    pub max_tokens: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            small_model: DEFAULT_SMALL_MODEL.to_string(),
            large_model: DEFAULT_LARGE_MODEL.to_string(),
            default_temperature: 0.2,
            max_tokens: None,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OPENAI_API_KEY` (or `openai`) | `api_key` |
    /// | `OPENAI_BASE_URL` | `base_url` |
    /// | `BRAIN_SMALL_MODEL` | `small_model` |
    /// | `BRAIN_LARGE_MODEL` | `large_model` |
    /// | `BRAIN_DEFAULT_TEMPERATURE` | `default_temperature` |
    /// | `BRAIN_MAX_TOKENS` | `max_tokens` |
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset or empty values
    /// keep their defaults; unparsable numbers are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let default_temperature = match get("BRAIN_DEFAULT_TEMPERATURE") {
            Some(raw) => raw
                .trim()
                .parse::<f32>()
                .map_err(|e| format!("invalid BRAIN_DEFAULT_TEMPERATURE '{raw}': {e}"))?,
            None => defaults.default_temperature,
        };
        let max_tokens = match get("BRAIN_MAX_TOKENS") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u32>()
                    .map_err(|e| format!("invalid BRAIN_MAX_TOKENS '{raw}': {e}"))?,
            ),
            None => None,
        };

        Ok(Self {
            api_key: get("OPENAI_API_KEY").or_else(|| get("openai")),
            base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            small_model: get("BRAIN_SMALL_MODEL").unwrap_or(defaults.small_model),
            large_model: get("BRAIN_LARGE_MODEL").unwrap_or(defaults.large_model),
            default_temperature,
            max_tokens,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_models(mut self, small: impl Into<String>, large: impl Into<String>) -> Self {
        self.small_model = small.into();
        self.large_model = large.into();
        self
    }
}
