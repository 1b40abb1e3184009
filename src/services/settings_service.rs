use serde::{Deserialize, Serialize};

use crate::data::tag_store::SqliteTagStore;
use crate::error::AppError;

pub const SETTINGS_KEY: &str = "llm_settings";
pub const API_KEY_ENV: &str = "MARKSMITH_API_KEY";
const CUSTOM_MODEL: &str = "custom";
const DEFAULT_TIMEOUT_SECS: u64 = 90;

/// Connection settings for an OpenAI-compatible chat completions endpoint.
///
/// `base_url` is the full completions URL. A `model` of `"custom"` means the
/// name in `custom_model` is used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub custom_model: String,
    /// Allows streamed responses when a caller asks for them.
    pub stream: bool,
    pub request_timeout_secs: u64,
    pub max_attempts: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            custom_model: String::new(),
            stream: true,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: 1,
        }
    }
}

impl LlmSettings {
    pub fn effective_model(&self) -> &str {
        if self.model == CUSTOM_MODEL {
            self.custom_model.trim()
        } else {
            self.model.trim()
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.provider.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(AppError::Config(
                "no provider or API key configured".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(AppError::Config("API URL is not configured".to_string()));
        }
        if self.effective_model().is_empty() {
            return Err(AppError::Config("no model selected".to_string()));
        }
        Ok(())
    }

    /// Fills an empty stored key from the environment.
    pub fn with_env_override(mut self) -> Self {
        if self.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                self.api_key = key;
            }
        }
        self
    }
}

/// Stored settings merged over defaults. A corrupt record is logged and
/// treated as absent.
pub fn load_llm_settings(store: &SqliteTagStore) -> Result<LlmSettings, AppError> {
    let settings = match store.get_setting(SETTINGS_KEY)? {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "stored llm settings are unreadable, using defaults");
            LlmSettings::default()
        }),
        None => LlmSettings::default(),
    };
    Ok(settings.with_env_override())
}

pub fn save_llm_settings(store: &SqliteTagStore, settings: &LlmSettings) -> Result<(), AppError> {
    let raw = serde_json::to_string(settings)?;
    store.set_setting(SETTINGS_KEY, &raw)
}
