use std::time::Duration;

use crate::diagram::ParseMode;
use crate::history::DEFAULT_MAX_HISTORY;

const DRAG_THRESHOLD_DEFAULT: f32 = 5.0;
const GEMINI_MODEL_DEFAULT: &str = "gemini-2.5-flash";
const GEMINI_URL_DEFAULT: &str = "https://generativelanguage.googleapis.com/v1beta";
const AI_TIMEOUT_SECS_DEFAULT: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct EditorConfig {
    pub max_history: usize,
    pub strict_parsing: bool,
    /// Pointer travel, in canvas units, before a press becomes a drag.
    pub drag_threshold: f32,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            max_history: std::env::var("FLOWPAD_MAX_HISTORY")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_MAX_HISTORY),
            strict_parsing: std::env::var("FLOWPAD_STRICT_PARSING")
                .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            drag_threshold: std::env::var("FLOWPAD_DRAG_THRESHOLD")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(DRAG_THRESHOLD_DEFAULT),
        }
    }
}

impl EditorConfig {
    pub fn parse_mode(&self) -> ParseMode {
        if self.strict_parsing {
            ParseMode::Strict
        } else {
            ParseMode::Lenient
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            model: std::env::var("FLOWPAD_GEMINI_MODEL")
                .unwrap_or_else(|_| GEMINI_MODEL_DEFAULT.to_string()),
            base_url: std::env::var("FLOWPAD_GEMINI_URL")
                .unwrap_or_else(|_| GEMINI_URL_DEFAULT.to_string()),
            timeout_secs: std::env::var("FLOWPAD_AI_TIMEOUT_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(AI_TIMEOUT_SECS_DEFAULT),
        }
    }
}

impl AssistConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}
