//! Keyword/length based backend model selection.
//!
//! Precedence, first match wins:
//! 1. reasoning keywords ("think step by step", "prove", ...) -> `reasoning`
//! 2. code keywords or fenced code -> `code`
//! 3. short prompts (under [`SHORT_PROMPT_CHARS`]) -> `fast`
//! 4. everything else -> `default`

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prompts shorter than this many characters go to the fast model.
pub const SHORT_PROMPT_CHARS: usize = 280;

static REASONING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(think|reason(?:ing)?|step[- ]by[- ]step|prove|proof|derive|analy[sz]e|trade-?offs?|explain why|plan)\b",
    )
    .expect("reasoning pattern is valid")
});

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)```|\b(code|function|class|method|compile[rd]?|bug|debug|refactor|stack ?trace|regex|sql|rust|python|javascript|typescript|golang|java|bash|script|api)\b",
    )
    .expect("code pattern is valid")
});

/// Backend model identifiers the router chooses between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSet {
    pub reasoning: String,
    pub code: String,
    pub fast: String,
    pub default: String,
}

impl Default for ModelSet {
    fn default() -> Self {
        Self {
            reasoning: "deepseek-r1:8b".to_string(),
            code: "qwen2.5-coder:7b".to_string(),
            fast: "llama3.2:3b".to_string(),
            default: "llama3.1:8b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Reasoning,
    Code,
    Fast,
    Default,
}

/// Classify a prompt. Pure and deterministic.
pub fn classify(text: &str) -> ModelTier {
    if REASONING_PATTERN.is_match(text) {
        ModelTier::Reasoning
    } else if CODE_PATTERN.is_match(text) {
        ModelTier::Code
    } else if text.chars().count() < SHORT_PROMPT_CHARS {
        ModelTier::Fast
    } else {
        ModelTier::Default
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    models: ModelSet,
}

impl ModelRouter {
    pub fn new(models: ModelSet) -> Self {
        Self { models }
    }

    pub fn pick_model(&self, text: &str) -> &str {
        match classify(text) {
            ModelTier::Reasoning => &self.models.reasoning,
            ModelTier::Code => &self.models.code,
            ModelTier::Fast => &self.models.fast,
            ModelTier::Default => &self.models.default,
        }
    }

    /// Distinct model ids, in tier order.
    pub fn models(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(4);
        for id in [
            self.models.reasoning.as_str(),
            self.models.code.as_str(),
            self.models.fast.as_str(),
            self.models.default.as_str(),
        ] {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
