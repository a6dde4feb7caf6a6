//! Input guard: pattern scan over user content before the run starts.

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use ferrogate_core::config::{GuardAction, GuardConfig};

/// Raised when the guard's action is `block` and a pattern matched.
#[derive(Debug, Error)]
#[error("input blocked by guard rule: {pattern}")]
pub struct GuardBlocked {
    pub pattern: String,
}

/// Compiled guard rule set.
pub struct InputGuard {
    action: GuardAction,
    rules: Vec<(String, Regex)>,
}

impl InputGuard {
    /// Compile the configured patterns. Invalid patterns are skipped with a
    /// warning rather than failing startup.
    pub fn new(config: &GuardConfig) -> Self {
        let rules = config
            .patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some((p.clone(), re)),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid guard pattern, skipping");
                    None
                }
            })
            .collect();
        Self {
            action: config.action,
            rules,
        }
    }

    /// Scan `content`. Returns `Err(GuardBlocked)` only under the `block`
    /// action; otherwise matches are logged and the run proceeds.
    pub fn check(&self, content: &str) -> Result<Vec<String>, GuardBlocked> {
        if self.action == GuardAction::Off {
            return Ok(Vec::new());
        }

        let matched: Vec<String> = self
            .rules
            .iter()
            .filter(|(_, re)| re.is_match(content))
            .map(|(p, _)| p.clone())
            .collect();

        if matched.is_empty() {
            return Ok(Vec::new());
        }

        match self.action {
            GuardAction::Block => Err(GuardBlocked {
                pattern: matched[0].clone(),
            }),
            GuardAction::Warn => {
                warn!(patterns = ?matched, "input guard matched suspicious content");
                Ok(matched)
            }
            GuardAction::Log => {
                tracing::info!(patterns = ?matched, "input guard matched");
                Ok(matched)
            }
            GuardAction::Off => Ok(Vec::new()),
        }
    }
}

/// Truncate an over-long user message, appending a system-visible notice.
pub fn truncate_message(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{kept}\n\n[System notice: message truncated to {max_chars} characters]")
}
