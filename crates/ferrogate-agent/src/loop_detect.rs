//! Tool-loop detection.
//!
//! Tracks `(tool, argsHash) → resultDigest` per run. The same call yielding
//! the identical result three times in a row earns a warning (the loop
//! injects a change-strategy nudge); repeating it again after the warning is
//! critical and aborts the iteration with canned final content.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Identical repetitions that trigger the warning.
const WARN_REPEATS: u32 = 3;

/// Verdict after recording one tool result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopVerdict {
    Ok,
    /// Inject a one-shot "change strategy" nudge for this tool.
    Warning { tool: String },
    /// Abort the iteration; the run ends with canned content for this tool.
    Critical { tool: String },
}

#[derive(Default)]
struct CallRecord {
    digest: String,
    count: u32,
    warned: bool,
}

/// Per-run loop detector. Not shared across runs.
#[derive(Default)]
pub struct LoopDetector {
    records: HashMap<String, CallRecord>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed tool call and classify it.
    pub fn record(&mut self, tool: &str, args_hash: &str, result_digest: &str) -> LoopVerdict {
        let key = format!("{tool}|{args_hash}");
        let record = self.records.entry(key).or_default();

        if record.digest == result_digest {
            record.count += 1;
        } else {
            record.digest = result_digest.to_string();
            record.count = 1;
            record.warned = false;
        }

        if record.count >= WARN_REPEATS {
            if record.warned {
                return LoopVerdict::Critical {
                    tool: tool.to_string(),
                };
            }
            record.warned = true;
            return LoopVerdict::Warning {
                tool: tool.to_string(),
            };
        }
        LoopVerdict::Ok
    }
}

/// Stable hash of a tool's JSON argument string.
pub fn args_hash(arguments: &str) -> String {
    hex_digest(arguments.as_bytes())
}

/// Stable digest of a tool result.
pub fn result_digest(result: &str) -> String {
    hex_digest(result.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The nudge injected after a warning verdict.
pub fn change_strategy_message(tool: &str) -> String {
    format!(
        "You have called {tool} with the same arguments several times and \
         received the same result each time. Change strategy: try different \
         arguments, a different tool, or answer with what you already know."
    )
}

/// Canned final content for a critical verdict.
pub fn critical_abort_message(tool: &str) -> String {
    format!(
        "I was unable to complete this task — I got stuck repeatedly calling \
         {tool} without making progress. Please try rephrasing your request."
    )
}
