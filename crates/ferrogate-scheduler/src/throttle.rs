//! Adaptive per-session throttle.
//!
//! Concurrent runs on one session race against summarization: each requests
//! the full context and the combined prompt tokens explode right when the
//! window is nearly full. The throttle degrades session concurrency as the
//! estimated context usage approaches the cliff, and adds a short back-off
//! at the top so an in-flight summarization can win the race.

use std::time::Duration;

/// Context usage below this leaves concurrency unchanged.
const RATIO_SOFT: f64 = 0.6;
/// Context usage at or above this forces serial execution plus back-off.
const RATIO_HARD: f64 = 0.85;
/// Admission delay applied in the hard band.
const HARD_BACKOFF: Duration = Duration::from_millis(250);

/// What the throttle decided for one admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// Cap on the session's concurrency (applied with `min`).
    pub cap: usize,
    /// Delay to apply before admission, if any.
    pub backoff: Option<Duration>,
}

impl ThrottleDecision {
    fn unchanged(base: usize) -> Self {
        Self {
            cap: base,
            backoff: None,
        }
    }
}

/// Compute the throttled session concurrency.
///
/// `base` is the effective concurrency before throttling; `estimate` is the
/// token estimator's `(estimated_tokens, context_window)`, when available.
pub fn throttle_cap(base: usize, estimate: Option<(u64, u64)>) -> ThrottleDecision {
    let Some((estimated, context_window)) = estimate else {
        return ThrottleDecision::unchanged(base);
    };
    if context_window == 0 {
        return ThrottleDecision::unchanged(base);
    }

    let ratio = estimated as f64 / context_window as f64;
    if ratio < RATIO_SOFT {
        ThrottleDecision::unchanged(base)
    } else if ratio < RATIO_HARD {
        ThrottleDecision {
            cap: base.min(1),
            backoff: None,
        }
    } else {
        ThrottleDecision {
            cap: base.min(1),
            backoff: Some(HARD_BACKOFF),
        }
    }
}
