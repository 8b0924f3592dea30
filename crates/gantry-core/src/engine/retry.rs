//! Failure classification and retry backoff policy.
//!
//! Stateless: callers pass the error message and attempt number, and get
//! back a decision. Two layers:
//! - [`classify`] sorts an arbitrary failure into a small taxonomy based on
//!   message signatures.
//! - [`RetryPolicy`] turns a classification plus attempt count into
//!   whether/when to retry (exponential backoff with a cap and symmetric
//!   jitter).
//!
//! The policy is independent of the workflow engine; the worker invokes it
//! when a processor fails and passes the computed delay to the queue.

use gantry_types::graph::RetryOverrides;
use rand::Rng;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network blips, timeouts, rate limits, overload. Retryable with a
    /// generous attempt budget.
    Transient,
    /// Upstream 5xx / busy / capacity signals. Retryable with a longer base
    /// delay.
    Recoverable,
    /// Kill signals, nested-session conflicts, auth/not-found/malformed
    /// input. Never retried.
    Permanent,
    /// Anything unmatched. Retryable with a conservative budget.
    Unknown,
}

/// Result of classifying one failure.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    /// Minimum delay the error itself asks for (e.g. rate limiting).
    pub suggested_delay_ms: Option<u64>,
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "network",
    "dns",
    "overloaded",
    "temporarily unavailable",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests", "429"];

const RECOVERABLE_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "busy",
    "capacity",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "killed by signal",
    "sigkill",
    "sigterm",
    "nested session",
    "session already active",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "401",
    "403",
    "404",
    "not found",
    "malformed",
    "invalid input",
    "invalid expression",
];

/// Minimum delay applied to rate-limit failures.
const RATE_LIMIT_DELAY_MS: u64 = 30_000;

/// Classify a failure by its message.
pub fn classify(error: &str) -> Classification {
    let message = error.to_lowercase();

    if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Permanent,
            retryable: false,
            suggested_delay_ms: None,
        };
    }

    if RATE_LIMIT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Transient,
            retryable: true,
            suggested_delay_ms: Some(RATE_LIMIT_DELAY_MS),
        };
    }

    if TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Transient,
            retryable: true,
            suggested_delay_ms: None,
        };
    }

    if RECOVERABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return Classification {
            category: ErrorCategory::Recoverable,
            retryable: true,
            suggested_delay_ms: None,
        };
    }

    Classification {
        category: ErrorCategory::Unknown,
        retryable: true,
        suggested_delay_ms: None,
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Backoff parameters for one error category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

/// Retry policy with per-category defaults, a delay cap, and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transient: CategoryPolicy,
    pub recoverable: CategoryPolicy,
    pub unknown: CategoryPolicy,
    /// Upper bound on the computed backoff before jitter.
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the capped delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient: CategoryPolicy {
                max_attempts: 5,
                base_delay_ms: 500,
                multiplier: 2.0,
            },
            recoverable: CategoryPolicy {
                max_attempts: 4,
                base_delay_ms: 2_000,
                multiplier: 2.0,
            },
            unknown: CategoryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                multiplier: 2.0,
            },
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
        }
    }
}

/// Outcome of a retry decision for one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
    pub reason: String,
    pub category: ErrorCategory,
}

impl RetryPolicy {
    /// Category defaults for a retryable category; Permanent has none.
    fn category_policy(&self, category: ErrorCategory) -> Option<&CategoryPolicy> {
        match category {
            ErrorCategory::Transient => Some(&self.transient),
            ErrorCategory::Recoverable => Some(&self.recoverable),
            ErrorCategory::Unknown => Some(&self.unknown),
            ErrorCategory::Permanent => None,
        }
    }

    /// The hard attempt ceiling for dispatch: the node override when present,
    /// otherwise the most generous category budget. Category-specific budgets
    /// usually stop retries earlier; this bound is what the worker enforces
    /// before dispatching at all.
    pub fn hard_ceiling(&self, overrides: Option<&RetryOverrides>) -> u32 {
        overrides
            .and_then(|o| o.max_attempts)
            .unwrap_or_else(|| {
                self.transient
                    .max_attempts
                    .max(self.recoverable.max_attempts)
                    .max(self.unknown.max_attempts)
            })
    }

    /// Capped exponential backoff, before jitter:
    /// `base × multiplier^(attempt-1)`, bounded by `max_delay_ms`.
    fn backoff_ms(&self, base_delay_ms: u64, multiplier: f64, attempt: u32) -> u64 {
        if attempt == 0 || base_delay_ms == 0 {
            return 0;
        }
        let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = (base_delay_ms as f64) * factor;
        (raw as u64).min(self.max_delay_ms)
    }

    /// Decide whether and when to retry after `attempt` failed (1-based).
    ///
    /// Permanent errors stop immediately regardless of remaining budget; all
    /// other categories stop once the attempt ceiling is reached. The final
    /// delay is the jittered backoff, floored at zero, and never below the
    /// classification's suggested minimum.
    pub fn should_retry(
        &self,
        error: &str,
        attempt: u32,
        overrides: Option<&RetryOverrides>,
    ) -> RetryDecision {
        let classification = classify(error);
        let category = classification.category;

        let Some(defaults) = self.category_policy(category) else {
            return RetryDecision {
                retry: false,
                delay_ms: 0,
                reason: "permanent error, not retryable".to_string(),
                category,
            };
        };

        let max_attempts = overrides
            .and_then(|o| o.max_attempts)
            .unwrap_or(defaults.max_attempts);
        if attempt >= max_attempts {
            return RetryDecision {
                retry: false,
                delay_ms: 0,
                reason: format!("attempt {attempt} reached the limit of {max_attempts}"),
                category,
            };
        }

        let base = overrides
            .and_then(|o| o.base_delay_ms)
            .unwrap_or(defaults.base_delay_ms);
        let multiplier = overrides
            .and_then(|o| o.multiplier)
            .unwrap_or(defaults.multiplier);

        let capped = self.backoff_ms(base, multiplier, attempt);
        let jitter_span = (capped as f64) * self.jitter_factor;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };
        let jittered = ((capped as f64) + jitter).max(0.0) as u64;
        let delay_ms = jittered.max(classification.suggested_delay_ms.unwrap_or(0));

        RetryDecision {
            retry: true,
            delay_ms,
            reason: format!(
                "attempt {attempt} of {max_attempts} failed with a {category:?} error, retrying"
            ),
            category,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Jitter-free policy for exact delay assertions.
    fn exact_policy() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    // -------------------------------------------------------------------
    // classify
    // -------------------------------------------------------------------

    #[test]
    fn test_classify_transient() {
        for msg in [
            "connection timed out after 30s",
            "network unreachable",
            "upstream overloaded, retry later",
        ] {
            let c = classify(msg);
            assert_eq!(c.category, ErrorCategory::Transient, "{msg}");
            assert!(c.retryable);
        }
    }

    #[test]
    fn test_classify_rate_limit_suggests_delay() {
        let c = classify("HTTP 429 Too Many Requests");
        assert_eq!(c.category, ErrorCategory::Transient);
        assert_eq!(c.suggested_delay_ms, Some(30_000));
    }

    #[test]
    fn test_classify_recoverable() {
        for msg in [
            "HTTP 503 Service Unavailable",
            "internal server error",
            "backend at capacity",
        ] {
            let c = classify(msg);
            assert_eq!(c.category, ErrorCategory::Recoverable, "{msg}");
            assert!(c.retryable);
        }
    }

    #[test]
    fn test_classify_permanent() {
        for msg in [
            "process killed by signal 9",
            "nested session detected",
            "401 unauthorized",
            "resource not found",
            "malformed request body",
        ] {
            let c = classify(msg);
            assert_eq!(c.category, ErrorCategory::Permanent, "{msg}");
            assert!(!c.retryable);
        }
    }

    #[test]
    fn test_classify_unknown_default() {
        let c = classify("something inexplicable happened");
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.retryable);
    }

    // -------------------------------------------------------------------
    // should_retry
    // -------------------------------------------------------------------

    #[test]
    fn test_permanent_never_retries_even_on_first_attempt() {
        let policy = exact_policy();
        let decision = policy.should_retry("403 forbidden", 1, None);
        assert!(!decision.retry);
        assert_eq!(decision.category, ErrorCategory::Permanent);
    }

    #[test]
    fn test_retry_stops_at_category_ceiling() {
        let policy = exact_policy();
        // Unknown default budget is 3
        assert!(policy.should_retry("mystery", 1, None).retry);
        assert!(policy.should_retry("mystery", 2, None).retry);
        assert!(!policy.should_retry("mystery", 3, None).retry);
        assert!(!policy.should_retry("mystery", 4, None).retry);
    }

    #[test]
    fn test_node_override_max_attempts_wins() {
        let policy = exact_policy();
        let overrides = RetryOverrides {
            max_attempts: Some(1),
            base_delay_ms: None,
            multiplier: None,
        };
        // Transient default budget is 5, but the node says 1
        let decision = policy.should_retry("connection timed out", 1, Some(&overrides));
        assert!(!decision.retry);

        let generous = RetryOverrides {
            max_attempts: Some(10),
            base_delay_ms: None,
            multiplier: None,
        };
        assert!(policy.should_retry("mystery", 5, Some(&generous)).retry);
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = exact_policy();
        let d1 = policy.should_retry("connection timed out", 1, None).delay_ms;
        let d2 = policy.should_retry("connection timed out", 2, None).delay_ms;
        let d3 = policy.should_retry("connection timed out", 3, None).delay_ms;
        assert_eq!(d1, 500);
        assert_eq!(d2, 1_000);
        assert_eq!(d3, 2_000);

        let overrides = RetryOverrides {
            max_attempts: Some(50),
            base_delay_ms: Some(10_000),
            multiplier: Some(10.0),
        };
        let capped = policy.should_retry("connection timed out", 10, Some(&overrides));
        assert_eq!(capped.delay_ms, policy.max_delay_ms);
    }

    #[test]
    fn test_delay_monotonic_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..4u32 {
            let decision = policy.should_retry("connection timed out", attempt, None);
            let capped = 500u64 * 2u64.pow(attempt - 1);
            let lo = ((capped as f64) * (1.0 - policy.jitter_factor)).floor() as u64;
            let hi = ((capped as f64) * (1.0 + policy.jitter_factor)).ceil() as u64;
            assert!(
                decision.delay_ms >= lo && decision.delay_ms <= hi,
                "attempt {attempt}: {} outside [{lo}, {hi}]",
                decision.delay_ms
            );
        }
    }

    #[test]
    fn test_rate_limit_delay_floor() {
        let policy = exact_policy();
        let decision = policy.should_retry("429 too many requests", 1, None);
        assert!(decision.retry);
        // Backoff for attempt 1 is 500ms; the rate-limit floor dominates
        assert_eq!(decision.delay_ms, 30_000);
    }

    #[test]
    fn test_hard_ceiling() {
        let policy = exact_policy();
        assert_eq!(policy.hard_ceiling(None), 5);
        let overrides = RetryOverrides {
            max_attempts: Some(2),
            base_delay_ms: None,
            multiplier: None,
        };
        assert_eq!(policy.hard_ceiling(Some(&overrides)), 2);
    }
}
