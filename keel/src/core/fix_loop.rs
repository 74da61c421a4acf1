//! Bounded retry loop for mechanical failures (syntax, lint, type errors).
//!
//! Logic and runtime failures are never retried here; they go back to the
//! controller for a real retry decision.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::verification::VerifyTier;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Syntax,
    Lint,
    TypeError,
    Logic,
    Runtime,
    Unknown,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Syntax | FailureKind::Lint | FailureKind::TypeError
        )
    }
}

/// Outcome of one syntax/lint check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub passed: bool,
    pub kind: Option<FailureKind>,
    pub output: String,
}

impl CheckResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            kind: None,
            output: String::new(),
        }
    }

    /// A failed check, classified from its output.
    pub fn failed(output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            passed: false,
            kind: Some(classify_failure(&output)),
            output,
        }
    }

    /// A failed verification tier. Test and CI tiers exercise behavior, so
    /// their failures are logic failures whatever the output says.
    pub fn failed_at(tier: VerifyTier, output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            passed: false,
            kind: Some(classify_tier_failure(tier, &output)),
            output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NotRetryable(FailureKind),
    AttemptsExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Passed,
    Retry { attempt: u32, remaining: u32 },
    Stop(StopReason),
}

#[derive(Debug, Clone)]
pub struct BoundedFixLoop {
    max_attempts: u32,
    failures: u32,
    history: Vec<FailureKind>,
}

impl Default for BoundedFixLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl BoundedFixLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: 0,
            history: Vec::new(),
        }
    }

    /// Record one check. A retryable failure earns another attempt until
    /// `max_attempts` failures have been seen.
    pub fn record(&mut self, result: &CheckResult) -> LoopDecision {
        if result.passed {
            return LoopDecision::Passed;
        }
        let kind = result.kind.unwrap_or(FailureKind::Unknown);
        self.history.push(kind);
        self.failures += 1;
        if !kind.is_retryable() {
            return LoopDecision::Stop(StopReason::NotRetryable(kind));
        }
        if self.failures > self.max_attempts {
            return LoopDecision::Stop(StopReason::AttemptsExhausted {
                attempts: self.failures,
            });
        }
        LoopDecision::Retry {
            attempt: self.failures,
            remaining: self.max_attempts - self.failures,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn history(&self) -> &[FailureKind] {
        &self.history
    }
}

struct Signature {
    kind: FailureKind,
    pattern: Regex,
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    [
        (
            FailureKind::Syntax,
            r"(?i)SyntaxError|IndentationError|unexpected token|unexpected EOF|expected one of|unterminated|parse error|syntax error",
        ),
        (
            FailureKind::TypeError,
            r"(?i)error\[E0308\]|mismatched types|TypeError\b.*\bargument|\bargument\b.*TypeError|is not assignable to|incompatible types?|cannot use .* as .* value",
        ),
        (
            FailureKind::Lint,
            r"(?i)\blint\b|clippy::|eslint|flake8|ruff|pylint|\b[EFW]\d{3}\b|unused (?:import|variable)|declared (?:and|but) not used",
        ),
        (
            FailureKind::Logic,
            r"(?i)AssertionError|assertion failed|assert_eq!|expected .* (?:but )?(?:got|received)|FAILED .*test|test result: FAILED",
        ),
        (
            FailureKind::Runtime,
            r"(?i)Traceback|panicked at|Segmentation fault|RuntimeError|ReferenceError|NullPointerException|KeyError|IndexError|timed out",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| Signature {
        kind,
        pattern: Regex::new(pattern).unwrap(),
    })
    .collect()
});

/// Classify checker output by the first matching signature family.
pub fn classify_failure(output: &str) -> FailureKind {
    SIGNATURES
        .iter()
        .find(|sig| sig.pattern.is_match(output))
        .map(|sig| sig.kind)
        .unwrap_or(FailureKind::Unknown)
}

pub fn classify_tier_failure(tier: VerifyTier, output: &str) -> FailureKind {
    match tier {
        VerifyTier::UnitTest | VerifyTier::IntegrationTest | VerifyTier::CiGate => {
            FailureKind::Logic
        }
        VerifyTier::Syntax | VerifyTier::Lint => classify_failure(output),
    }
}
