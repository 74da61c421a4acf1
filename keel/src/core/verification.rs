//! Tiered verification pipeline: cheap checks first, stop at the first failure.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyTier {
    Syntax,
    Lint,
    UnitTest,
    IntegrationTest,
    CiGate,
}

impl VerifyTier {
    pub const ALL: [VerifyTier; 5] = [
        VerifyTier::Syntax,
        VerifyTier::Lint,
        VerifyTier::UnitTest,
        VerifyTier::IntegrationTest,
        VerifyTier::CiGate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VerifyTier::Syntax => "SYNTAX",
            VerifyTier::Lint => "LINT",
            VerifyTier::UnitTest => "UNIT_TEST",
            VerifyTier::IntegrationTest => "INTEGRATION_TEST",
            VerifyTier::CiGate => "CI_GATE",
        }
    }

    pub fn parse(raw: &str) -> Option<VerifyTier> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        VerifyTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
    }
}

impl fmt::Display for VerifyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierResult {
    pub tier: VerifyTier,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TierResult {
    pub fn pass(tier: VerifyTier, duration_ms: u64) -> Self {
        Self {
            tier,
            passed: true,
            duration_ms,
            details: String::new(),
            errors: Vec::new(),
        }
    }

    pub fn fail(tier: VerifyTier, duration_ms: u64, errors: Vec<String>) -> Self {
        Self {
            tier,
            passed: false,
            duration_ms,
            details: String::new(),
            errors,
        }
    }
}

/// Executes one tier. `None` means the runner has nothing to run for the tier
/// (no command configured) and the tier is recorded as skipped.
pub trait TierRunner {
    fn run_tier(&mut self, tier: VerifyTier) -> Option<TierResult>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Results of tiers that actually ran, in order.
    pub executed: Vec<TierResult>,
    /// Tiers skipped by configuration or because nothing was configured.
    pub skipped: Vec<VerifyTier>,
    /// Tiers after the stopping tier that never ran.
    pub not_reached: Vec<VerifyTier>,
    pub stopped_at: Option<VerifyTier>,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.stopped_at.is_none() && self.executed.iter().all(|r| r.passed)
    }

    /// Highest tier that ran and passed.
    pub fn highest_passed(&self) -> Option<VerifyTier> {
        self.executed
            .iter()
            .filter(|r| r.passed)
            .map(|r| r.tier)
            .max()
    }

    pub fn failed(&self) -> Option<&TierResult> {
        self.executed.iter().find(|r| !r.passed)
    }

    pub fn was_executed(&self, tier: VerifyTier) -> bool {
        self.executed.iter().any(|r| r.tier == tier)
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .executed
            .iter()
            .map(|r| format!("{}={}", r.tier, if r.passed { "pass" } else { "FAIL" }))
            .collect();
        parts.extend(self.skipped.iter().map(|t| format!("{t}=skipped")));
        parts.extend(self.not_reached.iter().map(|t| format!("{t}=not_reached")));
        match self.stopped_at {
            Some(tier) => format!("stopped at {tier}: {}", parts.join(", ")),
            None => format!("all executed tiers passed: {}", parts.join(", ")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationPipeline {
    tiers: Vec<VerifyTier>,
    skip: Vec<VerifyTier>,
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::new(VerifyTier::ALL.to_vec(), Vec::new())
    }
}

impl VerificationPipeline {
    /// Tiers always run in their natural order regardless of input order.
    pub fn new(mut tiers: Vec<VerifyTier>, skip: Vec<VerifyTier>) -> Self {
        tiers.sort();
        tiers.dedup();
        Self { tiers, skip }
    }

    pub fn run<R: TierRunner + ?Sized>(&self, runner: &mut R) -> VerificationReport {
        let mut report = VerificationReport::default();
        for &tier in &self.tiers {
            if report.stopped_at.is_some() {
                report.not_reached.push(tier);
                continue;
            }
            if self.skip.contains(&tier) {
                report.skipped.push(tier);
                continue;
            }
            match runner.run_tier(tier) {
                None => report.skipped.push(tier),
                Some(result) => {
                    let passed = result.passed;
                    report.executed.push(result);
                    if !passed {
                        report.stopped_at = Some(tier);
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        failing: Vec<VerifyTier>,
        unconfigured: Vec<VerifyTier>,
        calls: Vec<VerifyTier>,
    }

    impl Scripted {
        fn new(failing: Vec<VerifyTier>) -> Self {
            Self {
                failing,
                unconfigured: Vec::new(),
                calls: Vec::new(),
            }
        }
    }

    impl TierRunner for Scripted {
        fn run_tier(&mut self, tier: VerifyTier) -> Option<TierResult> {
            self.calls.push(tier);
            if self.unconfigured.contains(&tier) {
                return None;
            }
            if self.failing.contains(&tier) {
                Some(TierResult::fail(tier, 1, vec![format!("{tier} failed")]))
            } else {
                Some(TierResult::pass(tier, 1))
            }
        }
    }

    #[test]
    fn lint_failure_stops_before_unit_tests() {
        let mut runner = Scripted::new(vec![VerifyTier::Lint]);
        let report = VerificationPipeline::default().run(&mut runner);
        assert_eq!(report.stopped_at, Some(VerifyTier::Lint));
        assert!(!report.was_executed(VerifyTier::UnitTest));
        assert_eq!(runner.calls, vec![VerifyTier::Syntax, VerifyTier::Lint]);
        assert_eq!(
            report.not_reached,
            vec![
                VerifyTier::UnitTest,
                VerifyTier::IntegrationTest,
                VerifyTier::CiGate
            ]
        );
        assert_eq!(report.highest_passed(), Some(VerifyTier::Syntax));
        assert!(!report.all_passed());
    }

    #[test]
    fn skipped_tiers_are_recorded_not_passed() {
        let mut runner = Scripted::new(Vec::new());
        runner.unconfigured = vec![VerifyTier::CiGate];
        let pipeline = VerificationPipeline::new(
            VerifyTier::ALL.to_vec(),
            vec![VerifyTier::IntegrationTest],
        );
        let report = pipeline.run(&mut runner);
        assert!(report.all_passed());
        assert_eq!(
            report.skipped,
            vec![VerifyTier::IntegrationTest, VerifyTier::CiGate]
        );
        assert!(!report.was_executed(VerifyTier::IntegrationTest));
        assert_eq!(report.highest_passed(), Some(VerifyTier::UnitTest));
        assert!(report.summary().contains("INTEGRATION_TEST=skipped"));
    }

    #[test]
    fn tiers_run_in_natural_order() {
        let mut runner = Scripted::new(Vec::new());
        let pipeline =
            VerificationPipeline::new(vec![VerifyTier::UnitTest, VerifyTier::Syntax], Vec::new());
        pipeline.run(&mut runner);
        assert_eq!(runner.calls, vec![VerifyTier::Syntax, VerifyTier::UnitTest]);
    }
}
