//! Risk budget: counters and limits that bound the blast radius of one task.
//!
//! Every check returns at most one [`BudgetViolation`]; violations are also
//! remembered so `is_exhausted` and `needs_confirmation` can be asked later.
//! Hard-stop dimensions end the task; soft dimensions are surfaced for human
//! confirmation and the task may continue once approved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::types::AgentState;

/// Configured limits. Deserializes from the `[budget]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_retries_per_state: u32,
    pub max_total_retries: u32,
    /// Soft limit on a single diff.
    pub max_diff_lines: u32,
    /// Hard limit on the sum of all diffs in the task.
    pub max_cumulative_diff_lines: u32,
    pub max_shell_commands: u32,
    pub max_execution_time_secs: u64,
    /// Soft limit on distinct files touched.
    pub max_files_modified: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_retries_per_state: 3,
            max_total_retries: 10,
            max_diff_lines: 200,
            max_cumulative_diff_lines: 500,
            max_shell_commands: 20,
            max_execution_time_secs: 20 * 60,
            max_files_modified: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetDimension {
    RetriesPerState,
    TotalRetries,
    DiffLines,
    CumulativeDiff,
    ShellCommands,
    ExecutionTime,
    FilesModified,
}

impl BudgetDimension {
    /// Hard-stop dimensions force an immediate fail-safe.
    pub fn is_hard_stop(self) -> bool {
        match self {
            BudgetDimension::TotalRetries
            | BudgetDimension::CumulativeDiff
            | BudgetDimension::ShellCommands
            | BudgetDimension::ExecutionTime => true,
            BudgetDimension::RetriesPerState
            | BudgetDimension::DiffLines
            | BudgetDimension::FilesModified => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub dimension: BudgetDimension,
    pub current: u64,
    pub limit: u64,
    pub message: String,
}

impl BudgetViolation {
    fn new(dimension: BudgetDimension, current: u64, limit: u64, message: String) -> Self {
        Self {
            dimension,
            current,
            limit,
            message,
        }
    }

    pub fn is_hard_stop(&self) -> bool {
        self.dimension.is_hard_stop()
    }
}

impl fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}/{}: {}",
            self.dimension, self.current, self.limit, self.message
        )
    }
}

/// Serializable snapshot of budget consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub retries_by_state: BTreeMap<AgentState, u32>,
    pub total_retries: u32,
    pub cumulative_diff_lines: u64,
    pub files_modified: usize,
    pub shell_commands: u32,
    pub elapsed_secs: u64,
    pub violations: usize,
    pub exhausted: bool,
    pub needs_confirmation: bool,
}

#[derive(Debug, Clone)]
pub struct RiskBudget {
    limits: BudgetLimits,
    retries_by_state: BTreeMap<AgentState, u32>,
    total_retries: u32,
    cumulative_diff_lines: u64,
    files_modified: BTreeSet<String>,
    shell_commands: u32,
    started_at: Option<Instant>,
    violations: Vec<BudgetViolation>,
}

impl RiskBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            retries_by_state: BTreeMap::new(),
            total_retries: 0,
            cumulative_diff_lines: 0,
            files_modified: BTreeSet::new(),
            shell_commands: 0,
            started_at: None,
            violations: Vec::new(),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Start (or restart) the wall clock.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// Count one retry of `state`. The per-state limit is checked first.
    pub fn record_retry(&mut self, state: AgentState) -> Option<BudgetViolation> {
        let count = self.retries_by_state.entry(state).or_insert(0);
        *count += 1;
        let per_state = *count;
        self.total_retries += 1;

        if per_state > self.limits.max_retries_per_state {
            return self.violate(
                BudgetDimension::RetriesPerState,
                u64::from(per_state),
                u64::from(self.limits.max_retries_per_state),
                format!("{state} retried {per_state} times"),
            );
        }
        if self.total_retries > self.limits.max_total_retries {
            return self.violate(
                BudgetDimension::TotalRetries,
                u64::from(self.total_retries),
                u64::from(self.limits.max_total_retries),
                "total retry budget exhausted".to_string(),
            );
        }
        None
    }

    /// Count a diff against `path`. Checks the cumulative hard cap, then the
    /// single-diff size, then distinct files; the first violation wins so a
    /// soft violation never hides a hard one.
    pub fn record_diff(&mut self, lines: u32, path: &str) -> Option<BudgetViolation> {
        self.cumulative_diff_lines += u64::from(lines);
        self.files_modified.insert(path.to_string());

        if self.cumulative_diff_lines > u64::from(self.limits.max_cumulative_diff_lines) {
            return self.violate(
                BudgetDimension::CumulativeDiff,
                self.cumulative_diff_lines,
                u64::from(self.limits.max_cumulative_diff_lines),
                "cumulative diff budget exhausted".to_string(),
            );
        }
        if lines > self.limits.max_diff_lines {
            return self.violate(
                BudgetDimension::DiffLines,
                u64::from(lines),
                u64::from(self.limits.max_diff_lines),
                format!("single diff to {path} is {lines} lines"),
            );
        }
        let files = self.files_modified.len() as u64;
        if files > u64::from(self.limits.max_files_modified) {
            return self.violate(
                BudgetDimension::FilesModified,
                files,
                u64::from(self.limits.max_files_modified),
                format!("{files} distinct files modified"),
            );
        }
        None
    }

    pub fn record_shell_command(&mut self) -> Option<BudgetViolation> {
        self.shell_commands += 1;
        if self.shell_commands > self.limits.max_shell_commands {
            return self.violate(
                BudgetDimension::ShellCommands,
                u64::from(self.shell_commands),
                u64::from(self.limits.max_shell_commands),
                "shell command budget exhausted".to_string(),
            );
        }
        None
    }

    /// Check wall-clock time since [`RiskBudget::start`].
    pub fn check_time(&mut self) -> Option<BudgetViolation> {
        let elapsed = self.elapsed();
        self.check_elapsed(elapsed)
    }

    pub fn check_elapsed(&mut self, elapsed: Duration) -> Option<BudgetViolation> {
        if elapsed.as_secs() > self.limits.max_execution_time_secs {
            return self.violate(
                BudgetDimension::ExecutionTime,
                elapsed.as_secs(),
                self.limits.max_execution_time_secs,
                "execution time budget exhausted".to_string(),
            );
        }
        None
    }

    /// True once any hard-stop dimension has been violated.
    pub fn is_exhausted(&self) -> bool {
        self.violations.iter().any(BudgetViolation::is_hard_stop)
    }

    /// True once any soft dimension has been violated.
    pub fn needs_confirmation(&self) -> bool {
        self.violations.iter().any(|v| !v.is_hard_stop())
    }

    pub fn violations(&self) -> &[BudgetViolation] {
        &self.violations
    }

    pub fn summary(&self) -> BudgetSummary {
        BudgetSummary {
            retries_by_state: self.retries_by_state.clone(),
            total_retries: self.total_retries,
            cumulative_diff_lines: self.cumulative_diff_lines,
            files_modified: self.files_modified.len(),
            shell_commands: self.shell_commands,
            elapsed_secs: self.elapsed().as_secs(),
            violations: self.violations.len(),
            exhausted: self.is_exhausted(),
            needs_confirmation: self.needs_confirmation(),
        }
    }

    fn violate(
        &mut self,
        dimension: BudgetDimension,
        current: u64,
        limit: u64,
        message: String,
    ) -> Option<BudgetViolation> {
        let violation = BudgetViolation::new(dimension, current, limit, message);
        self.violations.push(violation.clone());
        Some(violation)
    }
}

impl Default for RiskBudget {
    fn default() -> Self {
        Self::new(BudgetLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BudgetLimits {
        BudgetLimits {
            max_retries_per_state: 2,
            max_total_retries: 3,
            max_diff_lines: 10,
            max_cumulative_diff_lines: 25,
            max_shell_commands: 2,
            max_execution_time_secs: 60,
            max_files_modified: 2,
        }
    }

    #[test]
    fn per_state_retry_violates_on_limit_plus_one() {
        let mut budget = RiskBudget::new(limits());
        assert!(budget.record_retry(AgentState::Verifying).is_none());
        assert!(budget.record_retry(AgentState::Verifying).is_none());
        let violation = budget
            .record_retry(AgentState::Verifying)
            .expect("third retry violates");
        assert_eq!(violation.dimension, BudgetDimension::RetriesPerState);
        assert!(!violation.is_hard_stop());
        assert!(budget.needs_confirmation());
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn total_retries_is_a_hard_stop() {
        let mut budget = RiskBudget::new(limits());
        assert!(budget.record_retry(AgentState::Verifying).is_none());
        assert!(budget.record_retry(AgentState::Researching).is_none());
        assert!(budget.record_retry(AgentState::Implementing).is_none());
        let violation = budget
            .record_retry(AgentState::Planning)
            .expect("fourth total retry violates");
        assert_eq!(violation.dimension, BudgetDimension::TotalRetries);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn cumulative_overflow_is_reported_before_single_size() {
        let mut budget = RiskBudget::new(limits());
        let violation = budget.record_diff(12, "a.rs").expect("violation");
        assert_eq!(violation.dimension, BudgetDimension::DiffLines);
        assert!(!budget.is_exhausted());

        let mut budget = RiskBudget::new(limits());
        assert!(budget.record_diff(9, "a.rs").is_none());
        assert!(budget.record_diff(9, "a.rs").is_none());
        // 30 cumulative and 12 single: the hard stop wins.
        let violation = budget.record_diff(12, "a.rs").expect("violation");
        assert_eq!(violation.dimension, BudgetDimension::CumulativeDiff);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn distinct_files_counted_once() {
        let mut budget = RiskBudget::new(limits());
        assert!(budget.record_diff(1, "a.rs").is_none());
        assert!(budget.record_diff(1, "a.rs").is_none());
        assert!(budget.record_diff(1, "b.rs").is_none());
        let violation = budget.record_diff(1, "c.rs").expect("violation");
        assert_eq!(violation.dimension, BudgetDimension::FilesModified);
        assert_eq!(violation.current, 3);
    }

    #[test]
    fn shell_commands_and_time_are_hard_stops() {
        let mut budget = RiskBudget::new(limits());
        assert!(budget.record_shell_command().is_none());
        assert!(budget.record_shell_command().is_none());
        let violation = budget.record_shell_command().expect("violation");
        assert!(violation.is_hard_stop());

        let mut budget = RiskBudget::new(limits());
        assert!(budget.check_elapsed(Duration::from_secs(60)).is_none());
        let violation = budget
            .check_elapsed(Duration::from_secs(61))
            .expect("violation");
        assert_eq!(violation.dimension, BudgetDimension::ExecutionTime);
        assert!(budget.is_exhausted());
    }

    #[test]
    fn summary_reflects_counters() {
        let mut budget = RiskBudget::new(limits());
        budget.start();
        budget.record_diff(4, "a.rs");
        budget.record_shell_command();
        budget.record_retry(AgentState::Verifying);
        let summary = budget.summary();
        assert_eq!(summary.cumulative_diff_lines, 4);
        assert_eq!(summary.files_modified, 1);
        assert_eq!(summary.shell_commands, 1);
        assert_eq!(summary.total_retries, 1);
        assert_eq!(summary.retries_by_state.get(&AgentState::Verifying), Some(&1));
        assert!(!summary.exhausted);
    }
}
