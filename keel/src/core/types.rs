//! Shared deterministic types for the governance kernel.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O and serialize identically across runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    IntentAnalysis,
    RepoDiscovery,
    Planning,
    TaskIsolation,
    ProvingGround,
    Researching,
    ImpactAnalysis,
    Implementing,
    Verifying,
    FeedbackWait,
    Retrying,
    Complete,
    Failed,
    FailedByStale,
    FailedByInterrupt,
    FailedByTimeout,
    FailedByScope,
}

impl AgentState {
    pub const ALL: [AgentState; 18] = [
        AgentState::Idle,
        AgentState::IntentAnalysis,
        AgentState::RepoDiscovery,
        AgentState::Planning,
        AgentState::TaskIsolation,
        AgentState::ProvingGround,
        AgentState::Researching,
        AgentState::ImpactAnalysis,
        AgentState::Implementing,
        AgentState::Verifying,
        AgentState::FeedbackWait,
        AgentState::Retrying,
        AgentState::Complete,
        AgentState::Failed,
        AgentState::FailedByStale,
        AgentState::FailedByInterrupt,
        AgentState::FailedByTimeout,
        AgentState::FailedByScope,
    ];

    pub const FAILURES: [AgentState; 5] = [
        AgentState::Failed,
        AgentState::FailedByStale,
        AgentState::FailedByInterrupt,
        AgentState::FailedByTimeout,
        AgentState::FailedByScope,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        self == AgentState::Complete || self.is_failure()
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            AgentState::Failed
                | AgentState::FailedByStale
                | AgentState::FailedByInterrupt
                | AgentState::FailedByTimeout
                | AgentState::FailedByScope
        )
    }

    /// Stable upper-case name, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "IDLE",
            AgentState::IntentAnalysis => "INTENT_ANALYSIS",
            AgentState::RepoDiscovery => "REPO_DISCOVERY",
            AgentState::Planning => "PLANNING",
            AgentState::TaskIsolation => "TASK_ISOLATION",
            AgentState::ProvingGround => "PROVING_GROUND",
            AgentState::Researching => "RESEARCHING",
            AgentState::ImpactAnalysis => "IMPACT_ANALYSIS",
            AgentState::Implementing => "IMPLEMENTING",
            AgentState::Verifying => "VERIFYING",
            AgentState::FeedbackWait => "FEEDBACK_WAIT",
            AgentState::Retrying => "RETRYING",
            AgentState::Complete => "COMPLETE",
            AgentState::Failed => "FAILED",
            AgentState::FailedByStale => "FAILED_BY_STALE",
            AgentState::FailedByInterrupt => "FAILED_BY_INTERRUPT",
            AgentState::FailedByTimeout => "FAILED_BY_TIMEOUT",
            AgentState::FailedByScope => "FAILED_BY_SCOPE",
        }
    }

    /// Parse the upper-case name (case-insensitive, `-` accepted for `_`).
    pub fn parse(raw: &str) -> Option<AgentState> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        AgentState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified purpose of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskIntent {
    Fix,
    Develop,
    Explain,
    Generate,
    Meta,
}

impl TaskIntent {
    /// Intents that change behavior must prove a failing test first.
    pub fn requires_tdd(self) -> bool {
        matches!(self, TaskIntent::Fix | TaskIntent::Develop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskIntent::Fix => "FIX",
            TaskIntent::Develop => "DEVELOP",
            TaskIntent::Explain => "EXPLAIN",
            TaskIntent::Generate => "GENERATE",
            TaskIntent::Meta => "META",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskIntent> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FIX" => Some(TaskIntent::Fix),
            "DEVELOP" => Some(TaskIntent::Develop),
            "EXPLAIN" => Some(TaskIntent::Explain),
            "GENERATE" => Some(TaskIntent::Generate),
            "META" => Some(TaskIntent::Meta),
            _ => None,
        }
    }
}

impl fmt::Display for TaskIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the (external) intent classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: TaskIntent,
    /// Classifier confidence in `0.0..=1.0`.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub clarification_needed: bool,
}

impl IntentResult {
    pub fn new(intent: TaskIntent, confidence: f64) -> Self {
        Self {
            intent,
            confidence,
            reasoning: String::new(),
            clarification_needed: false,
        }
    }

    pub fn is_confident(&self, threshold: f64) -> bool {
        !self.clarification_needed && self.confidence >= threshold
    }
}

/// How far a task has progressed relative to version control.
///
/// The ordering is meaningful: a domain only ever moves forward within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackDomain {
    PreBranch,
    InBranch,
    PostMerge,
}

impl RollbackDomain {
    /// Advance to `next` if it is further along; backwards moves are ignored.
    pub fn advance_to(&mut self, next: RollbackDomain) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Per-task facts captured by the controller for drift and scope checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    pub initial_head: Option<String>,
    /// Relative path -> sha256 hex of file content at capture time.
    pub file_checksums: BTreeMap<String, String>,
    pub planned_files: Vec<String>,
    pub envelope_hash: Option<String>,
    pub input_snapshot_hash: Option<String>,
    pub lockfile_hash: Option<String>,
    pub task_branch: Option<String>,
}

impl AgentContext {
    pub fn clear(&mut self) {
        *self = AgentContext::default();
    }

    pub fn is_planned(&self, path: &str) -> bool {
        self.planned_files.iter().any(|planned| planned == path)
    }
}

/// One applied transition, kept in the controller's in-memory history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: AgentState,
    pub to: AgentState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}
