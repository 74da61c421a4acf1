//! Per-project command prefix lists, evaluated ahead of the regex engine.

use serde::{Deserialize, Serialize};

/// `command_policy` section of `.keel/policy.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectPolicy {
    pub allow_prefixes: Vec<String>,
    pub block_prefixes: Vec<String>,
    pub require_approval_prefixes: Vec<String>,
}

/// Outcome of matching a command against the project lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectVerdict {
    Block { prefix: String },
    RequireApproval { prefix: String },
    Allow { prefix: String },
    /// An allow-list exists and the command is not on it.
    NotAllowListed,
    /// No project rule applies; fall through to the regex engine.
    NoOpinion,
}

impl ProjectPolicy {
    pub fn is_empty(&self) -> bool {
        self.allow_prefixes.is_empty()
            && self.block_prefixes.is_empty()
            && self.require_approval_prefixes.is_empty()
    }

    /// Block prefixes win, then approval prefixes, then the allow-list.
    /// Matching is a case-insensitive prefix test on the trimmed command.
    pub fn evaluate(&self, command: &str) -> ProjectVerdict {
        let normalized = command.trim().to_lowercase();
        if let Some(prefix) = matching_prefix(&self.block_prefixes, &normalized) {
            return ProjectVerdict::Block { prefix };
        }
        if let Some(prefix) = matching_prefix(&self.require_approval_prefixes, &normalized) {
            return ProjectVerdict::RequireApproval { prefix };
        }
        if self.allow_prefixes.iter().all(|p| p.trim().is_empty()) {
            return ProjectVerdict::NoOpinion;
        }
        match matching_prefix(&self.allow_prefixes, &normalized) {
            Some(prefix) => ProjectVerdict::Allow { prefix },
            None => ProjectVerdict::NotAllowListed,
        }
    }
}

fn matching_prefix(prefixes: &[String], normalized: &str) -> Option<String> {
    prefixes
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .find(|p| normalized.starts_with(&p.to_lowercase()))
        .map(str::to_string)
}
