//! Session-scoped memo of human command approvals.
//!
//! A cache belongs to exactly one session (it is owned by a
//! [`crate::core::gate::CommandGate`]); there is no process-wide instance.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::hashing::sha256_hex;

/// Authority of the human who granted an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverRole {
    Viewer,
    Developer,
    Admin,
}

impl ApproverRole {
    pub fn parse(raw: &str) -> Option<ApproverRole> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "viewer" => Some(ApproverRole::Viewer),
            "developer" | "dev" => Some(ApproverRole::Developer),
            "admin" => Some(ApproverRole::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for ApproverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApproverRole::Viewer => "viewer",
            ApproverRole::Developer => "developer",
            ApproverRole::Admin => "admin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub command_hash: String,
    pub role: ApproverRole,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ApprovalCache {
    approvals: HashMap<String, Approval>,
}

/// Cache key: sha256 of the trimmed command string.
pub fn command_hash(command: &str) -> String {
    sha256_hex(command.trim())
}

impl ApprovalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an approval. A later approval by a stronger role replaces a
    /// weaker one; a weaker one never downgrades.
    pub fn approve(&mut self, command: &str, role: ApproverRole) -> &Approval {
        let hash = command_hash(command);
        let approval = Approval {
            command_hash: hash.clone(),
            role,
            approved_at: Utc::now(),
        };
        let entry = self.approvals.entry(hash).or_insert(approval.clone());
        if entry.role < role {
            *entry = approval;
        }
        entry
    }

    /// The approval for exactly this command, if its role is at least `required`.
    pub fn lookup(&self, command: &str, required: ApproverRole) -> Option<&Approval> {
        self.approvals
            .get(&command_hash(command))
            .filter(|approval| approval.role >= required)
    }

    pub fn len(&self) -> usize {
        self.approvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty()
    }

    pub fn clear(&mut self) {
        self.approvals.clear();
    }
}
