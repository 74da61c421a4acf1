//! Human-facing approval requests, rendered to markdown.

use std::fmt;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::approvals::{ApproverRole, command_hash};
use crate::core::budget::BudgetViolation;
use crate::core::classifier::CommandClassification;
use crate::core::redact::{REDACTED, redact_secrets};

const APPROVAL_TEMPLATE: &str = include_str!("templates/approval.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Command,
    Budget,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalKind::Command => "command",
            ApprovalKind::Budget => "budget",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub kind: ApprovalKind,
    pub summary: String,
    pub detail: String,
    pub required_role: ApproverRole,
    pub blast_radius: Vec<String>,
    /// Set for command approvals; the cache key the approval will be stored
    /// under. Hashes the raw command, while `detail` shows it redacted.
    pub command_hash: Option<String>,
}

impl ApprovalRequest {
    pub fn for_command(classification: &CommandClassification, required_role: ApproverRole) -> Self {
        let mut blast_radius = vec![format!("tier: {:?}", classification.tier)];
        if let Some(pattern) = &classification.matched_pattern {
            blast_radius.push(format!("matched rule: {pattern}"));
        }
        Self {
            kind: ApprovalKind::Command,
            summary: redact_secrets(&classification.reasoning),
            detail: redact_secrets(&classification.command),
            required_role,
            blast_radius,
            command_hash: Some(command_hash(&classification.command)),
        }
    }

    pub fn for_budget(violation: &BudgetViolation, files: &[String]) -> Self {
        Self {
            kind: ApprovalKind::Budget,
            summary: violation.message.clone(),
            detail: format!(
                "{:?}: {} of {}",
                violation.dimension, violation.current, violation.limit
            ),
            required_role: ApproverRole::Developer,
            blast_radius: files.to_vec(),
            command_hash: None,
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("approval", APPROVAL_TEMPLATE)?;
        let template = env.get_template("approval")?;
        let rendered = template.render(context! {
            kind => self.kind.to_string(),
            summary => self.summary.trim(),
            detail => (!self.detail.trim().is_empty()).then(|| self.detail.trim()),
            required_role => self.required_role.to_string(),
            blast_radius => &self.blast_radius,
            command_hash => self.command_hash.as_deref(),
        })?;
        Ok(rendered)
    }
}
