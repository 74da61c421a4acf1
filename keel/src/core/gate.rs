//! Command gate: the single entry point consulted before any shell command.
//!
//! Layers, in order: hard block list, project prefix policy, regex tiers,
//! session approvals, and the network rate limit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::approvals::{ApprovalCache, ApproverRole};
use crate::core::classifier::{
    self, CommandClassification, CommandPolicy, CommandTier, DecisionSource,
};
use crate::core::project_policy::{ProjectPolicy, ProjectVerdict};

/// Gate tuning. Deserializes from the `[gate]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum approver role that satisfies a cached approval.
    pub required_role: ApproverRole,
    /// RATE_LIMIT commands allowed per session before they are blocked.
    pub max_network_commands: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_role: ApproverRole::Developer,
            max_network_commands: 10,
        }
    }
}

#[derive(Debug)]
pub struct CommandGate {
    policy: ProjectPolicy,
    config: GateConfig,
    approvals: ApprovalCache,
    network_commands: u32,
}

impl CommandGate {
    pub fn new(policy: ProjectPolicy, config: GateConfig) -> Self {
        Self {
            policy,
            config,
            approvals: ApprovalCache::new(),
            network_commands: 0,
        }
    }

    pub fn approvals(&self) -> &ApprovalCache {
        &self.approvals
    }

    pub fn required_role(&self) -> ApproverRole {
        self.config.required_role
    }

    /// Remember a human approval for this exact command for the session.
    pub fn approve(&mut self, command: &str, role: ApproverRole) {
        self.approvals.approve(command, role);
    }

    /// Classify `command`. RATE_LIMIT decisions consume the network allowance.
    pub fn classify(&mut self, command: &str) -> CommandClassification {
        let base = classifier::classify(command);
        if base.source == DecisionSource::HardBlockList {
            return base;
        }

        let mut decision = match self.policy.evaluate(&base.command) {
            ProjectVerdict::Block { prefix } => {
                return project(base, CommandPolicy::Block, format!("project blocks '{prefix}'"));
            }
            ProjectVerdict::NotAllowListed => {
                return project(
                    base,
                    CommandPolicy::Block,
                    "not on the project allow-list".to_string(),
                );
            }
            ProjectVerdict::RequireApproval { prefix } => project(
                base,
                CommandPolicy::RequireApproval,
                format!("project requires approval for '{prefix}'"),
            ),
            ProjectVerdict::Allow { prefix } => project(
                base,
                CommandPolicy::Allow,
                format!("project allows '{prefix}'"),
            ),
            ProjectVerdict::NoOpinion => base,
        };

        if approvable(&decision)
            && let Some(approval) = self
                .approvals
                .lookup(&decision.command, self.config.required_role)
        {
            debug!(role = %approval.role, "approval cache hit");
            decision.policy = CommandPolicy::Allow;
            decision.source = DecisionSource::ApprovalCache;
            decision.reasoning = format!("approved this session by {}", approval.role);
        }

        if decision.policy == CommandPolicy::RateLimit {
            self.network_commands += 1;
            if self.network_commands > self.config.max_network_commands {
                decision.policy = CommandPolicy::Block;
                decision.source = DecisionSource::RateLimiter;
                decision.reasoning = format!(
                    "rate limit exceeded: {} network commands this session",
                    self.network_commands
                );
            }
        }
        decision
    }
}

/// Approvals may lift REQUIRE_APPROVAL and the default-deny for unknown
/// commands, never an explicit block.
fn approvable(decision: &CommandClassification) -> bool {
    match decision.policy {
        CommandPolicy::RequireApproval => true,
        CommandPolicy::Block => {
            decision.tier == CommandTier::Unknown && decision.source == DecisionSource::RuleEngine
        }
        CommandPolicy::Allow | CommandPolicy::RateLimit => false,
    }
}

fn project(
    mut base: CommandClassification,
    policy: CommandPolicy,
    reasoning: String,
) -> CommandClassification {
    base.policy = policy;
    base.source = DecisionSource::ProjectPolicy;
    base.reasoning = reasoning;
    base
}
