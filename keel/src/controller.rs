//! Lifecycle controller: the single owner of agent state for one session.
//!
//! Every request from the agent goes through here. Illegal moves, drift,
//! exhausted budgets, and kill switch triggers never surface as `Err`; they
//! land the controller in a terminal failure state and are reported as
//! [`Transition::FailSafe`].

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::approvals::{ApproverRole, command_hash};
use crate::core::budget::{BudgetDimension, BudgetLimits, BudgetViolation, RiskBudget};
use crate::core::classifier::{CommandClassification, CommandPolicy, CommandTier, DecisionSource};
use crate::core::determinism::{
    DeterminismConfig, DeterminismGuard, DeterminismViolation, SamplingPolicy,
};
use crate::core::envelope::{MAX_FILE_CAP, PlanEnvelope, normalize_path};
use crate::core::express_lane::{self, ExpressVerdict};
use crate::core::gate::CommandGate;
use crate::core::replay::{ReplayLog, ToolCall};
use crate::core::transitions::validate_transition;
use crate::core::types::{AgentContext, AgentState, IntentResult, TaskIntent, TransitionRecord};
use crate::io::audit_log::{AuditEvent, AuditLog};
use crate::io::config::{AmbiguityPolicy, IntentConfig, KernelConfig};
use crate::io::kill_switch::{KillSignal, KillSwitch};
use crate::io::probe::RepoProbe;

/// Controller tuning, usually derived from [`KernelConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub budget: BudgetLimits,
    pub max_file_cap: usize,
    pub intent: IntentConfig,
    pub determinism: DeterminismConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            budget: BudgetLimits::default(),
            max_file_cap: MAX_FILE_CAP,
            intent: IntentConfig::default(),
            determinism: DeterminismConfig::default(),
        }
    }
}

impl From<&KernelConfig> for ControllerConfig {
    fn from(cfg: &KernelConfig) -> Self {
        Self {
            budget: cfg.budget.clone(),
            max_file_cap: cfg.envelope.max_file_cap,
            intent: cfg.intent.clone(),
            determinism: cfg.determinism.clone(),
        }
    }
}

/// Result of a state change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The request was refused or interrupted; the controller is now (or
    /// already was) in `terminal`.
    FailSafe { terminal: AgentState, reason: String },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentDecision {
    Proceed,
    /// Confidence is below threshold and the policy says to ask.
    NeedsClarification,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    Run(CommandClassification),
    NeedsApproval(CommandClassification),
    Blocked(CommandClassification),
    /// Kill switch or budget stopped the task before classification mattered.
    Halted(Transition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffDecision {
    Accepted,
    /// Soft limit crossed; continue only after a human confirms.
    NeedsConfirmation(BudgetViolation),
    /// The path is not in the planned set. Nothing was counted.
    ScopeViolation { path: String },
    Halted(Transition),
}

fn terminal_for(dimension: BudgetDimension) -> AgentState {
    match dimension {
        BudgetDimension::ExecutionTime => AgentState::FailedByTimeout,
        _ => AgentState::Failed,
    }
}

pub struct Controller {
    config: ControllerConfig,
    state: AgentState,
    intent: Option<TaskIntent>,
    context: AgentContext,
    budget: RiskBudget,
    history: Vec<TransitionRecord>,
    probe: Box<dyn RepoProbe>,
    audit: AuditLog,
    replay: ReplayLog,
    determinism: DeterminismGuard,
    kill_switch: Option<KillSwitch>,
    express_granted: bool,
    resolving_fail_safe: bool,
}

impl Controller {
    pub fn new(config: ControllerConfig, probe: Box<dyn RepoProbe>, audit: AuditLog) -> Self {
        let mut budget = RiskBudget::new(config.budget.clone());
        budget.start();
        let replay = ReplayLog::new(audit.session_id());
        let determinism = DeterminismGuard::new(config.determinism.clone());
        Self {
            config,
            state: AgentState::Idle,
            intent: None,
            context: AgentContext::default(),
            budget,
            history: Vec::new(),
            probe,
            audit,
            replay,
            determinism,
            kill_switch: None,
            express_granted: false,
            resolving_fail_safe: false,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn intent(&self) -> Option<TaskIntent> {
        self.intent
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn budget(&self) -> &RiskBudget {
        &self.budget
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    pub fn replay(&self) -> &ReplayLog {
        &self.replay
    }

    pub fn set_toolchain(&mut self, toolchain: BTreeMap<String, String>) {
        self.replay.toolchain = toolchain;
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Put the controller in an arbitrary state without any checks.
    #[cfg(any(test, feature = "test-support"))]
    pub fn force_state(&mut self, state: AgentState, intent: Option<TaskIntent>) {
        self.state = state;
        self.intent = intent;
    }

    pub fn arm_kill_switch(&mut self, mut switch: KillSwitch) {
        if !switch.is_armed() {
            switch.arm();
        }
        self.kill_switch = Some(switch);
    }

    pub fn kill_switch_mut(&mut self) -> Option<&mut KillSwitch> {
        self.kill_switch.as_mut()
    }

    pub fn disarm_kill_switch(&mut self) -> Option<KillSwitch> {
        let mut switch = self.kill_switch.take()?;
        switch.disarm();
        Some(switch)
    }

    /// Observe the kill switch; a trigger moves the controller to its
    /// failure state.
    pub fn poll_kill_switch(&mut self) -> Option<Transition> {
        let signal = self
            .kill_switch
            .as_ref()
            .map_or(KillSignal::NotTriggered, KillSwitch::check);
        let terminal = signal.terminal_state()?;
        Some(self.fail_safe(terminal, &format!("kill switch: {signal:?}")))
    }

    pub fn transition_to(&mut self, target: AgentState, reason: &str) -> Transition {
        self.transition_with(target, reason, BTreeMap::new())
    }

    #[instrument(skip_all, fields(from = %self.state, to = %target))]
    pub fn transition_with(
        &mut self,
        target: AgentState,
        reason: &str,
        metadata: BTreeMap<String, String>,
    ) -> Transition {
        let from = self.state;

        if let Some(halted) = self.poll_kill_switch() {
            return halted;
        }

        if let Err(rejection) = validate_transition(from, target, self.intent) {
            error!(%rejection, "illegal transition");
            return self.fail_safe(AgentState::Failed, &rejection.to_string());
        }

        if from == AgentState::IntentAnalysis
            && target == AgentState::Implementing
            && !self.express_granted
        {
            return self.fail_safe(
                AgentState::Failed,
                "express lane to IMPLEMENTING was not granted",
            );
        }

        if from == AgentState::Idle && target == AgentState::IntentAnalysis {
            self.begin_task();
            match self.probe.head() {
                Ok(head) => self.context.initial_head = head,
                Err(err) => {
                    return self.fail_safe(
                        AgentState::Failed,
                        &format!("cannot read repository head: {err:#}"),
                    );
                }
            }
        }

        if target == AgentState::Implementing
            && let Some((terminal, why)) = self.detect_drift()
        {
            return self.fail_safe(terminal, &why);
        }

        if let Some(violation) = self.budget.check_time() {
            return self.budget_fail_safe(violation);
        }
        if target == AgentState::Retrying
            && let Some(violation) = self.budget.record_retry(from)
        {
            return self.budget_fail_safe(violation);
        }

        self.audit.append(AuditEvent::Transition {
            from,
            to: target,
            reason: reason.to_string(),
            metadata: metadata.clone(),
        });
        self.history.push(TransitionRecord {
            from,
            to: target,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            metadata,
        });
        self.state = target;
        info!(reason, "transition applied");
        Transition::Applied
    }

    fn begin_task(&mut self) {
        self.context.clear();
        self.intent = None;
        self.express_granted = false;
        self.budget = RiskBudget::new(self.config.budget.clone());
        self.budget.start();
        debug!("new task started");
    }

    /// Compare the captured head and checksums against the live repository.
    fn detect_drift(&self) -> Option<(AgentState, String)> {
        if let Some(expected) = &self.context.initial_head {
            match self.probe.head() {
                Ok(Some(actual)) if actual == *expected => {}
                Ok(Some(actual)) => {
                    return Some((
                        AgentState::FailedByStale,
                        format!("head moved from {expected} to {actual}"),
                    ));
                }
                Ok(None) => {
                    return Some((
                        AgentState::FailedByStale,
                        "repository head is gone".to_string(),
                    ));
                }
                Err(err) => {
                    return Some((AgentState::Failed, format!("cannot read head: {err:#}")));
                }
            }
        }
        for (path, expected) in &self.context.file_checksums {
            match self.probe.file_checksum(path) {
                Ok(Some(actual)) if actual == *expected => {}
                Ok(Some(_)) => {
                    return Some((AgentState::Failed, format!("{path} changed outside the task")));
                }
                Ok(None) => {
                    return Some((AgentState::Failed, format!("{path} disappeared")));
                }
                Err(err) => {
                    return Some((AgentState::Failed, format!("cannot checksum {path}: {err:#}")));
                }
            }
        }
        None
    }

    fn budget_fail_safe(&mut self, violation: BudgetViolation) -> Transition {
        let terminal = terminal_for(violation.dimension);
        let reason = violation.to_string();
        self.audit.append(AuditEvent::RiskViolation { violation });
        self.fail_safe(terminal, &reason)
    }

    /// Jump straight to a failure state. Idempotent: once in a failure state
    /// further calls only log. Non-failure targets are coerced to `FAILED`.
    pub fn fail_safe(&mut self, terminal: AgentState, reason: &str) -> Transition {
        let terminal = if terminal.is_failure() {
            terminal
        } else {
            AgentState::Failed
        };
        if self.state.is_failure() {
            warn!(state = %self.state, reason, "fail-safe requested while already failed");
            return Transition::FailSafe {
                terminal: self.state,
                reason: reason.to_string(),
            };
        }
        if self.resolving_fail_safe {
            warn!(reason, "nested fail-safe ignored");
            return Transition::FailSafe {
                terminal,
                reason: reason.to_string(),
            };
        }
        self.resolving_fail_safe = true;
        error!(from = %self.state, to = %terminal, reason, "fail-safe");
        self.audit.append(AuditEvent::FailSafe {
            from: self.state,
            to: terminal,
            reason: reason.to_string(),
        });
        self.state = terminal;
        self.resolving_fail_safe = false;
        Transition::FailSafe {
            terminal,
            reason: reason.to_string(),
        }
    }

    /// Accept the intent classifier's verdict. Only valid in INTENT_ANALYSIS.
    pub fn set_intent(&mut self, result: &IntentResult) -> IntentDecision {
        if self.state != AgentState::IntentAnalysis {
            return IntentDecision::Rejected {
                reason: format!("intent can only be set in INTENT_ANALYSIS, not {}", self.state),
            };
        }
        if !(0.0..=1.0).contains(&result.confidence) {
            return IntentDecision::Rejected {
                reason: format!("intent confidence {} is outside 0..=1", result.confidence),
            };
        }
        let decision = if result.is_confident(self.config.intent.confidence_threshold) {
            IntentDecision::Proceed
        } else {
            match self.config.intent.ambiguity_policy {
                AmbiguityPolicy::Proceed => IntentDecision::Proceed,
                AmbiguityPolicy::Pause => IntentDecision::NeedsClarification,
            }
        };
        self.intent = Some(result.intent);
        let label = match decision {
            IntentDecision::Proceed => "proceed",
            IntentDecision::NeedsClarification => "needs_clarification",
            IntentDecision::Rejected { .. } => "rejected",
        };
        self.audit.append(AuditEvent::IntentClassified {
            intent: result.intent,
            confidence: result.confidence,
            decision: label.to_string(),
        });
        info!(intent = %result.intent, confidence = result.confidence, decision = label, "intent set");
        decision
    }

    /// Ask for the documentation-only fast path out of INTENT_ANALYSIS. A
    /// granted lane also fixes the planned file set.
    pub fn request_express_lane<S: AsRef<str>>(&mut self, files: &[S]) -> ExpressVerdict {
        let mut verdict = express_lane::analyze_files(files);
        if self.state != AgentState::IntentAnalysis {
            verdict
                .violations
                .push(format!("express lane starts from INTENT_ANALYSIS, not {}", self.state));
        }
        self.express_granted = verdict.qualifies();
        if self.express_granted {
            self.set_planned_files(files);
        }
        self.audit.append(AuditEvent::ExpressLane {
            granted: self.express_granted,
            violations: verdict.violations.clone(),
        });
        info!(granted = self.express_granted, "express lane requested");
        verdict
    }

    pub fn express_granted(&self) -> bool {
        self.express_granted
    }

    /// Record checksums for drift detection. Files that do not exist yet are
    /// skipped.
    pub fn capture_file_checksums<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<usize> {
        let mut captured = 0;
        for path in paths {
            let path = normalize_path(path.as_ref());
            if let Some(sum) = self.probe.file_checksum(&path)? {
                self.context.file_checksums.insert(path, sum);
                captured += 1;
            }
        }
        debug!(captured, "file checksums captured");
        Ok(captured)
    }

    pub fn set_planned_files<S: AsRef<str>>(&mut self, paths: &[S]) {
        let mut planned: Vec<String> = paths.iter().map(|p| normalize_path(p.as_ref())).collect();
        planned.sort();
        planned.dedup();
        self.context.planned_files = planned;
    }

    pub fn set_task_branch(&mut self, branch: &str) {
        self.context.task_branch = Some(branch.to_string());
    }

    /// Adopt a plan envelope. A plan over the scope cap ends the task.
    pub fn commit_envelope(&mut self, envelope: &PlanEnvelope) -> Transition {
        if self.state.is_terminal() {
            return Transition::FailSafe {
                terminal: self.state,
                reason: "controller is terminal".to_string(),
            };
        }
        if let Err(violation) = envelope.check_scope_cap(self.config.max_file_cap) {
            return self.fail_safe(AgentState::FailedByScope, &violation.to_string());
        }
        self.set_planned_files(envelope.planned_files());
        self.context.envelope_hash = Some(envelope.envelope_hash().to_string());
        self.context.input_snapshot_hash = Some(envelope.input_snapshot_hash().to_string());
        self.context.lockfile_hash = Some(envelope.lockfile_hash().to_string());
        self.audit.append(AuditEvent::EnvelopeCommitted {
            envelope_hash: envelope.envelope_hash().to_string(),
            plan_hash: envelope.plan_hash().to_string(),
            files: envelope.planned_files().len(),
        });
        info!(files = envelope.planned_files().len(), "envelope committed");
        Transition::Applied
    }

    /// Gate a shell command before it runs.
    pub fn check_command(&mut self, gate: &mut CommandGate, command: &str) -> CommandDecision {
        if let Some(halted) = self.poll_kill_switch() {
            return CommandDecision::Halted(halted);
        }
        if self.state.is_terminal() {
            return CommandDecision::Halted(Transition::FailSafe {
                terminal: self.state,
                reason: "controller is terminal".to_string(),
            });
        }
        let mut classification = gate.classify(command);
        if self.state == AgentState::Implementing
            && classification.tier == CommandTier::Network
            && classification.policy.permits_execution()
        {
            classification.policy = CommandPolicy::Block;
            classification.source = DecisionSource::NetworkIsolation;
            classification.reasoning = "network is isolated while IMPLEMENTING".to_string();
        }
        self.audit.append(AuditEvent::CommandCheck {
            command_hash: command_hash(command),
            classification: classification.redacted(),
        });
        match classification.policy {
            CommandPolicy::Allow | CommandPolicy::RateLimit => {
                if let Some(violation) = self.budget.record_shell_command() {
                    return CommandDecision::Halted(self.budget_fail_safe(violation));
                }
                if let Some(switch) = self.kill_switch.as_mut()
                    && let Some(extra) = switch.extension_for(command)
                {
                    switch.extend(command, extra);
                }
                CommandDecision::Run(classification)
            }
            CommandPolicy::RequireApproval => CommandDecision::NeedsApproval(classification),
            CommandPolicy::Block => CommandDecision::Blocked(classification),
        }
    }

    /// Store a human approval for `command` in the gate's session cache and
    /// audit it.
    pub fn approve_command(&mut self, gate: &mut CommandGate, command: &str, role: ApproverRole) {
        gate.approve(command, role);
        self.audit.append(AuditEvent::ApprovalGranted {
            command_hash: command_hash(command),
            role,
        });
        info!(%role, "command approved");
    }

    /// Audit a human's answer to a soft budget violation.
    pub fn record_confirmation(&mut self, violation: &BudgetViolation, confirmed: bool) {
        self.audit.append(AuditEvent::BudgetConfirmation {
            violation: violation.clone(),
            confirmed,
        });
        info!(%violation, confirmed, "soft budget confirmation");
    }

    /// Count a file change the kernel is about to (or just did) apply.
    pub fn record_diff(&mut self, path: &str, lines: u32) -> DiffDecision {
        let path = normalize_path(path);
        if self.state.is_terminal() {
            return DiffDecision::Halted(Transition::FailSafe {
                terminal: self.state,
                reason: "controller is terminal".to_string(),
            });
        }
        if !self.context.planned_files.is_empty() && !self.context.is_planned(&path) {
            warn!(path = %path, "change outside planned scope");
            return DiffDecision::ScopeViolation { path };
        }
        let decision = match self.budget.record_diff(lines, &path) {
            None => DiffDecision::Accepted,
            Some(violation) if violation.is_hard_stop() => {
                return DiffDecision::Halted(self.budget_fail_safe(violation));
            }
            Some(violation) => {
                self.audit.append(AuditEvent::RiskViolation {
                    violation: violation.clone(),
                });
                DiffDecision::NeedsConfirmation(violation)
            }
        };
        // The kernel's own writes are not drift.
        match self.probe.file_checksum(&path) {
            Ok(Some(sum)) => {
                self.context.file_checksums.insert(path, sum);
            }
            Ok(None) => {
                self.context.file_checksums.remove(&path);
            }
            Err(err) => warn!(path = %path, err = %format!("{err:#}"), "checksum refresh failed"),
        }
        decision
    }

    /// Append a tool invocation to the replay and audit logs.
    pub fn record_tool(
        &mut self,
        tool_name: &str,
        input: Option<&Value>,
        output: Option<&Value>,
        success: bool,
        error: Option<&str>,
    ) -> u64 {
        let sequence_id = self
            .replay
            .record(ToolCall {
                tool_name,
                input,
                output,
                success,
                error: error.map(str::to_string),
                ..ToolCall::default()
            })
            .sequence_id;
        self.audit.append(AuditEvent::ToolCall {
            sequence_id,
            tool_name: tool_name.to_string(),
            success,
        });
        sequence_id
    }

    /// Append a model call after checking the sampling policy and system
    /// prompt are unchanged for the session.
    pub fn record_model_call(
        &mut self,
        policy: &SamplingPolicy,
        system_prompt: &str,
        input: &Value,
        output: &Value,
    ) -> Result<u64, DeterminismViolation> {
        self.determinism.validate(policy)?;
        self.determinism.check_system_prompt(system_prompt)?;
        let policy_hash = policy.policy_hash();
        let sequence_id = self
            .replay
            .record(ToolCall {
                tool_name: "model",
                input: Some(input),
                output: Some(output),
                sampling_policy_hash: Some(policy_hash.clone()),
                success: true,
                ..ToolCall::default()
            })
            .sequence_id;
        self.audit.append(AuditEvent::ModelCall {
            sequence_id,
            policy_hash,
        });
        Ok(sequence_id)
    }
}
