//! End-to-end driver for one task through every governance component.
//!
//! The driver owns no policy of its own: it asks the controller for every
//! state change and reports whatever terminal state the controller lands in.
//! Any fail-safe is followed by a domain-aware rollback and branch cleanup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::controller::{Controller, DiffDecision, IntentDecision, Transition};
use crate::core::diff::changed_line_count;
use crate::core::envelope::{EnvelopeInputs, PlanEnvelope, normalize_path};
use crate::core::express_lane;
use crate::core::fix_loop::{BoundedFixLoop, CheckResult, DEFAULT_MAX_ATTEMPTS, LoopDecision};
use crate::core::merge_guard::{self, CiReport, MergeBlock, MergeEvidence};
use crate::core::tdd::TddGate;
use crate::core::transitions::intent_allows;
use crate::core::types::{AgentState, IntentResult, TaskIntent};
use crate::core::verification::{TierRunner, VerificationPipeline, VerificationReport, VerifyTier};
use crate::io::approval_request::ApprovalRequest;
use crate::io::audit_log::AuditEvent;
use crate::io::config::KernelConfig;
use crate::io::isolation::{RollbackOutcome, TaskIsolation, is_kernel_path, new_task_id};
use crate::io::kill_switch::{KillSwitch, KillSwitchConfig};
use crate::io::probe::{LockfileHasher, ToolchainProbe};
use crate::io::test_runner::TestRunner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

impl FileEdit {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// What the implementer intends to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Production files the task may modify or create.
    pub files: Vec<String>,
    /// Tests written before any implementation (red phase).
    pub tests: Vec<FileEdit>,
}

impl Plan {
    /// Every path the plan may write: production files, then tests.
    pub fn paths(&self) -> Vec<String> {
        self.files
            .iter()
            .cloned()
            .chain(self.tests.iter().map(|t| t.path.clone()))
            .collect()
    }
}

/// The external code generator (the LLM side of the loop).
pub trait Implementer {
    fn plan(&mut self, task: &str) -> Result<Plan>;
    /// Edits for `attempt` (1-based). `feedback` carries the previous
    /// verification failure.
    fn implement(&mut self, attempt: u32, feedback: Option<&str>) -> Result<Vec<FileEdit>>;
}

/// Source of CI verdicts for the merge guard.
pub trait CiProvider {
    fn report(&mut self, sha: &str) -> Result<CiReport>;
}

/// Human confirmation for soft budget violations.
pub trait Confirmer {
    fn confirm(&mut self, request: &ApprovalRequest) -> bool;
}

/// Declines every request; the safe default for unattended runs.
#[derive(Debug, Default)]
pub struct DenyAll;

impl Confirmer for DenyAll {
    fn confirm(&mut self, _request: &ApprovalRequest) -> bool {
        false
    }
}

pub struct Collaborators<'a> {
    pub implementer: &'a mut dyn Implementer,
    pub test_runner: &'a mut dyn TestRunner,
    pub tiers: &'a mut dyn TierRunner,
    pub lockfiles: &'a dyn LockfileHasher,
    pub toolchain: &'a dyn ToolchainProbe,
    pub confirmer: &'a mut dyn Confirmer,
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task: String,
    pub intent: IntentResult,
    pub repo_summary: String,
    /// Detected stack (`python`, `rust`, ...); picks the kill switch timeout.
    pub stack: Option<String>,
    /// Try the documentation-only fast path before discovery and planning.
    pub express_lane: bool,
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub pipeline: VerificationPipeline,
    pub fix_loop_attempts: u32,
    /// Armed for the whole task when set.
    pub kill_switch: Option<KillSwitchConfig>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            pipeline: VerificationPipeline::default(),
            fix_loop_attempts: DEFAULT_MAX_ATTEMPTS,
            kill_switch: None,
        }
    }
}

impl From<&KernelConfig> for TaskSettings {
    fn from(cfg: &KernelConfig) -> Self {
        Self {
            pipeline: VerificationPipeline::new(
                VerifyTier::ALL.to_vec(),
                cfg.verification.skip.clone(),
            ),
            fix_loop_attempts: cfg.fix_loop.max_attempts,
            kill_switch: Some(cfg.kill_switch.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub final_state: AgentState,
    pub failure: Option<String>,
    pub rollback: Option<RollbackOutcome>,
    pub verification: Option<VerificationReport>,
    pub envelope_hash: Option<String>,
    pub attempts: u32,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.final_state == AgentState::Complete
    }
}

/// The controller already moved to a terminal state; carries the reason.
struct Halt(String);

type Step<T> = std::result::Result<T, Halt>;

fn ensure(transition: Transition) -> Step<()> {
    match transition {
        Transition::Applied => Ok(()),
        Transition::FailSafe { reason, .. } => Err(Halt(reason)),
    }
}

struct Driver<'a, 'c> {
    ctl: &'a mut Controller,
    isolation: &'a mut TaskIsolation,
    collab: &'a mut Collaborators<'c>,
    settings: &'a TaskSettings,
    tdd: TddGate,
    envelope: Option<PlanEnvelope>,
    report: Option<VerificationReport>,
    attempts: u32,
    express: bool,
}

/// Drive one task from IDLE to a terminal state (or to FEEDBACK_WAIT when
/// the intent is ambiguous and the policy says to ask).
#[instrument(skip_all, fields(task = %request.task))]
pub fn run_task(
    ctl: &mut Controller,
    isolation: &mut TaskIsolation,
    request: &TaskRequest,
    collab: &mut Collaborators<'_>,
    settings: &TaskSettings,
) -> Result<TaskOutcome> {
    let task_id = new_task_id();
    if let Some(config) = &settings.kill_switch {
        let stack = request.stack.as_deref().unwrap_or("unknown");
        ctl.arm_kill_switch(KillSwitch::for_stack(stack, config.clone()));
    }
    let mut driver = Driver {
        ctl,
        isolation,
        collab,
        settings,
        tdd: TddGate::new(),
        envelope: None,
        report: None,
        attempts: 0,
        express: false,
    };
    let result = driver.drive(&task_id, request);
    driver.ctl.disarm_kill_switch();

    let (failure, rollback) = match result {
        Ok(()) => (None, None),
        Err(Halt(reason)) => {
            let outcome = driver.isolation.rollback();
            warn!(status = ?outcome.status, "task rolled back");
            driver.ctl.audit_mut().append(AuditEvent::Rollback {
                outcome: outcome.clone(),
            });
            driver.isolation.cleanup().context("clean up task branch")?;
            (Some(reason), Some(outcome))
        }
    };

    Ok(TaskOutcome {
        task_id,
        final_state: driver.ctl.state(),
        failure,
        rollback,
        verification: driver.report,
        envelope_hash: driver.envelope.map(|e| e.envelope_hash().to_string()),
        attempts: driver.attempts,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { sha: String },
    Blocked(MergeBlock),
}

/// Commit a COMPLETE task on its branch and fast-forward the original branch
/// to it once every merge guard passes. After a merge the task is in the
/// POST_MERGE rollback domain and can only be reverted by a human.
#[instrument(skip_all)]
pub fn merge_task(
    ctl: &mut Controller,
    isolation: &mut TaskIsolation,
    ci: &mut dyn CiProvider,
    message: &str,
) -> Result<MergeOutcome> {
    if ctl.state() != AgentState::Complete {
        bail!("only a COMPLETE task can be merged, not {}", ctl.state());
    }
    let (Some(base), Some(target)) = (
        isolation.base_sha().map(str::to_string),
        isolation.original_branch().map(str::to_string),
    ) else {
        bail!("task was never isolated");
    };
    let branch_head = isolation.commit_task(message)?;
    let evidence = MergeEvidence {
        branch_base: base,
        target_head: isolation.git().rev_parse(&target)?,
        branch_head: branch_head.clone(),
        ci: ci.report(&branch_head).context("fetch CI report")?,
    };
    let outcome = match merge_guard::check(&evidence) {
        Ok(()) => {
            let released = isolation.merge().context("merge task branch")?;
            info!(sha = %branch_head, into = %target, ?released, "task merged");
            MergeOutcome::Merged {
                sha: branch_head.clone(),
            }
        }
        Err(block) => {
            warn!(%block, "merge blocked");
            MergeOutcome::Blocked(block)
        }
    };
    let blocked_by = match &outcome {
        MergeOutcome::Blocked(block) => Some(block.to_string()),
        MergeOutcome::Merged { .. } => None,
    };
    ctl.audit_mut().append(AuditEvent::MergeDecision {
        branch_head,
        merged: blocked_by.is_none(),
        blocked_by,
    });
    Ok(outcome)
}

impl Driver<'_, '_> {
    fn halt(&mut self, terminal: AgentState, reason: String) -> Halt {
        self.ctl.fail_safe(terminal, &reason);
        Halt(reason)
    }

    fn root(&self) -> &Path {
        self.isolation.git().workdir()
    }

    fn drive(&mut self, task_id: &str, request: &TaskRequest) -> Step<()> {
        ensure(self.ctl.transition_to(AgentState::IntentAnalysis, &request.task))?;
        match self.ctl.set_intent(&request.intent) {
            IntentDecision::Proceed => {}
            IntentDecision::NeedsClarification => {
                return ensure(
                    self.ctl
                        .transition_to(AgentState::FeedbackWait, "intent is ambiguous"),
                );
            }
            IntentDecision::Rejected { reason } => {
                return Err(self.halt(AgentState::Failed, reason));
            }
        }

        let mut early_plan = None;
        if request.express_lane && intent_allows(request.intent.intent, AgentState::Implementing) {
            let plan = self.plan(request)?;
            if self.ctl.request_express_lane(&plan.paths()).qualifies() {
                self.commit_envelope(request, &plan, BTreeMap::new())?;
                self.isolate(task_id)?;
                self.express = true;
                return self.implement_and_verify();
            }
            early_plan = Some(plan);
        }

        ensure(self.ctl.transition_to(AgentState::RepoDiscovery, "discover repository"))?;
        let toolchain = self
            .collab
            .toolchain
            .toolchain()
            .map_err(|err| self.halt(AgentState::Failed, format!("toolchain probe: {err:#}")))?;
        self.ctl.set_toolchain(toolchain.clone());
        if request.intent.intent == TaskIntent::Explain {
            info!("explain task ends after discovery");
            return Ok(());
        }

        ensure(self.ctl.transition_to(AgentState::Planning, "plan changes"))?;
        let plan = match early_plan {
            Some(plan) => plan,
            None => self.plan(request)?,
        };
        self.commit_envelope(request, &plan, toolchain)?;

        ensure(self.ctl.transition_to(AgentState::TaskIsolation, "isolate task"))?;
        self.isolate(task_id)?;

        if request.intent.intent.requires_tdd() && !plan.tests.is_empty() {
            ensure(self.ctl.transition_to(AgentState::ProvingGround, "write failing tests"))?;
            self.prove_red(&plan.tests)?;
        }

        self.implement_and_verify()
    }

    fn plan(&mut self, request: &TaskRequest) -> Step<Plan> {
        self.collab
            .implementer
            .plan(&request.task)
            .map_err(|err| self.halt(AgentState::Failed, format!("planning: {err:#}")))
    }

    /// Create the task branch and hold it for the task's lifetime.
    fn isolate(&mut self, task_id: &str) -> Step<()> {
        let branch = self
            .isolation
            .isolate(task_id)
            .map_err(|err| self.halt(AgentState::Failed, err.to_string()))?;
        self.isolation.hold_lock(&branch);
        self.ctl.set_task_branch(&branch);
        Ok(())
    }

    fn implement_and_verify(&mut self) -> Step<()> {
        let mut fix_loop = BoundedFixLoop::new(self.settings.fix_loop_attempts);
        let mut feedback: Option<String> = None;
        loop {
            self.attempts += 1;
            if let Some(switch) = self.ctl.kill_switch_mut() {
                switch.heartbeat();
            }
            ensure(self.ctl.transition_to(
                AgentState::Implementing,
                &format!("attempt {}", self.attempts),
            ))?;
            let edits = self
                .collab
                .implementer
                .implement(self.attempts, feedback.as_deref())
                .map_err(|err| self.halt(AgentState::Failed, format!("implementer: {err:#}")))?;
            for edit in &edits {
                self.apply_edit(edit)?;
            }

            ensure(self.ctl.transition_to(AgentState::Verifying, "verify attempt"))?;
            self.check_envelope()?;
            self.check_green()?;
            let report = self.settings.pipeline.run(&mut *self.collab.tiers);
            self.ctl.audit_mut().append(AuditEvent::Verification {
                report: report.clone(),
            });
            info!(summary = %report.summary(), "verification finished");
            let failed = report.failed().map(|r| (r.tier, r.errors.join("\n")));
            self.report = Some(report);

            let Some((tier, errors)) = failed else {
                return ensure(self.ctl.transition_to(AgentState::Complete, "verified"));
            };
            match fix_loop.record(&CheckResult::failed_at(tier, errors.clone())) {
                LoopDecision::Retry { remaining, .. } => {
                    ensure(self.ctl.transition_to(
                        AgentState::Retrying,
                        &format!("{tier} failed; {remaining} attempt(s) left"),
                    ))?;
                    feedback = Some(errors);
                }
                LoopDecision::Stop(reason) => {
                    return Err(self.halt(
                        AgentState::Failed,
                        format!("verification stopped at {tier}: {reason:?}"),
                    ));
                }
                LoopDecision::Passed => {
                    return ensure(self.ctl.transition_to(AgentState::Complete, "verified"));
                }
            }
        }
    }

    fn commit_envelope(
        &mut self,
        request: &TaskRequest,
        plan: &Plan,
        toolchain: BTreeMap<String, String>,
    ) -> Step<()> {
        let base_tree = self
            .isolation
            .git()
            .head_tree()
            .map_err(|err| self.halt(AgentState::Failed, format!("base tree: {err:#}")))?;
        let lockfile_hash = self
            .collab
            .lockfiles
            .lockfile_hash()
            .map_err(|err| self.halt(AgentState::Failed, format!("lockfiles: {err:#}")))?;
        let envelope = PlanEnvelope::create(EnvelopeInputs {
            task: request.task.clone(),
            repo_summary: request.repo_summary.clone(),
            base_tree,
            toolchain,
            planned_files: plan.paths(),
            lockfile_hash,
        })
        .map_err(|err| self.halt(AgentState::Failed, format!("envelope: {err}")))?;
        ensure(self.ctl.commit_envelope(&envelope))?;
        self.ctl
            .capture_file_checksums(envelope.planned_files())
            .map_err(|err| self.halt(AgentState::Failed, format!("checksums: {err:#}")))?;
        self.envelope = Some(envelope);
        Ok(())
    }

    fn prove_red(&mut self, tests: &[FileEdit]) -> Step<()> {
        for test in tests {
            self.apply_edit(test)?;
            let path = normalize_path(&test.path);
            self.tdd.register(&path, test.content.as_bytes());
            let run = self
                .collab
                .test_runner
                .run_test(&path)
                .map_err(|err| self.halt(AgentState::Failed, format!("test runner: {err:#}")))?;
            let verdict = self.tdd.assert_red(&path, run.passed);
            if let Some(checkpoint) = self.tdd.checkpoint(&path).cloned() {
                self.ctl.audit_mut().append(AuditEvent::TddCheckpoint {
                    checkpoint,
                    outcome: match &verdict {
                        Ok(()) => "red".to_string(),
                        Err(violation) => violation.to_string(),
                    },
                });
            }
            if let Err(violation) = verdict {
                return Err(self.halt(AgentState::Failed, violation.to_string()));
            }
        }
        Ok(())
    }

    fn apply_edit(&mut self, edit: &FileEdit) -> Step<()> {
        if let Some(halted) = self.ctl.poll_kill_switch() {
            return ensure(halted);
        }
        let path = normalize_path(&edit.path);
        if let Some(envelope) = &self.envelope
            && !envelope.contains(&path)
        {
            return Err(self.halt(
                AgentState::FailedByScope,
                format!("file outside plan scope: {path}"),
            ));
        }
        let full = self.root().join(&path);
        let existed = full.is_file();
        let old = if existed {
            fs::read_to_string(&full)
                .with_context(|| format!("read {}", full.display()))
                .map_err(|err| self.halt(AgentState::Failed, format!("{err:#}")))?
        } else {
            String::new()
        };
        if self.express {
            let violations = express_lane::analyze_change(&path, &old, &edit.content);
            if !violations.is_empty() {
                return Err(self.halt(AgentState::Failed, violations.join("; ")));
            }
        }
        let lines = changed_line_count(&old, &edit.content);

        let written = full
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(&full, &edit.content));
        if let Err(err) = written {
            return Err(self.halt(AgentState::Failed, format!("write {path}: {err}")));
        }
        if !existed {
            self.isolation.track_created(&path);
        }
        self.ctl.record_tool(
            "write_file",
            Some(&json!({ "path": path })),
            Some(&Value::String(edit.content.clone())),
            true,
            None,
        );

        match self.ctl.record_diff(&path, lines) {
            DiffDecision::Accepted => Ok(()),
            DiffDecision::NeedsConfirmation(violation) => {
                let files = self.ctl.context().planned_files.clone();
                let request = ApprovalRequest::for_budget(&violation, &files);
                let confirmed = self.collab.confirmer.confirm(&request);
                self.ctl.record_confirmation(&violation, confirmed);
                if confirmed {
                    Ok(())
                } else {
                    Err(self.halt(
                        AgentState::Failed,
                        format!("soft budget violation not confirmed: {violation}"),
                    ))
                }
            }
            DiffDecision::ScopeViolation { path } => Err(self.halt(
                AgentState::FailedByScope,
                format!("file outside plan scope: {path}"),
            )),
            DiffDecision::Halted(transition) => ensure(transition),
        }
    }

    /// Lockfiles unchanged and nothing touched outside the plan.
    fn check_envelope(&mut self) -> Step<()> {
        let Some(envelope) = self.envelope.clone() else {
            return Ok(());
        };
        let current = self
            .collab
            .lockfiles
            .lockfile_hash()
            .map_err(|err| self.halt(AgentState::Failed, format!("lockfiles: {err:#}")))?;
        if let Err(violation) = envelope.verify_lockfile(&current) {
            return Err(self.halt(AgentState::Failed, violation.to_string()));
        }
        let changed: Vec<String> = self
            .isolation
            .git()
            .changed_paths()
            .map_err(|err| self.halt(AgentState::Failed, format!("git status: {err:#}")))?
            .into_iter()
            .filter(|path| !is_kernel_path(path))
            .collect();
        let violations = envelope.scope_violations(&changed);
        if !violations.is_empty() {
            return Err(self.halt(AgentState::FailedByScope, violations.join("; ")));
        }
        Ok(())
    }

    fn check_green(&mut self) -> Step<()> {
        let paths: Vec<String> = self.tdd.checkpoints().map(|c| c.test_file.clone()).collect();
        for path in paths {
            let full = self.root().join(&path);
            let content = match fs::read(&full) {
                Ok(content) => content,
                // A deleted test fails the integrity check below.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => {
                    return Err(self.halt(
                        AgentState::Failed,
                        format!("read {}: {err}", full.display()),
                    ));
                }
            };
            let run = self
                .collab
                .test_runner
                .run_test(&path)
                .map_err(|err| self.halt(AgentState::Failed, format!("test runner: {err:#}")))?;
            let verdict = self.tdd.assert_green(&path, run.passed, &content);
            if let Some(checkpoint) = self.tdd.checkpoint(&path).cloned() {
                self.ctl.audit_mut().append(AuditEvent::TddCheckpoint {
                    checkpoint,
                    outcome: match &verdict {
                        Ok(()) => "green".to_string(),
                        Err(violation) => violation.to_string(),
                    },
                });
            }
            if let Err(violation) = verdict {
                return Err(self.halt(AgentState::Failed, violation.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::io::audit_log::AuditLog;
    use crate::io::git::Git;
    use crate::test_support::{
        FakeProbe, RecordingConfirmer, ScriptedImplementer, ScriptedTestRunner,
        ScriptedTierRunner,
    };

    #[test]
    fn explain_task_stops_after_discovery() {
        let temp = tempfile::tempdir().expect("tempdir");
        let probe = FakeProbe::new("abc123");
        let mut ctl = Controller::new(
            ControllerConfig::default(),
            Box::new(probe.clone()),
            AuditLog::in_memory("s1"),
        );
        let mut isolation = TaskIsolation::new(Git::new(temp.path()));
        let mut implementer = ScriptedImplementer::default();
        let mut tests = ScriptedTestRunner::default();
        let mut tiers = ScriptedTierRunner::passing();
        let mut confirmer = RecordingConfirmer::answering(true);
        let mut collab = Collaborators {
            implementer: &mut implementer,
            test_runner: &mut tests,
            tiers: &mut tiers,
            lockfiles: &probe,
            toolchain: &probe,
            confirmer: &mut confirmer,
        };
        let request = TaskRequest {
            task: "how does the parser work?".to_string(),
            intent: IntentResult::new(TaskIntent::Explain, 0.9),
            repo_summary: String::new(),
            stack: None,
            express_lane: true,
        };

        let outcome = run_task(
            &mut ctl,
            &mut isolation,
            &request,
            &mut collab,
            &TaskSettings::default(),
        )
        .expect("run");

        assert_eq!(outcome.final_state, AgentState::RepoDiscovery);
        assert!(outcome.failure.is_none());
        assert!(outcome.envelope_hash.is_none());
        assert_eq!(outcome.attempts, 0);
        assert_eq!(ctl.replay().toolchain.get("git").map(String::as_str), Some("git version 2.43.0"));
        assert!(tiers.calls.is_empty());
    }

    #[test]
    fn settings_follow_config() {
        let mut cfg = KernelConfig::default();
        cfg.fix_loop.max_attempts = 2;
        cfg.verification.skip = vec![VerifyTier::CiGate];
        let settings = TaskSettings::from(&cfg);
        assert_eq!(settings.fix_loop_attempts, 2);
        let mut tiers = ScriptedTierRunner::passing();
        let report = settings.pipeline.run(&mut tiers);
        assert_eq!(report.skipped, vec![VerifyTier::CiGate]);
    }
}
