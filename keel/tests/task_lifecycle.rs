//! End-to-end tests for `run_task` against real git repositories.
//!
//! Each test builds a throwaway repository, scripts the implementer and the
//! test/tier runners, and checks the final state, the audit trail, and what
//! is left on disk.

use keel::controller::{Controller, ControllerConfig};
use keel::core::budget::BudgetLimits;
use keel::core::types::{AgentState, IntentResult, RollbackDomain, TaskIntent};
use keel::core::verification::VerifyTier;
use keel::io::audit_log::{AuditEvent, AuditLog};
use keel::io::config::{AmbiguityPolicy, IntentConfig};
use keel::io::isolation::{RollbackStatus, TaskIsolation};
use keel::io::kill_switch::KillSwitchConfig;
use keel::io::probe::FsProbe;
use keel::core::merge_guard::MergeBlock;
use keel::task::{
    Collaborators, FileEdit, MergeOutcome, Plan, TaskOutcome, TaskRequest, TaskSettings,
    merge_task, run_task,
};
use keel::test_support::{
    FakeProbe, RecordingConfirmer, ScriptedCi, ScriptedImplementer, ScriptedTestRunner,
    ScriptedTierRunner, TestRepo,
};

const BUGGY: &str = "def add(a, b):\n    return a - b\n";
const FIXED: &str = "def add(a, b):\n    return a + b\n";
const TEST: &str = "from src.calc import add\n\n\ndef test_add():\n    assert add(1, 2) == 3\n";

fn fixture() -> TestRepo {
    let repo = TestRepo::new().expect("repo");
    repo.commit_files(&[("src/calc.py", BUGGY)], "add calc")
        .expect("commit");
    repo
}

fn fix_plan() -> Plan {
    Plan {
        files: vec!["src/calc.py".to_string()],
        tests: vec![FileEdit::new("tests/test_calc.py", TEST)],
    }
}

fn request(intent: TaskIntent, confidence: f64) -> TaskRequest {
    TaskRequest {
        task: "fix add() returning the difference".to_string(),
        intent: IntentResult::new(intent, confidence),
        repo_summary: "python calculator".to_string(),
        stack: Some("python".to_string()),
        express_lane: false,
    }
}

fn docs_request() -> TaskRequest {
    TaskRequest {
        task: "document the calculator".to_string(),
        express_lane: true,
        ..request(TaskIntent::Develop, 0.95)
    }
}

fn states(controller: &Controller) -> Vec<AgentState> {
    controller.history().iter().map(|r| r.to).collect()
}

struct Harness {
    controller: Controller,
    isolation: TaskIsolation,
    /// Answer given to every soft budget confirmation.
    confirm: bool,
}

impl Harness {
    fn new(repo: &TestRepo, config: ControllerConfig) -> Self {
        Self {
            controller: Controller::new(
                config,
                Box::new(FsProbe::new(repo.path())),
                AuditLog::in_memory("session-1"),
            ),
            isolation: TaskIsolation::new(repo.git()),
            confirm: false,
        }
    }

    fn run(
        &mut self,
        repo: &TestRepo,
        request: &TaskRequest,
        implementer: &mut ScriptedImplementer,
        tests: &mut ScriptedTestRunner,
        tiers: &mut ScriptedTierRunner,
        settings: &TaskSettings,
    ) -> TaskOutcome {
        let lockfiles = FsProbe::new(repo.path());
        let toolchain = FakeProbe::new("unused");
        let mut confirmer = RecordingConfirmer::answering(self.confirm);
        let mut collab = Collaborators {
            implementer,
            test_runner: tests,
            tiers,
            lockfiles: &lockfiles,
            toolchain: &toolchain,
            confirmer: &mut confirmer,
        };
        run_task(
            &mut self.controller,
            &mut self.isolation,
            request,
            &mut collab,
            settings,
        )
        .expect("run task")
    }

    fn count(&self, pred: impl Fn(&AuditEvent) -> bool) -> usize {
        self.controller
            .audit()
            .records()
            .iter()
            .filter(|r| pred(&r.event))
            .count()
    }
}

#[test]
fn fix_task_runs_red_green_and_completes() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer =
        ScriptedImplementer::new(fix_plan()).then(vec![FileEdit::new("src/calc.py", FIXED)]);
    let mut tests = ScriptedTestRunner::new([false, true]);
    let mut tiers = ScriptedTierRunner::passing();
    let settings = TaskSettings {
        kill_switch: Some(KillSwitchConfig::default()),
        ..TaskSettings::default()
    };

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &settings,
    );

    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    assert_eq!(outcome.attempts, 1);
    assert!(harness.controller.kill_switch_mut().is_none(), "disarmed");
    assert!(outcome.rollback.is_none());
    assert!(outcome.envelope_hash.is_some());
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(FIXED));
    assert_eq!(
        tests.calls,
        vec!["tests/test_calc.py".to_string(), "tests/test_calc.py".to_string()]
    );
    assert_eq!(tiers.calls, VerifyTier::ALL.to_vec());

    assert_eq!(
        states(&harness.controller),
        vec![
            AgentState::IntentAnalysis,
            AgentState::RepoDiscovery,
            AgentState::Planning,
            AgentState::TaskIsolation,
            AgentState::ProvingGround,
            AgentState::Implementing,
            AgentState::Verifying,
            AgentState::Complete,
        ]
    );
    // Exactly one audit record per applied transition.
    assert_eq!(
        harness.controller.audit().transitions().count(),
        harness.controller.history().len()
    );
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::RiskViolation { .. })),
        0
    );
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::TddCheckpoint { .. })),
        2
    );
    harness.controller.audit().verify().expect("chain intact");

    // The task branch is kept for review.
    let branch = repo.git().current_branch().expect("branch");
    assert!(branch.starts_with("keel/task-"), "on {branch}");
}

#[test]
fn retryable_lint_failure_gets_another_attempt() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer = ScriptedImplementer::new(fix_plan())
        .then(vec![FileEdit::new(
            "src/calc.py",
            "import os\n\n\ndef add(a, b):\n    return a + b\n",
        )])
        .then(vec![FileEdit::new("src/calc.py", FIXED)]);
    let mut tests = ScriptedTestRunner::new([false, true, true]);
    let mut tiers = ScriptedTierRunner::passing()
        .fail_once(VerifyTier::Lint, &["src/calc.py:1:1: F401 'os' imported but unused"]);

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(implementer.feedback.len(), 2);
    assert_eq!(implementer.feedback[0], None);
    assert!(
        implementer.feedback[1]
            .as_deref()
            .is_some_and(|f| f.contains("F401"))
    );
    assert!(
        harness
            .controller
            .history()
            .iter()
            .any(|r| r.to == AgentState::Retrying)
    );
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(FIXED));
}

#[test]
fn failed_verification_rolls_back_every_file() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let plan = Plan {
        files: vec!["src/calc.py".to_string(), "src/helpers.py".to_string()],
        tests: vec![FileEdit::new("tests/test_calc.py", TEST)],
    };
    let mut implementer = ScriptedImplementer::new(plan).then(vec![
        FileEdit::new("src/calc.py", "def add(a, b):\n    return a * b\n"),
        FileEdit::new("src/helpers.py", "def double(x):\n    return 2 * x\n"),
    ]);
    let mut tests = ScriptedTestRunner::new([false, true]);
    let mut tiers = ScriptedTierRunner::passing()
        .fail_once(VerifyTier::UnitTest, &["AssertionError: assert 2 == 3"]);

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    let rollback = outcome.rollback.expect("rolled back");
    assert_eq!(rollback.status, RollbackStatus::Restored);
    assert_eq!(rollback.released_locks.len(), 1);
    assert!(rollback.released_locks[0].starts_with("keel/task-"));
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(BUGGY));
    assert_eq!(repo.read("src/helpers.py"), None);
    assert_eq!(repo.read("tests/test_calc.py"), None);
    assert_eq!(repo.git().current_branch().expect("branch"), "main");
    assert!(repo.git().changed_paths().expect("status").is_empty());
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::Rollback { .. })),
        1
    );
    let report = outcome.verification.expect("report");
    assert_eq!(report.stopped_at, Some(VerifyTier::UnitTest));
    assert!(report.not_reached.contains(&VerifyTier::CiGate));
}

#[test]
fn test_that_passes_before_implementation_is_rejected() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer = ScriptedImplementer::new(fix_plan());
    let mut tests = ScriptedTestRunner::new([true]);
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    assert!(
        outcome
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("tests/test_calc.py"))
    );
    assert!(implementer.feedback.is_empty(), "implementer never ran");
    assert!(tiers.calls.is_empty());
    assert_eq!(repo.read("tests/test_calc.py"), None);
}

#[test]
fn edit_outside_the_envelope_fails_by_scope() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer = ScriptedImplementer::new(fix_plan()).then(vec![
        FileEdit::new("src/calc.py", FIXED),
        FileEdit::new("setup.py", "print('surprise')\n"),
    ]);
    let mut tests = ScriptedTestRunner::new([false]);
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::FailedByScope);
    assert_eq!(repo.read("setup.py"), None);
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(BUGGY));
}

#[test]
fn ambiguous_intent_waits_for_feedback_when_configured() {
    let repo = fixture();
    let config = ControllerConfig {
        intent: IntentConfig {
            ambiguity_policy: AmbiguityPolicy::Pause,
            ..IntentConfig::default()
        },
        ..ControllerConfig::default()
    };
    let mut harness = Harness::new(&repo, config);
    let mut implementer = ScriptedImplementer::new(fix_plan());
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Develop, 0.4),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::FeedbackWait);
    assert!(outcome.failure.is_none());
    assert!(outcome.rollback.is_none());
    assert_eq!(repo.git().current_branch().expect("branch"), "main");
}

#[test]
fn oversized_diff_is_declined_and_rolled_back() {
    let repo = fixture();
    let config = ControllerConfig {
        budget: BudgetLimits {
            max_diff_lines: 3,
            ..BudgetLimits::default()
        },
        ..ControllerConfig::default()
    };
    let mut harness = Harness::new(&repo, config);
    let big: String = (0..10).map(|i| format!("X{i} = {i}\n")).collect();
    let plan = Plan {
        files: vec!["src/calc.py".to_string()],
        tests: Vec::new(),
    };
    let mut implementer =
        ScriptedImplementer::new(plan).then(vec![FileEdit::new("src/calc.py", big)]);
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Generate, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::RiskViolation { .. })),
        1
    );
    assert_eq!(
        harness.count(|e| matches!(
            e,
            AuditEvent::BudgetConfirmation {
                confirmed: false,
                ..
            }
        )),
        1
    );
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(BUGGY));
}

#[test]
fn dirty_tree_is_never_isolated_or_reset() {
    let repo = fixture();
    repo.write("src/calc.py", "# local edit\n").expect("write");
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer = ScriptedImplementer::new(fix_plan());
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    let rollback = outcome.rollback.expect("rollback attempted");
    assert_eq!(rollback.status, RollbackStatus::NoOp);
    assert_eq!(repo.read("src/calc.py").as_deref(), Some("# local edit\n"));
    assert_eq!(repo.git().current_branch().expect("branch"), "main");
}

#[test]
fn failing_unit_test_is_not_retried_even_when_it_reads_like_a_type_error() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer =
        ScriptedImplementer::new(fix_plan()).then(vec![FileEdit::new("src/calc.py", FIXED)]);
    let mut tests = ScriptedTestRunner::new([false, true]);
    let mut tiers = ScriptedTierRunner::passing().fail_once(
        VerifyTier::UnitTest,
        &["FAILED tests/test_calc.py::test_add - TypeError: add() takes 2 positional arguments but 3 were given"],
    );

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(implementer.feedback.len(), 1);
    assert!(!states(&harness.controller).contains(&AgentState::Retrying));
    assert!(
        outcome
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("Logic")),
        "{:?}",
        outcome.failure
    );
}

#[test]
fn confirmed_oversized_diff_completes_and_is_audited() {
    let repo = fixture();
    let config = ControllerConfig {
        budget: BudgetLimits {
            max_diff_lines: 3,
            ..BudgetLimits::default()
        },
        ..ControllerConfig::default()
    };
    let mut harness = Harness::new(&repo, config);
    harness.confirm = true;
    let big: String = (0..10).map(|i| format!("X{i} = {i}\n")).collect();
    let plan = Plan {
        files: vec!["src/calc.py".to_string()],
        tests: Vec::new(),
    };
    let mut implementer =
        ScriptedImplementer::new(plan).then(vec![FileEdit::new("src/calc.py", big.clone())]);
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Generate, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    assert_eq!(repo.read("src/calc.py"), Some(big));
    assert_eq!(
        harness.count(|e| matches!(
            e,
            AuditEvent::BudgetConfirmation {
                confirmed: true,
                ..
            }
        )),
        1
    );
    harness.controller.audit().verify().expect("chain intact");
}

#[test]
fn documentation_task_takes_the_express_lane() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let plan = Plan {
        files: vec!["README.md".to_string()],
        tests: Vec::new(),
    };
    let readme = "# fixture\n\nRun the tests with pytest.\n";
    let mut implementer =
        ScriptedImplementer::new(plan).then(vec![FileEdit::new("README.md", readme)]);
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &docs_request(),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    assert_eq!(
        states(&harness.controller),
        vec![
            AgentState::IntentAnalysis,
            AgentState::Implementing,
            AgentState::Verifying,
            AgentState::Complete,
        ]
    );
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::ExpressLane { granted: true, .. })),
        1
    );
    assert!(outcome.envelope_hash.is_some());
    assert_eq!(tiers.calls, VerifyTier::ALL.to_vec());
    assert_eq!(repo.read("README.md").as_deref(), Some(readme));
    let branch = repo.git().current_branch().expect("branch");
    assert!(branch.starts_with("keel/task-"), "on {branch}");
}

#[test]
fn code_change_is_refused_the_express_lane() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut implementer =
        ScriptedImplementer::new(fix_plan()).then(vec![FileEdit::new("src/calc.py", FIXED)]);
    let mut tests = ScriptedTestRunner::new([false, true]);
    let mut tiers = ScriptedTierRunner::passing();
    let request = TaskRequest {
        express_lane: true,
        ..request(TaskIntent::Fix, 0.95)
    };

    let outcome = harness.run(
        &repo,
        &request,
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::ExpressLane { granted: false, .. })),
        1
    );
    let visited = states(&harness.controller);
    assert!(visited.contains(&AgentState::Planning));
    assert!(visited.contains(&AgentState::ProvingGround));
}

#[test]
fn express_edit_that_adds_a_shebang_fails() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let plan = Plan {
        files: vec!["README.md".to_string()],
        tests: Vec::new(),
    };
    let mut implementer = ScriptedImplementer::new(plan)
        .then(vec![FileEdit::new("README.md", "#!/bin/sh\necho pwned\n")]);
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &docs_request(),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    assert!(
        outcome
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("shebang"))
    );
    assert_eq!(repo.read("README.md").as_deref(), Some("# fixture\n"));
    assert!(tiers.calls.is_empty());
}

fn completed_fix(repo: &TestRepo) -> Harness {
    let mut harness = Harness::new(repo, ControllerConfig::default());
    let mut implementer =
        ScriptedImplementer::new(fix_plan()).then(vec![FileEdit::new("src/calc.py", FIXED)]);
    let mut tests = ScriptedTestRunner::new([false, true]);
    let mut tiers = ScriptedTierRunner::passing();
    let outcome = harness.run(
        repo,
        &request(TaskIntent::Fix, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );
    assert!(outcome.succeeded(), "failure: {:?}", outcome.failure);
    harness
}

#[test]
fn verified_task_merges_into_its_base_branch() {
    let repo = fixture();
    let mut harness = completed_fix(&repo);
    let mut ci = ScriptedCi::green();

    let outcome = merge_task(
        &mut harness.controller,
        &mut harness.isolation,
        &mut ci,
        "fix add()",
    )
    .expect("merge");

    let MergeOutcome::Merged { sha } = outcome else {
        panic!("expected a merge, got {outcome:?}");
    };
    assert_eq!(ci.calls, vec![sha.clone()]);
    assert_eq!(repo.git().current_branch().expect("branch"), "main");
    assert_eq!(repo.git().head_sha().expect("head"), sha);
    assert_eq!(repo.read("src/calc.py").as_deref(), Some(FIXED));
    assert_eq!(repo.read("tests/test_calc.py").as_deref(), Some(TEST));
    assert!(harness.isolation.held_locks().is_empty());
    assert_eq!(harness.isolation.domain(), RollbackDomain::PostMerge);
    assert_eq!(
        harness.isolation.rollback().status,
        RollbackStatus::ManualInterventionRequired
    );
    assert_eq!(
        harness.count(|e| matches!(e, AuditEvent::MergeDecision { merged: true, .. })),
        1
    );
}

#[test]
fn merge_is_blocked_when_ci_validated_another_commit() {
    let repo = fixture();
    let mut harness = completed_fix(&repo);
    let stale = repo.git().head_sha().expect("head");
    let mut ci = ScriptedCi::validating(&stale);

    let outcome = merge_task(
        &mut harness.controller,
        &mut harness.isolation,
        &mut ci,
        "fix add()",
    )
    .expect("merge attempt");

    assert!(
        matches!(outcome, MergeOutcome::Blocked(MergeBlock::CiShaMismatch { .. })),
        "{outcome:?}"
    );
    let branch = repo.git().current_branch().expect("branch");
    assert!(branch.starts_with("keel/task-"), "on {branch}");
    assert_eq!(harness.isolation.domain(), RollbackDomain::InBranch);
    assert_eq!(harness.isolation.held_locks().len(), 1);
    assert_eq!(
        harness.count(|e| matches!(
            e,
            AuditEvent::MergeDecision {
                merged: false,
                blocked_by: Some(_),
                ..
            }
        )),
        1
    );
}

#[test]
fn only_complete_tasks_can_merge() {
    let repo = fixture();
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let mut ci = ScriptedCi::green();
    let err = merge_task(
        &mut harness.controller,
        &mut harness.isolation,
        &mut ci,
        "nothing",
    )
    .expect_err("idle task");
    assert!(err.to_string().contains("COMPLETE"), "{err}");
    assert!(ci.calls.is_empty());
}

#[test]
fn unreadable_planned_file_fails_instead_of_being_overwritten() {
    let repo = fixture();
    std::fs::write(repo.path().join("src/data.txt"), [0xff, 0xfe, 0x00, 0x80]).expect("write");
    repo.git().commit_all("binary data").expect("commit");
    let mut harness = Harness::new(&repo, ControllerConfig::default());
    let plan = Plan {
        files: vec!["src/data.txt".to_string()],
        tests: Vec::new(),
    };
    let mut implementer =
        ScriptedImplementer::new(plan).then(vec![FileEdit::new("src/data.txt", "text\n")]);
    let mut tests = ScriptedTestRunner::default();
    let mut tiers = ScriptedTierRunner::passing();

    let outcome = harness.run(
        &repo,
        &request(TaskIntent::Generate, 0.95),
        &mut implementer,
        &mut tests,
        &mut tiers,
        &TaskSettings::default(),
    );

    assert_eq!(outcome.final_state, AgentState::Failed);
    assert!(
        outcome
            .failure
            .as_deref()
            .is_some_and(|f| f.contains("src/data.txt")),
        "{:?}",
        outcome.failure
    );
    assert_eq!(
        std::fs::read(repo.path().join("src/data.txt")).expect("read"),
        vec![0xff, 0xfe, 0x00, 0x80]
    );
    assert!(tiers.calls.is_empty());
}
