//! Test-only fixtures: throwaway git repositories and scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::hashing::sha256_hex;
use crate::core::merge_guard::{CiReport, CiStatus};
use crate::core::verification::{TierResult, TierRunner, VerifyTier};
use crate::io::approval_request::ApprovalRequest;
use crate::io::git::Git;
use crate::io::probe::{LockfileHasher, RepoProbe, ToolchainProbe};
use crate::io::test_runner::{TestRun, TestRunner};
use crate::task::{CiProvider, Confirmer, FileEdit, Implementer, Plan};

/// A git repository in a temp directory with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q", "-b", "main"])?;
        repo.git_cmd(&["config", "user.email", "keel@example.com"])?;
        repo.git_cmd(&["config", "user.name", "keel tests"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# fixture\n")?;
        Git::new(repo.path()).commit_all("initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, content).with_context(|| format!("write {}", full.display()))
    }

    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.path().join(path)).ok()
    }

    /// Write files and commit them in one step.
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) -> Result<()> {
        for (path, content) in files {
            self.write(path, content)?;
        }
        self.git().commit_all(message)
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            bail!("git {} failed", args.join(" "));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeRepo {
    head: Option<String>,
    files: BTreeMap<String, String>,
    lockfile_hash: String,
}

/// In-memory repository probe. Clones share state, so a test can keep a
/// handle and mutate the "repository" after giving the probe away.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<FakeRepo>>,
}

impl FakeProbe {
    pub fn new(head: &str) -> Self {
        let probe = Self::default();
        probe.set_head(head);
        probe.set_lockfile_hash(crate::core::envelope::NO_LOCKFILES);
        probe
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeRepo) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_head(&self, head: &str) {
        self.with_state(|s| s.head = Some(head.to_string()));
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.with_state(|s| s.files.insert(path.to_string(), content.to_string()));
    }

    pub fn remove_file(&self, path: &str) {
        self.with_state(|s| s.files.remove(path));
    }

    pub fn set_lockfile_hash(&self, hash: &str) {
        self.with_state(|s| s.lockfile_hash = hash.to_string());
    }
}

impl RepoProbe for FakeProbe {
    fn head(&self) -> Result<Option<String>> {
        Ok(self.with_state(|s| s.head.clone()))
    }

    fn file_checksum(&self, path: &str) -> Result<Option<String>> {
        Ok(self.with_state(|s| s.files.get(path).map(sha256_hex)))
    }
}

impl LockfileHasher for FakeProbe {
    fn lockfile_hash(&self) -> Result<String> {
        Ok(self.with_state(|s| s.lockfile_hash.clone()))
    }
}

impl ToolchainProbe for FakeProbe {
    fn toolchain(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([
            ("git".to_string(), "git version 2.43.0".to_string()),
            ("python".to_string(), "Python 3.12.1".to_string()),
        ]))
    }
}

/// Returns queued pass/fail results in order and records every call.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    results: VecDeque<bool>,
    pub calls: Vec<String>,
}

impl ScriptedTestRunner {
    pub fn new(results: impl IntoIterator<Item = bool>) -> Self {
        Self {
            results: results.into_iter().collect(),
            calls: Vec::new(),
        }
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run_test(&mut self, test_file: &str) -> Result<TestRun> {
        self.calls.push(test_file.to_string());
        let Some(passed) = self.results.pop_front() else {
            bail!("no scripted test result left for {test_file}");
        };
        Ok(TestRun {
            passed,
            output: if passed { "1 passed" } else { "1 failed" }.to_string(),
        })
    }
}

/// Passes every tier unless a failure is queued for it.
#[derive(Debug, Default)]
pub struct ScriptedTierRunner {
    failures: BTreeMap<VerifyTier, VecDeque<Vec<String>>>,
    unconfigured: Vec<VerifyTier>,
    pub calls: Vec<VerifyTier>,
}

impl ScriptedTierRunner {
    pub fn passing() -> Self {
        Self::default()
    }

    /// Queue one failing run of `tier`.
    pub fn fail_once(mut self, tier: VerifyTier, errors: &[&str]) -> Self {
        self.failures
            .entry(tier)
            .or_default()
            .push_back(errors.iter().map(|e| e.to_string()).collect());
        self
    }

    /// Pretend no command is configured for `tier`.
    pub fn without(mut self, tier: VerifyTier) -> Self {
        self.unconfigured.push(tier);
        self
    }
}

impl TierRunner for ScriptedTierRunner {
    fn run_tier(&mut self, tier: VerifyTier) -> Option<TierResult> {
        if self.unconfigured.contains(&tier) {
            return None;
        }
        self.calls.push(tier);
        match self.failures.get_mut(&tier).and_then(VecDeque::pop_front) {
            Some(errors) => Some(TierResult::fail(tier, 1, errors)),
            None => Some(TierResult::pass(tier, 1)),
        }
    }
}

/// Plans a fixed set of files and hands out queued edits per attempt.
#[derive(Debug, Default)]
pub struct ScriptedImplementer {
    plan: Plan,
    attempts: VecDeque<Vec<FileEdit>>,
    pub feedback: Vec<Option<String>>,
}

impl ScriptedImplementer {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            ..Self::default()
        }
    }

    pub fn then(mut self, edits: Vec<FileEdit>) -> Self {
        self.attempts.push_back(edits);
        self
    }
}

impl Implementer for ScriptedImplementer {
    fn plan(&mut self, _task: &str) -> Result<Plan> {
        Ok(self.plan.clone())
    }

    fn implement(&mut self, attempt: u32, feedback: Option<&str>) -> Result<Vec<FileEdit>> {
        self.feedback.push(feedback.map(str::to_string));
        match self.attempts.pop_front() {
            Some(edits) => Ok(edits),
            None => bail!("no scripted edits left for attempt {attempt}"),
        }
    }
}

/// Answers every confirmation with a fixed verdict and keeps the requests.
#[derive(Debug, Default)]
pub struct RecordingConfirmer {
    pub answer: bool,
    pub requests: Vec<ApprovalRequest>,
}

impl RecordingConfirmer {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            requests: Vec::new(),
        }
    }
}

impl Confirmer for RecordingConfirmer {
    fn confirm(&mut self, request: &ApprovalRequest) -> bool {
        self.requests.push(request.clone());
        self.answer
    }
}

/// CI that reports a fixed verdict. By default it validated whatever commit
/// it is asked about, successfully, in its latest run.
#[derive(Debug, Clone)]
pub struct ScriptedCi {
    pub status: CiStatus,
    pub latest_run: bool,
    /// Reported instead of the requested commit when set.
    pub validated_sha: Option<String>,
    pub calls: Vec<String>,
}

impl Default for ScriptedCi {
    fn default() -> Self {
        Self {
            status: CiStatus::Success,
            latest_run: true,
            validated_sha: None,
            calls: Vec::new(),
        }
    }
}

impl ScriptedCi {
    pub fn green() -> Self {
        Self::default()
    }

    pub fn validating(sha: &str) -> Self {
        Self {
            validated_sha: Some(sha.to_string()),
            ..Self::default()
        }
    }
}

impl CiProvider for ScriptedCi {
    fn report(&mut self, sha: &str) -> Result<CiReport> {
        self.calls.push(sha.to_string());
        Ok(CiReport {
            validated_sha: self.validated_sha.clone().unwrap_or_else(|| sha.to_string()),
            status: self.status,
            latest_run: self.latest_run,
        })
    }
}
