//! Git adapter for task isolation and drift detection.
//!
//! The kernel creates a task branch, hard-resets it, commits to it,
//! fast-forwards the original branch onto it, switches back, and deletes it.
//! Everything else here is read-only.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to isolate a task)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Full SHA of any revision (branch name, tag, `HEAD~1`, ...).
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// Tree object id of HEAD, used as the envelope's base tree.
    pub fn head_tree(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD^{tree}"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths with uncommitted changes, sorted.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out task branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Discard all tracked changes on the current branch.
    #[instrument(skip_all)]
    pub fn reset_hard(&self) -> Result<()> {
        warn!("resetting worktree to HEAD");
        self.run_checked(&["reset", "--hard", "HEAD"])?;
        Ok(())
    }

    /// Remove untracked files, limited to `paths`. No-op for an empty list.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["clean", "-f", "-d", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Force-delete a local branch.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Stage every change except paths under `exclude`, then commit.
    /// Commits even when nothing changed so the task always has a head.
    #[instrument(skip_all, fields(exclude))]
    pub fn commit_excluding(&self, message: &str, exclude: &str) -> Result<()> {
        let pathspec = format!(":(exclude){exclude}");
        self.run_checked(&["add", "-A", "--", ".", &pathspec])?;
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }

    /// Fast-forward the current branch to `branch`; refuses a real merge.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_ff_only(&self, branch: &str) -> Result<()> {
        debug!(branch, "fast-forwarding");
        self.run_checked(&["merge", "--ff-only", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    #[cfg(any(test, feature = "test-support"))]
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes; used only to build fixture repositories.
    #[cfg(any(test, feature = "test-support"))]
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.add_all()?;
        self.run_checked(&["commit", "--allow-empty", "-m", message])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
