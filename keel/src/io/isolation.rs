//! Task isolation on a dedicated branch, and domain-aware rollback.
//!
//! A task starts in `PRE_BRANCH`. Isolation refuses a dirty tree (no stashing,
//! no partial isolation), creates `keel/task-<id>`, and moves to `IN_BRANCH`.
//! Rollback then depends on the domain: nothing to undo before the branch,
//! a hard reset inside it, and never anything automatic after a merge.
//! [`TaskIsolation::merge`] is the only way into `POST_MERGE`.

use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::core::envelope::normalize_path;
use crate::core::types::RollbackDomain;
use crate::io::git::Git;

pub const BRANCH_PREFIX: &str = "keel/task-";

/// Kernel-owned files (config, policy, audit) live here and never count as
/// task changes.
pub const KERNEL_DIR: &str = ".keel/";

pub fn is_kernel_path(path: &str) -> bool {
    path.starts_with(KERNEL_DIR)
}

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("working tree is dirty; commit or discard changes first:\n{listing}")]
    DirtyTree { listing: String },
    #[error("task already isolated on {branch}")]
    AlreadyIsolated { branch: String },
    #[error("branch {branch} already exists")]
    BranchExists { branch: String },
    #[error(transparent)]
    Git(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    NoOp,
    Restored,
    ManualInterventionRequired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub domain: RollbackDomain,
    pub status: RollbackStatus,
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub released_locks: Vec<String>,
}

/// Eight lowercase alphanumerics.
pub fn new_task_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[derive(Debug)]
pub struct TaskIsolation {
    git: Git,
    domain: RollbackDomain,
    original_branch: Option<String>,
    task_branch: Option<String>,
    base_sha: Option<String>,
    created: BTreeSet<String>,
    locks: Vec<String>,
}

impl TaskIsolation {
    pub fn new(git: Git) -> Self {
        Self {
            git,
            domain: RollbackDomain::PreBranch,
            original_branch: None,
            task_branch: None,
            base_sha: None,
            created: BTreeSet::new(),
            locks: Vec::new(),
        }
    }

    pub fn domain(&self) -> RollbackDomain {
        self.domain
    }

    pub fn task_branch(&self) -> Option<&str> {
        self.task_branch.as_deref()
    }

    pub fn original_branch(&self) -> Option<&str> {
        self.original_branch.as_deref()
    }

    /// Commit the original branch pointed at when the task branched.
    pub fn base_sha(&self) -> Option<&str> {
        self.base_sha.as_deref()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Create and switch to the task branch. Returns the branch name.
    #[instrument(skip_all, fields(task_id))]
    pub fn isolate(&mut self, task_id: &str) -> Result<String, IsolationError> {
        if let Some(branch) = &self.task_branch {
            return Err(IsolationError::AlreadyIsolated {
                branch: branch.clone(),
            });
        }
        let dirty: Vec<_> = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !is_kernel_path(&entry.path))
            .collect();
        if !dirty.is_empty() {
            warn!(count = dirty.len(), "refusing to isolate a dirty tree");
            let listing = dirty
                .iter()
                .map(|e| format!("{} {}", e.code, e.path))
                .collect::<Vec<_>>()
                .join("\n");
            return Err(IsolationError::DirtyTree { listing });
        }
        let original = self.git.current_branch()?;
        let base = self.git.head_sha()?;
        let branch = format!("{BRANCH_PREFIX}{task_id}");
        if self.git.branch_exists(&branch)? {
            return Err(IsolationError::BranchExists { branch });
        }
        self.git.checkout_new_branch(&branch)?;
        info!(branch = %branch, from = %original, "task isolated");
        self.original_branch = Some(original);
        self.task_branch = Some(branch.clone());
        self.base_sha = Some(base);
        self.domain.advance_to(RollbackDomain::InBranch);
        Ok(branch)
    }

    /// Remember a file the task created so rollback can remove it too.
    pub fn track_created(&mut self, path: &str) {
        self.created.insert(normalize_path(path));
    }

    pub fn hold_lock(&mut self, name: &str) {
        self.locks.push(name.to_string());
    }

    pub fn held_locks(&self) -> &[String] {
        &self.locks
    }

    pub fn mark_merged(&mut self) {
        self.domain.advance_to(RollbackDomain::PostMerge);
    }

    /// Commit the task's changes on its branch (kernel files excluded) and
    /// return the new head.
    #[instrument(skip_all)]
    pub fn commit_task(&mut self, message: &str) -> Result<String> {
        let Some(branch) = &self.task_branch else {
            return Err(anyhow!("no task branch to commit"));
        };
        let current = self.git.current_branch()?;
        if current != *branch {
            return Err(anyhow!("expected to be on {branch}, found {current}"));
        }
        self.git.commit_excluding(message, KERNEL_DIR)?;
        self.created.clear();
        self.git.head_sha()
    }

    /// Fast-forward the original branch onto the task branch, delete the task
    /// branch, and release held locks. Moves to `POST_MERGE`.
    #[instrument(skip_all)]
    pub fn merge(&mut self) -> Result<Vec<String>, IsolationError> {
        let (Some(original), Some(task)) = (self.original_branch.clone(), self.task_branch.clone())
        else {
            return Err(IsolationError::Git(anyhow!("task was never isolated")));
        };
        self.git.checkout_branch(&original)?;
        self.git.merge_ff_only(&task)?;
        self.git.delete_branch(&task)?;
        self.task_branch = None;
        self.mark_merged();
        info!(branch = %task, into = %original, "task branch merged");
        Ok(std::mem::take(&mut self.locks))
    }

    /// Undo the task's working-tree effects as far as the domain allows.
    #[instrument(skip_all, fields(domain = ?self.domain))]
    pub fn rollback(&mut self) -> RollbackOutcome {
        match self.domain {
            RollbackDomain::PreBranch => RollbackOutcome {
                domain: self.domain,
                status: RollbackStatus::NoOp,
                details: "no branch created; nothing to undo".to_string(),
                released_locks: std::mem::take(&mut self.locks),
            },
            RollbackDomain::InBranch => {
                let created: Vec<String> = self.created.iter().cloned().collect();
                let result = self
                    .git
                    .reset_hard()
                    .and_then(|()| self.git.clean_paths(&created));
                let released_locks = std::mem::take(&mut self.locks);
                match result {
                    Ok(()) => {
                        info!(created = created.len(), "task branch restored");
                        self.created.clear();
                        RollbackOutcome {
                            domain: self.domain,
                            status: RollbackStatus::Restored,
                            details: format!(
                                "reset to HEAD; removed {} created file(s)",
                                created.len()
                            ),
                            released_locks,
                        }
                    }
                    Err(err) => {
                        error!(err = %format!("{err:#}"), "rollback failed");
                        RollbackOutcome {
                            domain: self.domain,
                            status: RollbackStatus::Failed,
                            details: format!("{err:#}"),
                            released_locks,
                        }
                    }
                }
            }
            RollbackDomain::PostMerge => {
                warn!("post-merge rollback requested; leaving repository untouched");
                RollbackOutcome {
                    domain: self.domain,
                    status: RollbackStatus::ManualInterventionRequired,
                    details: "changes already merged; revert manually".to_string(),
                    released_locks: Vec::new(),
                }
            }
        }
    }

    /// Return to the original branch and delete the task branch.
    #[instrument(skip_all)]
    pub fn cleanup(&mut self) -> Result<()> {
        let (Some(original), Some(task)) = (self.original_branch.clone(), self.task_branch.take())
        else {
            return Ok(());
        };
        self.git.checkout_branch(&original)?;
        self.git.delete_branch(&task)?;
        info!(branch = %task, "task branch deleted");
        Ok(())
    }
}
