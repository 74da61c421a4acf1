//! Collaborators that read repository state for drift and envelope checks.
//!
//! The controller and task driver only see these traits, so tests can swap in
//! fixed values without a real repository.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::envelope::lockfile_hash;
use crate::core::hashing::sha256_hex;
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

/// Lockfiles recognized when no list is configured, in hashing order.
pub const DEFAULT_LOCKFILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "requirements.txt",
    "pyproject.toml",
    "go.sum",
    "Gemfile.lock",
    "composer.lock",
];

/// Head reference and file checksums of the live repository.
pub trait RepoProbe {
    /// Current VCS head, or `None` outside a repository.
    fn head(&self) -> Result<Option<String>>;
    /// sha256 of the file at `path` (relative to the root), `None` if missing.
    fn file_checksum(&self, path: &str) -> Result<Option<String>>;
}

pub trait LockfileHasher {
    fn lockfile_hash(&self) -> Result<String>;
}

pub trait ToolchainProbe {
    /// Tool name -> version string (`not_found` when unavailable).
    fn toolchain(&self) -> Result<BTreeMap<String, String>>;
}

/// Filesystem and git backed implementation of every probe.
#[derive(Debug, Clone)]
pub struct FsProbe {
    root: PathBuf,
    lockfiles: Vec<String>,
}

impl FsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lockfiles: DEFAULT_LOCKFILES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_lockfiles(mut self, lockfiles: Vec<String>) -> Self {
        self.lockfiles = lockfiles;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RepoProbe for FsProbe {
    fn head(&self) -> Result<Option<String>> {
        let git = Git::new(&self.root);
        if !git.is_repo() {
            return Ok(None);
        }
        // A repository without commits has no HEAD yet.
        Ok(git.head_sha().ok())
    }

    fn file_checksum(&self, path: &str) -> Result<Option<String>> {
        let full = self.root.join(path);
        if !full.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
        Ok(Some(sha256_hex(bytes)))
    }
}

impl LockfileHasher for FsProbe {
    fn lockfile_hash(&self) -> Result<String> {
        let mut present = Vec::new();
        for name in &self.lockfiles {
            let path = self.root.join(name);
            if path.is_file() {
                let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
                present.push((name.as_str(), bytes));
            }
        }
        debug!(count = present.len(), "hashing lockfiles");
        Ok(lockfile_hash(
            present
                .iter()
                .map(|(name, bytes)| (*name, bytes.as_slice())),
        ))
    }
}

const TOOLCHAIN: &[(&str, &str)] = &[
    ("git", "git"),
    ("python", "python3"),
    ("node", "node"),
    ("npm", "npm"),
    ("cargo", "cargo"),
];

impl ToolchainProbe for FsProbe {
    fn toolchain(&self) -> Result<BTreeMap<String, String>> {
        let mut versions = BTreeMap::new();
        for (name, program) in TOOLCHAIN {
            versions.insert(name.to_string(), tool_version(program));
        }
        Ok(versions)
    }
}

fn tool_version(program: &str) -> String {
    let mut cmd = Command::new(program);
    cmd.arg("--version");
    match run_command_with_timeout(cmd, None, Duration::from_secs(10), 4096) {
        Ok(out) if out.status.success() && !out.timed_out => {
            let text = String::from_utf8_lossy(&out.stdout);
            let first = text.lines().next().unwrap_or("").trim();
            if first.is_empty() {
                "unknown".to_string()
            } else {
                first.to_string()
            }
        }
        _ => "not_found".to_string(),
    }
}
