//! Immutable plan envelope binding a plan to the inputs it was made from.
//!
//! The envelope hash covers the planned file set, a snapshot of the task
//! inputs, and the dependency lockfiles. Any drift in those inputs produces a
//! different hash, and drift in lockfiles or scope is a governance violation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hashing::{sha256_hex, sha256_json};

/// Absolute ceiling on planned files regardless of configuration.
pub const MAX_FILE_CAP: usize = 50;

/// Lockfile hash recorded when the repository has none.
pub const NO_LOCKFILES: &str = "no_lockfiles";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeViolation {
    #[error("plan touches {count} files; cap is {cap}")]
    ScopeExceeded { count: usize, cap: usize },
    #[error("file outside plan scope: {path}")]
    OutsideScope { path: String },
    #[error("lockfile drift: expected {expected}, found {actual}")]
    LockfileDrift { expected: String, actual: String },
}

/// Everything the envelope hash depends on.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeInputs {
    pub task: String,
    pub repo_summary: String,
    pub base_tree: String,
    /// Tool name -> version string.
    pub toolchain: BTreeMap<String, String>,
    pub planned_files: Vec<String>,
    pub lockfile_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEnvelope {
    planned_files: Vec<String>,
    plan_hash: String,
    input_snapshot_hash: String,
    lockfile_hash: String,
    envelope_hash: String,
}

impl PlanEnvelope {
    /// Build the envelope. Planned files are de-duplicated and sorted, so the
    /// hash does not depend on the order the planner listed them in.
    pub fn create(inputs: EnvelopeInputs) -> serde_json::Result<Self> {
        let planned_files: Vec<String> = inputs
            .planned_files
            .iter()
            .map(|f| normalize_path(f))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let plan_hash = plan_hash(&planned_files);
        let input_snapshot_hash = input_snapshot_hash(
            &inputs.task,
            &inputs.repo_summary,
            &inputs.base_tree,
            &inputs.toolchain,
        )?;
        let envelope_hash = sha256_json(&(
            &plan_hash,
            &input_snapshot_hash,
            &inputs.lockfile_hash,
            &planned_files,
        ))?;
        Ok(Self {
            planned_files,
            plan_hash,
            input_snapshot_hash,
            lockfile_hash: inputs.lockfile_hash,
            envelope_hash,
        })
    }

    pub fn planned_files(&self) -> &[String] {
        &self.planned_files
    }

    pub fn plan_hash(&self) -> &str {
        &self.plan_hash
    }

    pub fn input_snapshot_hash(&self) -> &str {
        &self.input_snapshot_hash
    }

    pub fn lockfile_hash(&self) -> &str {
        &self.lockfile_hash
    }

    pub fn envelope_hash(&self) -> &str {
        &self.envelope_hash
    }

    /// Reject plans larger than `cap` (itself clamped to [`MAX_FILE_CAP`]).
    pub fn check_scope_cap(&self, cap: usize) -> Result<(), EnvelopeViolation> {
        let cap = cap.min(MAX_FILE_CAP);
        if self.planned_files.len() > cap {
            return Err(EnvelopeViolation::ScopeExceeded {
                count: self.planned_files.len(),
                cap,
            });
        }
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.planned_files.binary_search(&path).is_ok()
    }

    /// One message per changed file outside the planned set, sorted.
    pub fn scope_violations<S: AsRef<str>>(&self, changed: &[S]) -> Vec<String> {
        changed
            .iter()
            .map(|c| normalize_path(c.as_ref()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|path| !self.contains(path))
            .map(|path| EnvelopeViolation::OutsideScope { path }.to_string())
            .collect()
    }

    pub fn verify_lockfile(&self, current: &str) -> Result<(), EnvelopeViolation> {
        if current != self.lockfile_hash {
            return Err(EnvelopeViolation::LockfileDrift {
                expected: self.lockfile_hash.clone(),
                actual: current.to_string(),
            });
        }
        Ok(())
    }
}

/// Hash of the sorted planned file list.
pub fn plan_hash(sorted_files: &[String]) -> String {
    sha256_hex(sorted_files.join("\n"))
}

pub fn input_snapshot_hash(
    task: &str,
    repo_summary: &str,
    base_tree: &str,
    toolchain: &BTreeMap<String, String>,
) -> serde_json::Result<String> {
    sha256_json(&(task, repo_summary, base_tree, toolchain))
}

/// Hash lockfile contents given as `(name, bytes)` pairs in a fixed order.
pub fn lockfile_hash<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut buf = Vec::new();
    let mut any = false;
    for (name, bytes) in files {
        any = true;
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(bytes);
        buf.push(0);
    }
    if !any {
        return NO_LOCKFILES.to_string();
    }
    sha256_hex(buf)
}

/// Strip a leading `./` and use forward slashes so plan entries compare equal
/// to paths reported by git.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> EnvelopeInputs {
        let mut toolchain = BTreeMap::new();
        toolchain.insert("git".to_string(), "git version 2.43.0".to_string());
        toolchain.insert("python".to_string(), "Python 3.12.1".to_string());
        EnvelopeInputs {
            task: "fix an off-by-one bug".to_string(),
            repo_summary: "src/ tests/".to_string(),
            base_tree: "abc123".to_string(),
            toolchain,
            planned_files: vec!["src/b.py".to_string(), "./src/a.py".to_string()],
            lockfile_hash: lockfile_hash([("poetry.lock", b"v1".as_slice())]),
        }
    }

    fn hash_of(inputs: EnvelopeInputs) -> String {
        PlanEnvelope::create(inputs)
            .expect("envelope")
            .envelope_hash()
            .to_string()
    }

    #[test]
    fn envelope_is_deterministic_and_order_independent() {
        let a = hash_of(inputs());
        let mut reordered = inputs();
        reordered.planned_files.reverse();
        assert_eq!(a, hash_of(reordered));
        assert_eq!(a, hash_of(inputs()));
    }

    #[test]
    fn any_single_input_change_changes_the_hash() {
        let base = hash_of(inputs());
        let mutations: Vec<Box<dyn Fn(&mut EnvelopeInputs)>> = vec![
            Box::new(|i: &mut EnvelopeInputs| i.task.push('!')),
            Box::new(|i: &mut EnvelopeInputs| i.repo_summary.push('!')),
            Box::new(|i: &mut EnvelopeInputs| i.base_tree = "def456".to_string()),
            Box::new(|i: &mut EnvelopeInputs| {
                i.toolchain
                    .insert("node".to_string(), "v20.0.0".to_string());
            }),
            Box::new(|i: &mut EnvelopeInputs| i.planned_files.push("src/c.py".to_string())),
            Box::new(|i: &mut EnvelopeInputs| i.lockfile_hash = lockfile_hash([("poetry.lock", b"v2".as_slice())])),
        ];
        for mutate in mutations {
            let mut changed = inputs();
            mutate(&mut changed);
            assert_ne!(base, hash_of(changed));
        }
    }

    #[test]
    fn field_boundaries_are_part_of_the_snapshot() {
        let toolchain = BTreeMap::new();
        assert_ne!(
            input_snapshot_hash("a|b", "c", "tree", &toolchain).expect("hash"),
            input_snapshot_hash("a", "b|c", "tree", &toolchain).expect("hash")
        );
    }

    #[test]
    fn lockfile_mutation_is_detected() {
        let envelope = PlanEnvelope::create(inputs()).expect("envelope");
        envelope
            .verify_lockfile(&lockfile_hash([("poetry.lock", b"v1".as_slice())]))
            .expect("unchanged");
        let err = envelope
            .verify_lockfile(&lockfile_hash([("poetry.lock", b"v1 ".as_slice())]))
            .expect_err("drift");
        assert!(matches!(err, EnvelopeViolation::LockfileDrift { .. }));
    }

    #[test]
    fn no_lockfiles_has_sentinel_hash() {
        assert_eq!(lockfile_hash(std::iter::empty()), NO_LOCKFILES);
    }

    #[test]
    fn scope_cap_is_clamped_to_ceiling() {
        let mut big = inputs();
        big.planned_files = (0..60).map(|i| format!("src/f{i}.py")).collect();
        let envelope = PlanEnvelope::create(big).expect("envelope");
        assert_eq!(
            envelope.check_scope_cap(100),
            Err(EnvelopeViolation::ScopeExceeded {
                count: 60,
                cap: MAX_FILE_CAP
            })
        );
        let small = PlanEnvelope::create(inputs()).expect("envelope");
        assert!(small.check_scope_cap(2).is_ok());
        assert!(small.check_scope_cap(1).is_err());
    }

    #[test]
    fn scope_violations_list_unplanned_files() {
        let envelope = PlanEnvelope::create(inputs()).expect("envelope");
        assert_eq!(envelope.planned_files(), ["src/a.py", "src/b.py"]);
        let violations = envelope.scope_violations(&["src/a.py", "./src/z.py", "README.md"]);
        assert_eq!(
            violations,
            vec![
                "file outside plan scope: README.md".to_string(),
                "file outside plan scope: src/z.py".to_string(),
            ]
        );
    }
}
