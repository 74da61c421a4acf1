//! Test-first gate: a test must be seen failing before implementation and
//! passing, byte-for-byte unchanged, afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hashing::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TddViolation {
    #[error("test {path} was never registered")]
    NotRegistered { path: String },
    #[error("test {path} passed before implementation (tautological test)")]
    TautologicalTest { path: String },
    #[error("test {path} has not been observed failing")]
    RedNotObserved { path: String },
    #[error("test {path} was modified after the red checkpoint")]
    TestModified {
        path: String,
        red_hash: String,
        current_hash: String,
    },
    #[error("test {path} still fails after implementation")]
    StillFailing { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddCheckpoint {
    pub test_file: String,
    pub red_hash: String,
    pub observed_red: bool,
    pub observed_green: bool,
    pub final_hash: Option<String>,
}

impl TddCheckpoint {
    pub fn integrity_ok(&self) -> bool {
        self.final_hash
            .as_deref()
            .is_none_or(|hash| hash == self.red_hash)
    }
}

#[derive(Debug, Default)]
pub struct TddGate {
    checkpoints: BTreeMap<String, TddCheckpoint>,
}

impl TddGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly written test. Re-registering replaces the checkpoint.
    pub fn register(&mut self, path: &str, content: &[u8]) -> &TddCheckpoint {
        let checkpoint = TddCheckpoint {
            test_file: path.to_string(),
            red_hash: sha256_hex(content),
            observed_red: false,
            observed_green: false,
            final_hash: None,
        };
        self.checkpoints.insert(path.to_string(), checkpoint);
        &self.checkpoints[path]
    }

    /// Record the pre-implementation run; it must have failed.
    pub fn assert_red(&mut self, path: &str, run_passed: bool) -> Result<(), TddViolation> {
        let checkpoint = self.checkpoint_mut(path)?;
        if run_passed {
            return Err(TddViolation::TautologicalTest {
                path: path.to_string(),
            });
        }
        checkpoint.observed_red = true;
        Ok(())
    }

    /// Record the post-implementation run. Test integrity is checked before
    /// the pass flag so a rewritten test cannot make itself green.
    pub fn assert_green(
        &mut self,
        path: &str,
        run_passed: bool,
        current_content: &[u8],
    ) -> Result<(), TddViolation> {
        let checkpoint = self.checkpoint_mut(path)?;
        if !checkpoint.observed_red {
            return Err(TddViolation::RedNotObserved {
                path: path.to_string(),
            });
        }
        let current_hash = sha256_hex(current_content);
        checkpoint.final_hash = Some(current_hash.clone());
        if current_hash != checkpoint.red_hash {
            return Err(TddViolation::TestModified {
                path: path.to_string(),
                red_hash: checkpoint.red_hash.clone(),
                current_hash,
            });
        }
        if !run_passed {
            return Err(TddViolation::StillFailing {
                path: path.to_string(),
            });
        }
        checkpoint.observed_green = true;
        Ok(())
    }

    pub fn checkpoint(&self, path: &str) -> Option<&TddCheckpoint> {
        self.checkpoints.get(path)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &TddCheckpoint> {
        self.checkpoints.values()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// True when every registered test went red then green unmodified.
    pub fn all_green(&self) -> bool {
        self.checkpoints
            .values()
            .all(|c| c.observed_red && c.observed_green && c.integrity_ok())
    }

    fn checkpoint_mut(&mut self, path: &str) -> Result<&mut TddCheckpoint, TddViolation> {
        self.checkpoints
            .get_mut(path)
            .ok_or_else(|| TddViolation::NotRegistered {
                path: path.to_string(),
            })
    }
}
