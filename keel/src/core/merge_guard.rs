//! Preconditions for merging a task branch back into its base.
//!
//! All four guards must hold: the base branch has not moved since the task
//! branched, CI validated exactly the commit being merged, CI succeeded, and
//! that CI run is the latest one for the commit.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Success,
    Failure,
    Pending,
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CiStatus::Success => "SUCCESS",
            CiStatus::Failure => "FAILURE",
            CiStatus::Pending => "PENDING",
        })
    }
}

/// What CI says about one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiReport {
    pub validated_sha: String,
    pub status: CiStatus,
    /// False when a newer run exists for the same commit.
    pub latest_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeEvidence {
    /// Base branch commit the task branched from.
    pub branch_base: String,
    /// Base branch commit now.
    pub target_head: String,
    /// Task branch commit to merge.
    pub branch_head: String,
    pub ci: CiReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeBlock {
    #[error("base moved: branched from {}, now at {}", short(.branched), short(.current))]
    StaleBase { branched: String, current: String },
    #[error("CI validated {}, branch head is {}", short(.validated), short(.head))]
    CiShaMismatch { validated: String, head: String },
    #[error("CI status is {status}, expected SUCCESS")]
    CiNotSuccess { status: CiStatus },
    #[error("CI run is stale; a newer run exists for this commit")]
    CiNotLatest,
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

/// First failing guard, in a fixed order.
pub fn check(evidence: &MergeEvidence) -> Result<(), MergeBlock> {
    if evidence.branch_base != evidence.target_head {
        return Err(MergeBlock::StaleBase {
            branched: evidence.branch_base.clone(),
            current: evidence.target_head.clone(),
        });
    }
    if evidence.ci.validated_sha != evidence.branch_head {
        return Err(MergeBlock::CiShaMismatch {
            validated: evidence.ci.validated_sha.clone(),
            head: evidence.branch_head.clone(),
        });
    }
    if evidence.ci.status != CiStatus::Success {
        return Err(MergeBlock::CiNotSuccess {
            status: evidence.ci.status,
        });
    }
    if !evidence.ci.latest_run {
        return Err(MergeBlock::CiNotLatest);
    }
    Ok(())
}
