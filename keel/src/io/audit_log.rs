//! Append-only, hash-chained audit log under `.keel/audit/`.
//!
//! Each line is one JSON [`AuditRecord`]. A record's hash covers its sequence
//! number, timestamp, session, event, and the previous record's hash, so any
//! edit, deletion, or reordering breaks [`verify_chain`].
//!
//! This is a product artifact, distinct from `tracing` diagnostics: it is
//! always written, regardless of `RUST_LOG`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::core::approvals::ApproverRole;
use crate::core::budget::BudgetViolation;
use crate::core::classifier::CommandClassification;
use crate::core::hashing::sha256_json;
use crate::core::tdd::TddCheckpoint;
use crate::core::types::{AgentState, TaskIntent};
use crate::core::verification::VerificationReport;
use crate::io::isolation::RollbackOutcome;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Transition {
        from: AgentState,
        to: AgentState,
        reason: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, String>,
    },
    FailSafe {
        from: AgentState,
        to: AgentState,
        reason: String,
    },
    IntentClassified {
        intent: TaskIntent,
        confidence: f64,
        decision: String,
    },
    RiskViolation {
        violation: BudgetViolation,
    },
    /// `classification.command` is redacted; `command_hash` covers the raw text.
    CommandCheck {
        command_hash: String,
        classification: CommandClassification,
    },
    ApprovalGranted {
        command_hash: String,
        role: ApproverRole,
    },
    BudgetConfirmation {
        violation: BudgetViolation,
        confirmed: bool,
    },
    ExpressLane {
        granted: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        violations: Vec<String>,
    },
    ToolCall {
        sequence_id: u64,
        tool_name: String,
        success: bool,
    },
    ModelCall {
        sequence_id: u64,
        policy_hash: String,
    },
    TddCheckpoint {
        checkpoint: TddCheckpoint,
        outcome: String,
    },
    Verification {
        report: VerificationReport,
    },
    Rollback {
        outcome: RollbackOutcome,
    },
    EnvelopeCommitted {
        envelope_hash: String,
        plan_hash: String,
        files: usize,
    },
    MergeDecision {
        branch_head: String,
        merged: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked_by: Option<String>,
    },
}

impl AuditEvent {
    pub fn is_transition(&self) -> bool {
        matches!(self, AuditEvent::Transition { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: String,
    pub session_id: String,
    pub event: AuditEvent,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditChainError {
    #[error("expected seq {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("record {seq}: prev_hash does not match the preceding record")]
    PrevHashMismatch { seq: u64 },
    #[error("record {seq}: hash does not match its contents")]
    HashMismatch { seq: u64 },
    #[error("record {seq}: cannot encode for hashing: {message}")]
    Encode { seq: u64, message: String },
}

fn record_hash(
    seq: u64,
    timestamp: &str,
    session_id: &str,
    event: &AuditEvent,
    prev_hash: &str,
) -> serde_json::Result<String> {
    sha256_json(&(seq, timestamp, session_id, event, prev_hash))
}

/// Session audit log. Records are kept in memory and, when backed by a file,
/// appended and flushed one line at a time.
#[derive(Debug)]
pub struct AuditLog {
    session_id: String,
    path: Option<PathBuf>,
    records: Vec<AuditRecord>,
    write_failures: u32,
}

impl AuditLog {
    /// Open `<dir>/audit_<session>.jsonl`, continuing an existing chain.
    pub fn create(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
        let path = dir.join(format!("audit_{session_id}.jsonl"));
        let records = if path.exists() {
            let records = read_records(&path)?;
            verify_chain(&records).with_context(|| format!("verify {}", path.display()))?;
            records
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), existing = records.len(), "audit log opened");
        Ok(Self {
            session_id: session_id.to_string(),
            path: Some(path),
            records,
            write_failures: 0,
        })
    }

    /// A log that is never persisted (dry runs and tests).
    pub fn in_memory(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            path: None,
            records: Vec::new(),
            write_failures: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn transitions(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter().filter(|r| r.event.is_transition())
    }

    /// Lines that could not be persisted; the in-memory chain is still intact.
    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }

    /// Append an event. Never fails: an unwritable file is reported through
    /// `tracing` and counted, and the record stays in memory.
    pub fn append(&mut self, event: AuditEvent) -> &AuditRecord {
        let seq = self.records.len() as u64 + 1;
        let prev_hash = self
            .records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let hash = match record_hash(seq, &timestamp, &self.session_id, &event, &prev_hash) {
            Ok(hash) => hash,
            Err(err) => {
                error!(seq, err = %err, "audit record could not be encoded");
                String::new()
            }
        };
        let record = AuditRecord {
            seq,
            timestamp,
            session_id: self.session_id.clone(),
            event,
            prev_hash,
            hash,
        };
        if let Some(path) = &self.path
            && let Err(err) = append_line(path, &record)
        {
            self.write_failures += 1;
            error!(path = %path.display(), err = %format!("{err:#}"), "failed to write audit record");
        }
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    pub fn verify(&self) -> Result<(), AuditChainError> {
        verify_chain(&self.records)
    }
}

fn append_line(path: &Path, record: &AuditRecord) -> Result<()> {
    let mut line = serde_json::to_string(record).context("serialize audit record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.flush().context("flush audit log")?;
    Ok(())
}

/// Read every record from a JSONL audit file. Blank lines are ignored.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), index + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Check sequence numbers, back-links, and every record hash.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditChainError> {
    let mut prev_hash = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        let expected = index as u64 + 1;
        if record.seq != expected {
            return Err(AuditChainError::SequenceGap {
                expected,
                found: record.seq,
            });
        }
        if record.prev_hash != prev_hash {
            return Err(AuditChainError::PrevHashMismatch { seq: record.seq });
        }
        let actual = record_hash(
            record.seq,
            &record.timestamp,
            &record.session_id,
            &record.event,
            &record.prev_hash,
        )
        .map_err(|err| AuditChainError::Encode {
            seq: record.seq,
            message: err.to_string(),
        })?;
        if actual != record.hash {
            return Err(AuditChainError::HashMismatch { seq: record.seq });
        }
        prev_hash = record.hash.clone();
    }
    Ok(())
}
