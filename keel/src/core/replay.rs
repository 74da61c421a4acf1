//! Replay log: hashes of every tool call, comparable across runs.
//!
//! Two sessions driven by the same inputs should produce the same sequence of
//! (tool, input hash, output hash). `verify_against` reports the first place
//! where they do not.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::hashing::{sha256_hex, sha256_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub input_hash: String,
    pub output_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_policy_hash: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Arguments for [`ReplayLog::record`].
#[derive(Debug, Clone, Default)]
pub struct ToolCall<'a> {
    pub tool_name: &'a str,
    pub input: Option<&'a Value>,
    pub output: Option<&'a Value>,
    pub sampling_policy_hash: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceField {
    EntryCount,
    ToolName,
    InputHash,
    OutputHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub index: usize,
    pub field: DivergenceField,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayComparison {
    pub matched: usize,
    pub first_divergence: Option<Divergence>,
}

impl ReplayComparison {
    pub fn is_identical(&self) -> bool {
        self.first_divergence.is_none()
    }
}

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayLog {
    pub session_id: String,
    #[serde(default)]
    pub toolchain: BTreeMap<String, String>,
    entries: Vec<ReplayEntry>,
    #[serde(default = "genesis")]
    fingerprint: String,
}

fn genesis() -> String {
    GENESIS.to_string()
}

/// Hash a tool payload: strings as raw bytes, everything else as JSON.
pub fn hash_content(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => sha256_hex(b""),
        Some(Value::String(s)) => sha256_hex(s.as_bytes()),
        Some(other) => sha256_json(other).unwrap_or_else(|_| sha256_hex(other.to_string())),
    }
}

impl ReplayLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            toolchain: BTreeMap::new(),
            entries: Vec::new(),
            fingerprint: genesis(),
        }
    }

    pub fn with_toolchain(mut self, toolchain: BTreeMap<String, String>) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Append an entry and fold it into the rolling fingerprint.
    pub fn record(&mut self, call: ToolCall<'_>) -> &ReplayEntry {
        let entry = ReplayEntry {
            sequence_id: self.entries.len() as u64,
            timestamp: Utc::now(),
            tool_name: call.tool_name.to_string(),
            input_hash: hash_content(call.input),
            output_hash: hash_content(call.output),
            sampling_policy_hash: call.sampling_policy_hash,
            duration_ms: call.duration_ms,
            success: call.success,
            error: call.error,
        };
        self.fingerprint = sha256_hex(format!(
            "{}|{}|{}|{}|{}",
            self.fingerprint, entry.sequence_id, entry.tool_name, entry.input_hash, entry.output_hash
        ));
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rolling hash over every recorded (sequence, tool, input, output).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Compare against a reference run (`self` is the expected side).
    pub fn verify_against(&self, actual: &ReplayLog) -> ReplayComparison {
        let mut matched = 0;
        for (index, (want, got)) in self.entries.iter().zip(&actual.entries).enumerate() {
            let mismatch = if want.tool_name != got.tool_name {
                Some((DivergenceField::ToolName, &want.tool_name, &got.tool_name))
            } else if want.input_hash != got.input_hash {
                Some((DivergenceField::InputHash, &want.input_hash, &got.input_hash))
            } else if want.output_hash != got.output_hash {
                Some((DivergenceField::OutputHash, &want.output_hash, &got.output_hash))
            } else {
                None
            };
            if let Some((field, expected, found)) = mismatch {
                return ReplayComparison {
                    matched,
                    first_divergence: Some(Divergence {
                        index,
                        field,
                        expected: expected.clone(),
                        actual: found.clone(),
                    }),
                };
            }
            matched += 1;
        }
        let first_divergence = (self.entries.len() != actual.entries.len()).then(|| Divergence {
            index: matched,
            field: DivergenceField::EntryCount,
            expected: self.entries.len().to_string(),
            actual: actual.entries.len().to_string(),
        });
        ReplayComparison {
            matched,
            first_divergence,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
