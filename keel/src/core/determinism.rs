//! Sampling-policy pinning for model calls.
//!
//! A session is only replayable if every model call used the same sampling
//! parameters and the same system prompt. The guard enforces both.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hashing::sha256_hex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
}

impl SamplingPolicy {
    /// Short stable hash recorded in every replay entry of a model call.
    pub fn policy_hash(&self) -> String {
        let digest = sha256_hex(format!(
            "model={}|temp={}|top_p={}",
            self.model, self.temperature, self.top_p
        ));
        digest[..16].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeterminismViolation {
    #[error("temperature {actual} differs from pinned {expected}")]
    Temperature { expected: f64, actual: f64 },
    #[error("top_p {actual} differs from pinned {expected}")]
    TopP { expected: f64, actual: f64 },
    #[error("system prompt changed mid-session (was {expected}, now {actual})")]
    PromptMutated { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeterminismConfig {
    /// When false only the system prompt is checked.
    pub strict: bool,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            strict: true,
            temperature: 0.0,
            top_p: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeterminismGuard {
    config: DeterminismConfig,
    prompt_hash: Option<String>,
}

impl DeterminismGuard {
    pub fn new(config: DeterminismConfig) -> Self {
        Self {
            config,
            prompt_hash: None,
        }
    }

    pub fn validate(&self, policy: &SamplingPolicy) -> Result<(), DeterminismViolation> {
        if !self.config.strict {
            return Ok(());
        }
        if policy.temperature != self.config.temperature {
            return Err(DeterminismViolation::Temperature {
                expected: self.config.temperature,
                actual: policy.temperature,
            });
        }
        if policy.top_p != self.config.top_p {
            return Err(DeterminismViolation::TopP {
                expected: self.config.top_p,
                actual: policy.top_p,
            });
        }
        Ok(())
    }

    /// The first prompt seen is pinned; any later different prompt is rejected.
    pub fn check_system_prompt(&mut self, prompt: &str) -> Result<(), DeterminismViolation> {
        let hash = sha256_hex(prompt);
        match &self.prompt_hash {
            None => {
                self.prompt_hash = Some(hash);
                Ok(())
            }
            Some(pinned) if *pinned == hash => Ok(()),
            Some(pinned) => Err(DeterminismViolation::PromptMutated {
                expected: pinned[..12].to_string(),
                actual: hash[..12].to_string(),
            }),
        }
    }
}
