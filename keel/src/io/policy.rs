//! Loader for `.keel/policy.json`, validated against the bundled schema.
//!
//! A missing file means "no project policy". A file that exists but does not
//! parse or validate is an error: a broken policy must never widen what the
//! agent may run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::project_policy::ProjectPolicy;

pub const POLICY_PATH: &str = ".keel/policy.json";

const POLICY_SCHEMA: &str = include_str!("../../schemas/command_policy.schema.json");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    command_policy: ProjectPolicy,
}

/// Check a parsed policy document against the schema.
pub fn validate_policy(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(POLICY_SCHEMA).context("parse policy schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("policy schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse and validate policy JSON text.
pub fn parse_policy(raw: &str) -> Result<ProjectPolicy> {
    let value: Value = serde_json::from_str(raw).context("parse policy json")?;
    validate_policy(&value)?;
    let file: PolicyFile = serde_json::from_value(value).context("deserialize policy")?;
    Ok(file.command_policy)
}

/// Load a policy file; a missing file yields an empty policy.
pub fn load_policy(path: &Path) -> Result<ProjectPolicy> {
    if !path.exists() {
        debug!(path = %path.display(), "no project policy");
        return Ok(ProjectPolicy::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let policy = parse_policy(&raw).with_context(|| format!("load {}", path.display()))?;
    debug!(
        allow = policy.allow_prefixes.len(),
        block = policy.block_prefixes.len(),
        approval = policy.require_approval_prefixes.len(),
        "project policy loaded"
    );
    Ok(policy)
}

/// Load `<root>/.keel/policy.json`.
pub fn load_repo_policy(root: &Path) -> Result<ProjectPolicy> {
    load_policy(&root.join(POLICY_PATH))
}
