//! Kernel configuration stored under `.keel/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetLimits;
use crate::core::determinism::DeterminismConfig;
use crate::core::envelope::MAX_FILE_CAP;
use crate::core::fix_loop::DEFAULT_MAX_ATTEMPTS;
use crate::core::gate::GateConfig;
use crate::core::verification::VerifyTier;
use crate::io::kill_switch::KillSwitchConfig;
use crate::io::probe::DEFAULT_LOCKFILES;

pub const CONFIG_PATH: &str = ".keel/config.toml";

/// Kernel configuration (TOML).
///
/// Edited by humans; every table is optional and missing fields fall back to
/// the built-in limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub budget: BudgetLimits,
    pub kill_switch: KillSwitchConfig,
    pub envelope: EnvelopeConfig,
    pub fix_loop: FixLoopConfig,
    pub verification: VerificationConfig,
    pub intent: IntentConfig,
    pub audit: AuditConfig,
    pub gate: GateConfig,
    pub determinism: DeterminismConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Planned files allowed per task; values above 50 are clamped.
    pub max_file_cap: usize,
    /// Lockfiles hashed for drift detection, in order.
    pub lockfiles: Vec<String>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_file_cap: MAX_FILE_CAP,
            lockfiles: DEFAULT_LOCKFILES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FixLoopConfig {
    pub max_attempts: u32,
}

impl Default for FixLoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Shell command per tier name (e.g. `LINT = "ruff check ."`). Tiers
    /// without a command are skipped.
    pub commands: BTreeMap<String, String>,
    pub skip: Vec<VerifyTier>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            skip: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Continue with the classifier's best guess.
    #[default]
    Proceed,
    /// Stop in FEEDBACK_WAIT and ask the user.
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntentConfig {
    pub confidence_threshold: f64,
    pub ambiguity_policy: AmbiguityPolicy,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            ambiguity_policy: AmbiguityPolicy::Proceed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Relative to the repository root.
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".keel/audit"),
        }
    }
}

impl VerificationConfig {
    pub fn command_for(&self, tier: VerifyTier) -> Option<&str> {
        self.commands.get(tier.as_str()).map(String::as_str)
    }

    pub fn set_command(&mut self, tier: VerifyTier, command: impl Into<String>) {
        self.commands.insert(tier.as_str().to_string(), command.into());
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        let b = &self.budget;
        for (name, value) in [
            ("budget.max_retries_per_state", u64::from(b.max_retries_per_state)),
            ("budget.max_total_retries", u64::from(b.max_total_retries)),
            ("budget.max_diff_lines", u64::from(b.max_diff_lines)),
            (
                "budget.max_cumulative_diff_lines",
                u64::from(b.max_cumulative_diff_lines),
            ),
            ("budget.max_shell_commands", u64::from(b.max_shell_commands)),
            ("budget.max_execution_time_secs", b.max_execution_time_secs),
            ("budget.max_files_modified", u64::from(b.max_files_modified)),
            ("kill_switch.default_timeout_secs", self.kill_switch.default_timeout_secs),
            ("kill_switch.hard_ceiling_secs", self.kill_switch.hard_ceiling_secs),
            ("fix_loop.max_attempts", u64::from(self.fix_loop.max_attempts)),
            ("verification.timeout_secs", self.verification.timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.envelope.max_file_cap == 0 {
            return Err(anyhow!("envelope.max_file_cap must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        for (tier, cmd) in &self.verification.commands {
            if VerifyTier::parse(tier).is_none() {
                return Err(anyhow!("verification.commands: unknown tier {tier}"));
            }
            if cmd.trim().is_empty() {
                return Err(anyhow!("verification.commands.{tier} must be non-empty"));
            }
        }
        let threshold = self.intent.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "intent.confidence_threshold must be within 0..=1, got {threshold}"
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Load `<root>/.keel/config.toml`.
pub fn load_repo_config(root: &Path) -> Result<KernelConfig> {
    load_config(&root.join(CONFIG_PATH))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
