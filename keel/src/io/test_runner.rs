//! Test execution collaborators backed by configured shell commands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::verification::{TierResult, TierRunner, VerifyTier};
use crate::io::config::VerificationConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout, shell};

/// Runs a single test file, as needed for red/green observation.
pub trait TestRunner {
    fn run_test(&mut self, test_file: &str) -> Result<TestRun>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub passed: bool,
    pub output: String,
}

/// Runs `<command> <test_file>` through `sh -c` in the repository root.
#[derive(Debug, Clone)]
pub struct ShellTestRunner {
    root: PathBuf,
    command: String,
    timeout: Duration,
    output_limit: usize,
}

impl ShellTestRunner {
    pub fn new(root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            command: command.into(),
            timeout: Duration::from_secs(10 * 60),
            output_limit: 100_000,
        }
    }

    pub fn with_limits(mut self, timeout: Duration, output_limit: usize) -> Self {
        self.timeout = timeout;
        self.output_limit = output_limit;
        self
    }
}

impl TestRunner for ShellTestRunner {
    fn run_test(&mut self, test_file: &str) -> Result<TestRun> {
        let script = format!("{} {}", self.command, shell_quote(test_file));
        debug!(script = %script, "running test file");
        let out = run_command_with_timeout(
            shell(&script, &self.root),
            None,
            self.timeout,
            self.output_limit,
        )?;
        Ok(TestRun {
            passed: out.succeeded(),
            output: out.combined_text(),
        })
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Verification tiers backed by the `[verification.commands]` table.
#[derive(Debug, Clone)]
pub struct CommandTierRunner {
    root: PathBuf,
    config: VerificationConfig,
}

impl CommandTierRunner {
    pub fn new(root: impl Into<PathBuf>, config: VerificationConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }
}

const ERROR_LINES: usize = 20;

fn tier_result(tier: VerifyTier, out: &CommandOutput) -> TierResult {
    let duration_ms = out.duration.as_millis() as u64;
    let text = out.combined_text();
    if out.succeeded() {
        let mut result = TierResult::pass(tier, duration_ms);
        result.details = text.lines().last().unwrap_or("").trim().to_string();
        return result;
    }
    let mut errors: Vec<String> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .take(ERROR_LINES)
        .map(str::to_string)
        .collect();
    if errors.is_empty() {
        errors.push(match out.status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        });
    }
    let mut result = TierResult::fail(tier, duration_ms, errors);
    result.details = text;
    result
}

impl TierRunner for CommandTierRunner {
    fn run_tier(&mut self, tier: VerifyTier) -> Option<TierResult> {
        let command = self.config.command_for(tier)?.to_string();
        info!(tier = %tier, command = %command, "running verification tier");
        let result = run_command_with_timeout(
            shell(&command, &self.root),
            None,
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        );
        Some(match result {
            Ok(out) => tier_result(tier, &out),
            Err(err) => {
                warn!(tier = %tier, err = %format!("{err:#}"), "tier command could not run");
                TierResult::fail(tier, 0, vec![format!("{err:#}")])
            }
        })
    }
}
