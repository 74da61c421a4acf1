//! Regex rule engine that sorts shell commands into risk tiers.
//!
//! Evaluation is ordered: the hard block list first, then git rewrites, file
//! destruction, and network access, then the read-only/test/build allow-list.
//! Anything that falls through is [`CommandTier::Unknown`] and is blocked.
//! Project prefix policy and session approvals are layered on top by
//! [`crate::core::gate::CommandGate`].

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::redact::redact_secrets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandTier {
    Safe,
    Network,
    FileDestructive,
    GitRewrite,
    Blocked,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPolicy {
    Allow,
    RateLimit,
    RequireApproval,
    Block,
}

impl CommandPolicy {
    /// True when the command may run now without a human.
    pub fn permits_execution(self) -> bool {
        matches!(self, CommandPolicy::Allow | CommandPolicy::RateLimit)
    }
}

impl fmt::Display for CommandPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandPolicy::Allow => "ALLOW",
            CommandPolicy::RateLimit => "RATE_LIMIT",
            CommandPolicy::RequireApproval => "REQUIRE_APPROVAL",
            CommandPolicy::Block => "BLOCK",
        };
        f.write_str(name)
    }
}

/// Which layer produced the final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    HardBlockList,
    ProjectPolicy,
    RuleEngine,
    ApprovalCache,
    RateLimiter,
    NetworkIsolation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandClassification {
    pub command: String,
    pub tier: CommandTier,
    pub policy: CommandPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub reasoning: String,
    pub source: DecisionSource,
}

impl CommandClassification {
    /// Copy safe to persist: secrets in the command text are masked.
    pub fn redacted(&self) -> Self {
        Self {
            command: redact_secrets(&self.command),
            ..self.clone()
        }
    }
}

/// Fixed tier to policy table.
pub fn policy_for(tier: CommandTier) -> CommandPolicy {
    match tier {
        CommandTier::Safe => CommandPolicy::Allow,
        CommandTier::Network => CommandPolicy::RateLimit,
        CommandTier::FileDestructive | CommandTier::GitRewrite => CommandPolicy::RequireApproval,
        CommandTier::Blocked | CommandTier::Unknown => CommandPolicy::Block,
    }
}

struct Rule {
    tier: CommandTier,
    name: &'static str,
    pattern: Regex,
}

fn compile(tier: CommandTier, specs: &[(&'static str, &'static str)]) -> Vec<Rule> {
    specs
        .iter()
        .map(|&(name, pattern)| Rule {
            tier,
            name,
            pattern: Regex::new(pattern).unwrap(),
        })
        .collect()
}

static HARD_BLOCKS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(
        CommandTier::Blocked,
        &[
            (
                "recursive delete of root, home, or parent",
                r"\brm\s+(?:-{1,2}[\w-]+\s+)*(?:/\*?|~/?|\$HOME/?|\.\./?)(?:\s|$)",
            ),
            ("filesystem format", r"\bmkfs\b"),
            ("raw device read", r"\bdd\s+.*\bif=/dev/"),
            ("raw device write", r"(?:\bof=|>\s*)/dev/(?:sd|hd|nvme|disk|mmcblk)"),
            ("privilege escalation", r"(?i)\b(?:sudo|doas)\b"),
            ("user switch", r"(?:^|[;&|]\s*)su(?:\s|$)"),
            ("fork bomb", r":\(\)\s*\{.*:\s*\|\s*:.*\}"),
            ("world-writable root", r"\bchmod\s+(?:-\w+\s+)*0?777\s+/(?:\s|$)"),
            ("ownership change", r"\bchown\b"),
            ("clipboard access", r"\b(?:pbcopy|pbpaste|xclip|xsel)\b"),
            (
                "environment exfiltration",
                r"\b(?:env|printenv|set)\b.*\|\s*(?:nc|ncat|netcat|curl|wget)\b",
            ),
            (
                "file upload via curl",
                r"\bcurl\b.*(?:\s-d|--data(?:-binary|-raw|-urlencode)?|\s-F|--form)\s*@",
            ),
            ("file upload via curl", r"\bcurl\b.*(?:\s-T|--upload-file)\s+\S"),
            ("file piped to netcat", r"\b(?:nc|ncat|netcat)\b.*<"),
            ("reverse shell", r"/dev/(?:tcp|udp)/"),
            ("truncate absolute path", r"\btruncate\s+-s\s*0\s+/"),
        ],
    )
});

static GIT_REWRITE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(
        CommandTier::GitRewrite,
        &[
            (
                "history rewrite",
                r"\bgit\s+(?:reset|clean|rebase|filter-branch|filter-repo)\b",
            ),
            (
                "force push",
                r"\bgit\s+push\b.*(?:--force(?:-with-lease)?\b|\s-f\b)",
            ),
            ("branch delete", r"\bgit\s+branch\s+.*-D\b"),
            ("discard worktree", r"\bgit\s+(?:checkout|restore)\s+(?:--\s+)?\.(?:\s|$)"),
        ],
    )
});

static FILE_DESTRUCTIVE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(
        CommandTier::FileDestructive,
        &[
            ("file delete", r"(?:^|[\s;&|])rm\s"),
            ("directory delete", r"\b(?:rmdir|shred|unlink)\b"),
            ("truncate", r"\btruncate\b"),
            ("raw copy", r"\bdd\s"),
            ("permission wipe", r"\bchmod\s+(?:-\w+\s+)*0?00\b"),
            ("move outside tree", r"\bmv\s+.*\s\.\.(?:/|\s|$)"),
            ("find delete", r"\bfind\b.*\s-delete\b"),
        ],
    )
});

static NETWORK: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(
        CommandTier::Network,
        &[
            ("http client", r"\b(?:curl|wget)\b"),
            ("npm install", r"\b(?:npm|pnpm)\s+(?:install|i|add|ci)\b"),
            ("yarn install", r"\byarn\s+(?:add|install)\b"),
            ("pip install", r"\b(?:pip3?|python3?\s+-m\s+pip)\s+install\b"),
            (
                "system package install",
                r"\b(?:apt|apt-get|brew|dnf|yum|apk)\s+install\b",
            ),
            ("container registry", r"\b(?:docker|podman)\s+(?:pull|push|login)\b"),
            ("git remote", r"\bgit\s+(?:clone|fetch|pull|push)\b"),
            ("cargo registry", r"\bcargo\s+(?:install|add|update|publish)\b"),
            ("go module fetch", r"\bgo\s+(?:get|install)\b"),
            ("remote shell", r"\b(?:ssh|scp|rsync|telnet|ftp|nc|ncat)\b"),
        ],
    )
});

static SAFE: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    compile(
        CommandTier::Safe,
        &[
            (
                "read-only inspection",
                r"^(?:ls|cat|head|tail|wc|grep|egrep|rg|find|fd|pwd|echo|printf|which|tree|stat|file|diff|sort|uniq|cut|tr|basename|dirname|realpath|true|date|whoami|uname)(?:\s|$)",
            ),
            (
                "read-only git",
                r"^git\s+(?:status|log|diff|show|branch|rev-parse|ls-files|blame|describe)(?:\s|$)",
            ),
            (
                "test runner",
                r"^(?:pytest|py\.test|tox|nox|jest|vitest|mocha|rspec|phpunit|ctest)(?:\s|$)",
            ),
            (
                "python module runner",
                r"^python3?\s+-m\s+(?:pytest|unittest|mypy|ruff|py_compile)(?:\s|$)",
            ),
            (
                "linter",
                r"^(?:tsc|eslint|ruff|flake8|mypy|pylint|black\s+--check|prettier\s+--check|rustfmt\s+--check)(?:\s|$)",
            ),
            (
                "cargo build",
                r"^cargo\s+(?:test|build|check|clippy|fmt|nextest)(?:\s|$)",
            ),
            ("go build", r"^go\s+(?:test|build|vet|fmt)(?:\s|$)"),
            (
                "node scripts",
                r"^(?:npm\s+(?:test|ls|run\s+(?:test|lint|build|typecheck))|(?:pnpm|yarn)\s+(?:test|lint|build)|npx\s+(?:jest|vitest|tsc|eslint))(?:\s|$)",
            ),
            (
                "jvm build",
                r"^(?:mvn\s+(?:test|verify|compile)|(?:gradle|\./gradlew)\s+(?:test|build|check))(?:\s|$)",
            ),
            ("make target", r"^make(?:\s+(?:test|check|build|lint))?$"),
            ("dotnet build", r"^dotnet\s+(?:test|build)(?:\s|$)"),
        ],
    )
});

static SEGMENT_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:&&|\|\||;|\||\n)\s*").unwrap());
static ENV_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*=\S*\s+)+").unwrap());
static HARMLESS_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d?>&\d|\d?>\s*/dev/null").unwrap());

/// First hard block rule that matches, if any.
pub fn hard_block(command: &str) -> Option<&'static str> {
    first_match(&HARD_BLOCKS, command).map(|rule| rule.name)
}

/// Tier assigned by the regex engine, with the rule name that matched.
pub fn rule_tier(command: &str) -> (CommandTier, Option<&'static str>) {
    for rules in [&*HARD_BLOCKS, &*GIT_REWRITE, &*FILE_DESTRUCTIVE, &*NETWORK] {
        if let Some(rule) = first_match(rules, command) {
            return (rule.tier, Some(rule.name));
        }
    }
    match safe_rule(command) {
        Some(name) => (CommandTier::Safe, Some(name)),
        None => (CommandTier::Unknown, None),
    }
}

/// Classify with the hard block list and regex engine only.
pub fn classify(command: &str) -> CommandClassification {
    let trimmed = command.trim();
    let (tier, matched) = rule_tier(trimmed);
    let source = if tier == CommandTier::Blocked {
        DecisionSource::HardBlockList
    } else {
        DecisionSource::RuleEngine
    };
    let reasoning = match (tier, matched) {
        (CommandTier::Unknown, _) => "not on the allow-list; blocked by default".to_string(),
        (_, Some(name)) => format!("matched {name}"),
        (_, None) => String::new(),
    };
    CommandClassification {
        command: trimmed.to_string(),
        tier,
        policy: policy_for(tier),
        matched_pattern: matched.map(str::to_string),
        reasoning,
        source,
    }
}

/// A compound command is safe only when every segment is on the allow-list.
/// Command substitution and file-writing redirects are never safe.
fn safe_rule(command: &str) -> Option<&'static str> {
    if command.contains("$(") || command.contains('`') {
        return None;
    }
    if HARMLESS_REDIRECT.replace_all(command, "").contains('>') {
        return None;
    }
    let mut last = None;
    for segment in SEGMENT_SPLIT.split(command) {
        let segment = ENV_PREFIX.replace(segment.trim(), "");
        if segment.is_empty() {
            continue;
        }
        let rule = first_match(&SAFE, &segment)?;
        last = Some(rule.name);
    }
    last
}

fn first_match<'a>(rules: &'a [Rule], command: &str) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.pattern.is_match(command))
}
