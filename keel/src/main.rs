//! `keel` command line: inspect and exercise the governance kernel.
//!
//! Each subcommand wraps one kernel component so it can be scripted from a
//! shell or a CI job. Exit codes are listed in [`keel::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use keel::controller::{CommandDecision, Controller, ControllerConfig, IntentDecision, Transition};
use keel::core::approvals::ApproverRole;
use keel::core::envelope::{EnvelopeInputs, PlanEnvelope};
use keel::core::gate::CommandGate;
use keel::core::replay::ReplayLog;
use keel::core::types::{AgentState, IntentResult, TaskIntent};
use keel::core::verification::{VerificationPipeline, VerifyTier};
use keel::exit_codes;
use keel::io::approval_request::ApprovalRequest;
use keel::io::audit_log::{AuditLog, read_records, verify_chain};
use keel::io::config::{CONFIG_PATH, KernelConfig, load_repo_config, write_config};
use keel::io::git::Git;
use keel::io::policy::load_repo_policy;
use keel::io::probe::{FsProbe, LockfileHasher, ToolchainProbe};
use keel::io::test_runner::CommandTierRunner;
use keel::logging;

#[derive(Parser)]
#[command(
    name = "keel",
    version,
    about = "Governance kernel for autonomous code-modification agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.keel/config.toml` with default limits if missing.
    Init {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Classify a shell command and report whether it may run.
    Classify {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Record a human approval for this command before classifying.
        #[arg(long, value_parser = parse_role)]
        approve_as: Option<ApproverRole>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Compute the plan envelope for a task and a set of planned files.
    Envelope {
        #[arg(long)]
        task: String,
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Repository summary folded into the input snapshot hash.
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Check the hash chain of an audit log file.
    AuditVerify { log: PathBuf },
    /// Compare two replay logs and print the first divergence.
    ReplayDiff { expected: PathBuf, actual: PathBuf },
    /// Drive a controller through states and print what the tables allow.
    DryRun {
        #[arg(long, value_parser = parse_intent)]
        intent: TaskIntent,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(required = true, value_parser = parse_state)]
        states: Vec<AgentState>,
    },
    /// Validate `.keel/policy.json` against the schema.
    PolicyCheck {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Run the configured verification tiers once.
    Verify {
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

fn parse_role(raw: &str) -> Result<ApproverRole, String> {
    ApproverRole::parse(raw).ok_or_else(|| format!("unknown role '{raw}'"))
}

fn parse_intent(raw: &str) -> Result<TaskIntent, String> {
    TaskIntent::parse(raw).ok_or_else(|| format!("unknown intent '{raw}'"))
}

fn parse_state(raw: &str) -> Result<AgentState, String> {
    AgentState::parse(raw).ok_or_else(|| format!("unknown state '{raw}'"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { root, force } => cmd_init(&root, force),
        Command::Classify {
            root,
            approve_as,
            command,
        } => cmd_classify(&root, approve_as, &command.join(" ")),
        Command::Envelope {
            task,
            files,
            root,
            summary,
        } => cmd_envelope(&root, task, summary, files),
        Command::AuditVerify { log } => cmd_audit_verify(&log),
        Command::ReplayDiff { expected, actual } => cmd_replay_diff(&expected, &actual),
        Command::DryRun {
            intent,
            root,
            states,
        } => cmd_dry_run(&root, intent, &states),
        Command::PolicyCheck { root } => cmd_policy_check(&root),
        Command::Verify { root } => cmd_verify(&root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = root.join(CONFIG_PATH);
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &KernelConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Session id for audit records written by one-shot CLI commands.
const CLI_SESSION: &str = "cli";

fn cmd_classify(root: &Path, approve_as: Option<ApproverRole>, command: &str) -> Result<i32> {
    let config = load_repo_config(root)?;
    let policy = load_repo_policy(root)?;
    let audit = AuditLog::create(&root.join(&config.audit.dir), CLI_SESSION)?;
    let mut controller = Controller::new(
        ControllerConfig::from(&config),
        Box::new(FsProbe::new(root)),
        audit,
    );
    let mut gate = CommandGate::new(policy, config.gate);
    if let Some(role) = approve_as {
        controller.approve_command(&mut gate, command, role);
    }
    Ok(match controller.check_command(&mut gate, command) {
        CommandDecision::Run(classification) => {
            print_json(&classification.redacted())?;
            exit_codes::OK
        }
        CommandDecision::NeedsApproval(classification) => {
            print_json(&classification.redacted())?;
            let request = ApprovalRequest::for_command(&classification, gate.required_role());
            eprintln!("{}", request.render()?);
            exit_codes::NEEDS_APPROVAL
        }
        CommandDecision::Blocked(classification) => {
            print_json(&classification.redacted())?;
            exit_codes::BLOCKED
        }
        CommandDecision::Halted(transition) => {
            if let Transition::FailSafe { reason, .. } = transition {
                eprintln!("{reason}");
            }
            exit_codes::INVALID
        }
    })
}

fn cmd_envelope(root: &Path, task: String, summary: String, files: Vec<String>) -> Result<i32> {
    let config = load_repo_config(root)?;
    let probe = FsProbe::new(root).with_lockfiles(config.envelope.lockfiles.clone());
    let git = Git::new(root);
    let base_tree = if git.is_repo() {
        git.head_tree().unwrap_or_default()
    } else {
        String::new()
    };
    let envelope = PlanEnvelope::create(EnvelopeInputs {
        task,
        repo_summary: summary,
        base_tree,
        toolchain: probe.toolchain()?,
        planned_files: files,
        lockfile_hash: probe.lockfile_hash()?,
    })
    .context("build envelope")?;
    print_json(&envelope)?;
    if let Err(violation) = envelope.check_scope_cap(config.envelope.max_file_cap) {
        eprintln!("{violation}");
        return Ok(exit_codes::SCOPE_EXCEEDED);
    }
    Ok(exit_codes::OK)
}

fn cmd_audit_verify(log: &Path) -> Result<i32> {
    let records = read_records(log)?;
    match verify_chain(&records) {
        Ok(()) => {
            println!("ok: {} record(s), chain intact", records.len());
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{}: {err}", log.display());
            Ok(exit_codes::INTEGRITY)
        }
    }
}

fn read_replay(path: &Path) -> Result<ReplayLog> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    ReplayLog::from_json(&raw).with_context(|| format!("parse {}", path.display()))
}

fn cmd_replay_diff(expected: &Path, actual: &Path) -> Result<i32> {
    let comparison = read_replay(expected)?.verify_against(&read_replay(actual)?);
    print_json(&comparison)?;
    Ok(if comparison.is_identical() {
        exit_codes::OK
    } else {
        exit_codes::INTEGRITY
    })
}

fn cmd_dry_run(root: &Path, intent: TaskIntent, states: &[AgentState]) -> Result<i32> {
    let config = load_repo_config(root)?;
    let mut controller = Controller::new(
        ControllerConfig::from(&config),
        Box::new(FsProbe::new(root)),
        AuditLog::in_memory("dry-run"),
    );
    for &state in states {
        if let Transition::FailSafe { terminal, reason } =
            controller.transition_to(state, "dry run")
        {
            eprintln!("{reason}; now {terminal}");
            break;
        }
        if state == AgentState::IntentAnalysis
            && let IntentDecision::Rejected { reason } =
                controller.set_intent(&IntentResult::new(intent, 1.0))
        {
            eprintln!("{reason}");
            break;
        }
    }
    for record in controller.audit().records() {
        println!(
            "{}",
            serde_json::to_string(record).context("serialize audit record")?
        );
    }
    Ok(if controller.state().is_failure() {
        exit_codes::INVALID
    } else {
        exit_codes::OK
    })
}

fn cmd_policy_check(root: &Path) -> Result<i32> {
    let policy = load_repo_policy(root)?;
    println!(
        "ok: {} allow, {} block, {} approval prefix(es)",
        policy.allow_prefixes.len(),
        policy.block_prefixes.len(),
        policy.require_approval_prefixes.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_verify(root: &Path) -> Result<i32> {
    let config = load_repo_config(root)?;
    let pipeline =
        VerificationPipeline::new(VerifyTier::ALL.to_vec(), config.verification.skip.clone());
    let mut runner = CommandTierRunner::new(root, config.verification);
    let report = pipeline.run(&mut runner);
    println!("{}", report.summary());
    if let Some(failed) = report.failed() {
        for line in &failed.errors {
            eprintln!("{line}");
        }
        return Ok(exit_codes::INVALID);
    }
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
