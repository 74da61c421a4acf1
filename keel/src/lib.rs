//! Governance kernel for an autonomous code-modification agent.
//!
//! The agent (an LLM) is treated as an untrusted actor that may run shell
//! commands and rewrite files. The kernel keeps it inside a legal lifecycle,
//! bounds what a single task may touch, gates every command, rolls back on
//! failure, and leaves a hash-chained audit trail.
//!
//! - **[`core`]**: Pure, deterministic logic (transition tables, budgets,
//!   command rules, envelopes, TDD and verification bookkeeping, replay).
//! - **[`io`]**: Side-effecting operations (git, processes, config, the audit
//!   file, the kill switch timer).
//!
//! [`controller::Controller`] ties them together; [`task::run_task`] drives a
//! whole task through it.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
