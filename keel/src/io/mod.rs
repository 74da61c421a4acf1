//! Side effects: filesystem, git, child processes, signals.

pub mod approval_request;
pub mod audit_log;
pub mod config;
pub mod git;
pub mod isolation;
pub mod kill_switch;
pub mod policy;
pub mod probe;
pub mod process;
pub mod test_runner;
