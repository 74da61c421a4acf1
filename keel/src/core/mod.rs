//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod approvals;
pub mod budget;
pub mod classifier;
pub mod determinism;
pub mod diff;
pub mod envelope;
pub mod express_lane;
pub mod fix_loop;
pub mod gate;
pub mod hashing;
pub mod merge_guard;
pub mod project_policy;
pub mod redact;
pub mod replay;
pub mod tdd;
pub mod transitions;
pub mod types;
pub mod verification;
