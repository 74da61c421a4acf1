//! Stable exit codes for keel CLI commands.

/// Command succeeded; for `classify`, the command may run.
pub const OK: i32 = 0;
/// Invalid arguments, config, policy, or any other error.
pub const INVALID: i32 = 1;
/// `keel classify`: the command is blocked.
pub const BLOCKED: i32 = 3;
/// `keel classify`: the command needs a human approval first.
pub const NEEDS_APPROVAL: i32 = 4;
/// `keel envelope`: the plan touches more files than the scope cap allows.
pub const SCOPE_EXCEEDED: i32 = 5;
/// `keel audit-verify` / `keel replay-diff`: chain broken or logs diverge.
pub const INTEGRITY: i32 = 6;
