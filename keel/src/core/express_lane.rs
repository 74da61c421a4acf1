//! Express lane: documentation-only changes may go from INTENT_ANALYSIS
//! straight to IMPLEMENTING, skipping discovery, planning, and the TDD phase.
//!
//! Eligibility is decided twice: once on the planned file list, and again on
//! every edit (no shebang or executable-bit changes sneak in through a doc).

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::envelope::normalize_path;

const DOC_EXTENSIONS: [&str; 8] = [
    "md", "txt", "rst", "adoc", "asciidoc", "mdx", "wiki", "textile",
];

const DOC_NAMES: [&str; 12] = [
    "README",
    "LICENSE",
    "CHANGELOG",
    "CONTRIBUTING",
    "AUTHORS",
    "HISTORY",
    "FAQ",
    "SECURITY",
    "CODE_OF_CONDUCT",
    ".GITIGNORE",
    ".EDITORCONFIG",
    ".PRETTIERRC",
];

const EXECUTABLE_EXTENSIONS: [&str; 11] = [
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd", "exe", "bin", "so", "dylib",
];

static CHMOD_EXEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bchmod\s+\+x\b").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressVerdict {
    pub violations: Vec<String>,
}

impl ExpressVerdict {
    pub fn qualifies(&self) -> bool {
        self.violations.is_empty()
    }
}

fn is_doc(path: &str) -> bool {
    let path = Path::new(path);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if ext.as_deref().is_some_and(|e| DOC_EXTENSIONS.contains(&e)) {
        return true;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| DOC_NAMES.contains(&name.to_ascii_uppercase().as_str()))
}

fn is_executable(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXECUTABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Check a planned file list. An empty list never qualifies.
pub fn analyze_files<S: AsRef<str>>(files: &[S]) -> ExpressVerdict {
    if files.is_empty() {
        return ExpressVerdict {
            violations: vec!["no files planned".to_string()],
        };
    }
    let violations = files
        .iter()
        .map(|f| normalize_path(f.as_ref()))
        .filter_map(|path| {
            if is_executable(&path) {
                Some(format!("executable file: {path}"))
            } else if is_doc(&path) {
                None
            } else {
                Some(format!("code file: {path}"))
            }
        })
        .collect();
    ExpressVerdict { violations }
}

/// Lines added or removed by an edit that would make a doc change executable.
pub fn analyze_change(path: &str, old: &str, new: &str) -> Vec<String> {
    let removed = old.lines().filter(|line| !new.lines().any(|l| l == *line));
    let added = new.lines().filter(|line| !old.lines().any(|l| l == *line));
    let mut violations = Vec::new();
    for line in removed.chain(added) {
        let line = line.trim();
        if line.starts_with("#!") {
            violations.push(format!("shebang change in {path}"));
        } else if CHMOD_EXEC.is_match(line) {
            violations.push(format!("executable bit change in {path}"));
        }
    }
    violations.dedup();
    violations
}
