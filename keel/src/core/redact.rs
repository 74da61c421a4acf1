//! Secret redaction for anything that leaves the process: audit records and
//! approval requests.

use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "***REDACTED***";

/// Each pattern's `keep` group (when present) survives; the rest of the match
/// is replaced.
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"AKIA[0-9A-Z]{16}",
        r"gh[pousr]_[A-Za-z0-9]{36,}",
        r"xox[baprs]-[A-Za-z0-9-]+",
        r"sk-[A-Za-z0-9_-]{16,}",
        r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
        r"(?i)(?P<keep>\bbearer\s+)[A-Za-z0-9._~+/=-]+",
        r"(?i)(?P<keep>\b(?:basic|token)\s+)[A-Za-z0-9._~+/=-]{12,}",
        r"(?P<keep>[A-Za-z][A-Za-z0-9+.-]*://)[^\s/:@]+:[^\s/@]+@",
        r#"(?i)(?P<keep>\b[A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD|PASSWD|PWD|CREDENTIALS?)\s*[:=]\s*)(?:'[^']*'|"[^"]*"|[^\s'"]+)"#,
        r#"(?i)(?P<keep>--(?:password|token|api-key|secret)[=\s]+)(?:'[^']*'|"[^"]*"|[^\s'"]+)"#,
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Replace credentials, tokens, and key assignments with [`REDACTED`].
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        out = pattern
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                let keep = caps.name("keep").map_or("", |m| m.as_str());
                format!("{keep}{REDACTED}")
            })
            .into_owned();
    }
    out
}

pub fn contains_secret(text: &str) -> bool {
    SECRET_PATTERNS.iter().any(|pattern| pattern.is_match(text))
}
