//! Raw command-line scanning for constructs that are dangerous no matter
//! which binary they are attached to.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{SandboxError, SandboxResult};

/// A compiled pattern and the reason reported when it matches.
#[derive(Debug, Clone)]
pub struct DangerousPattern {
    pub regex: Regex,
    pub reason: String,
}

const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (
        r">\s*/dev/(sd|hd|nvme|xvd|vd|mmcblk|disk|mem|kmem|port)",
        "write to a device file",
    ),
    (r"\|\s*(sudo\s+)?(ba|z|k|da|c|tc)?sh\b", "pipe into a shell"),
    (r"(^|[\s;&|])eval(\s|$)", "use of eval"),
    (r"\$\(", "command substitution"),
    (r"`", "backtick command substitution"),
    (r"(;|&&|\|\||\|)\s*rm\b", "chained destructive command"),
    (r"\bsudo\b", "privilege escalation (sudo)"),
    (r"(^|[\s;&|])su(\s|$)", "privilege escalation (su)"),
    (r"\bdoas\b", "privilege escalation (doas)"),
    (r"chmod\s+[ugoa]*\+[rwxXt]*s", "setuid/setgid bit"),
    (r"chmod\s+[2467][0-7]{3}\b", "setuid/setgid bit"),
    (r"--privileged", "privileged mode flag"),
    (r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:", "fork bomb"),
];

static BUILTIN: Lazy<Vec<DangerousPattern>> = Lazy::new(|| {
    BUILTIN_PATTERNS
        .iter()
        .filter_map(|(pattern, reason)| {
            // Patterns are literals; a failure here is a bug caught by tests.
            Regex::new(pattern).ok().map(|regex| DangerousPattern {
                regex,
                reason: (*reason).to_string(),
            })
        })
        .collect()
});

pub fn builtin() -> Vec<DangerousPattern> {
    BUILTIN.clone()
}

/// Compile operator-supplied patterns. An invalid pattern is a config error.
pub fn compile_extra(patterns: &[String]) -> SandboxResult<Vec<DangerousPattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map(|regex| DangerousPattern {
                    regex,
                    reason: format!("matches blocked pattern '{}'", pattern),
                })
                .map_err(|err| SandboxError::Config {
                    message: format!("invalid policy pattern '{}': {}", pattern, err),
                })
        })
        .collect()
}

/// First pattern matching `raw`, if any.
pub fn scan<'a>(patterns: &'a [DangerousPattern], raw: &str) -> Option<&'a DangerousPattern> {
    patterns.iter().find(|p| p.regex.is_match(raw))
}
