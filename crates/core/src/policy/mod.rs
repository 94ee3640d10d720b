//! # Command Policy
//!
//! Decides whether a raw command line may run in a workspace. Policies are
//! plain data built once ([`CommandPolicy`]); [`CommandValidator::validate`]
//! is a pure function of the parsed argv, the policy and the workspace root.
//!
//! Checks run in a fixed order and the first denial wins:
//! 1. shell-lex the command
//! 2. deny-list on the base command
//! 3. allow-list, or a relative executable inside the workspace
//! 4. ecosystem rules for package managers and build tools
//! 5. dangerous patterns over the raw string
//! 6. every path-looking argument must resolve inside the workspace

pub mod ecosystem;
pub mod patterns;
pub mod tables;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PolicyOverrides;
use crate::errors::{SandboxError, SandboxResult};
use crate::path_security::{PathValidator, DEFAULT_FORBIDDEN_PATHS};
use ecosystem::EcosystemContext;
use patterns::DangerousPattern;

/// Outcome of validating one command. Deny always wins over allow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: String,
}

impl ValidationVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "command allowed".to_string(),
        }
    }

    pub fn deny<S: Into<String>>(reason: S) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Allow/deny tables, ecosystem switches and patterns.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
    patterns: Vec<DangerousPattern>,
    forbidden_paths: Vec<String>,
    require_ignore_scripts: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allow: tables::DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect(),
            deny: tables::DEFAULT_DENY.iter().map(|s| s.to_string()).collect(),
            patterns: patterns::builtin(),
            forbidden_paths: DEFAULT_FORBIDDEN_PATHS.iter().map(|s| s.to_string()).collect(),
            require_ignore_scripts: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicyOverrides,
}

impl CommandPolicy {
    /// Built-in tables extended by `overrides`.
    pub fn from_overrides(overrides: &PolicyOverrides) -> SandboxResult<Self> {
        let mut policy = Self::default();
        policy.apply(overrides)?;
        Ok(policy)
    }

    /// Load a TOML file carrying a `[policy]` table.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> SandboxResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| SandboxError::io(path.to_path_buf(), "read policy file", e))?;
        let file: PolicyFile = toml::from_str(&contents).map_err(|e| SandboxError::Config {
            message: format!("invalid policy file {}: {}", path.display(), e),
        })?;
        Self::from_overrides(&file.policy)
    }

    pub fn apply(&mut self, overrides: &PolicyOverrides) -> SandboxResult<()> {
        self.allow.extend(overrides.allow.iter().map(|s| s.trim().to_string()));
        self.deny.extend(overrides.deny.iter().map(|s| s.trim().to_string()));
        self.patterns
            .extend(patterns::compile_extra(&overrides.extra_patterns)?);
        self.forbidden_paths
            .extend(overrides.forbidden_paths.iter().cloned());
        if let Some(flag) = overrides.require_ignore_scripts {
            self.require_ignore_scripts = flag;
        }
        Ok(())
    }

    pub fn is_denied(&self, base: &str) -> bool {
        self.deny.contains(base)
    }

    pub fn is_allowed(&self, base: &str) -> bool {
        self.allow.contains(base) && !self.is_denied(base)
    }

    pub fn forbidden_paths(&self) -> &[String] {
        &self.forbidden_paths
    }

    pub fn require_ignore_scripts(&self) -> bool {
        self.require_ignore_scripts
    }
}

/// Caller-controlled knobs attached to a validated command.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub timeout_secs: u64,
    /// Working directory relative to the workspace root
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub capture_output: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout_secs: crate::config::DEFAULT_TIMEOUT_SECS,
            cwd: None,
            env: BTreeMap::new(),
            capture_output: true,
        }
    }
}

/// A command that passed validation. Only the validator and the script
/// stager construct these.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    raw: String,
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    timeout_secs: u64,
    env_overrides: BTreeMap<String, String>,
    capture_output: bool,
}

impl CommandSpec {
    /// Command for an argv the sandbox built itself, e.g. script run steps.
    pub(crate) fn trusted(argv: Vec<String>, cwd: Option<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            raw: shell_words::join(&argv),
            argv,
            cwd,
            timeout_secs,
            env_overrides: BTreeMap::new(),
            capture_output: true,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Resolved absolute working directory, if one was requested.
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env_overrides
    }

    pub fn capture_output(&self) -> bool {
        self.capture_output
    }
}

static SCP_LIKE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9._-]+:").ok());

#[derive(Debug, Clone)]
pub struct CommandValidator {
    policy: Arc<CommandPolicy>,
    paths: PathValidator,
}

impl CommandValidator {
    pub fn new(policy: Arc<CommandPolicy>) -> Self {
        let paths = PathValidator::new(policy.forbidden_paths().iter().cloned());
        Self { policy, paths }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn path_validator(&self) -> &PathValidator {
        &self.paths
    }

    /// Verdict for `raw` in the workspace rooted at `root`.
    pub fn validate(&self, raw: &str, root: &Path) -> ValidationVerdict {
        match self.analyze(raw, root, root) {
            Ok(_) => ValidationVerdict::allow(),
            Err(reason) => ValidationVerdict::deny(reason),
        }
    }

    /// Validate and bind options, producing an immutable [`CommandSpec`].
    pub fn prepare(
        &self,
        raw: &str,
        root: &Path,
        options: CommandOptions,
    ) -> SandboxResult<CommandSpec> {
        let cwd = match options.cwd.as_deref() {
            Some(dir) if !dir.is_empty() => Some(self.paths.resolve(root, dir)?),
            _ => None,
        };

        // Relative arguments are opened by the child from its own cwd.
        let base = cwd.as_deref().unwrap_or(root);
        let argv = self.analyze(raw, root, base).map_err(|reason| {
            warn!(target: "warden", "command denied | reason={} command={:?}", reason, raw);
            SandboxError::security(reason)
        })?;

        debug!("command approved: {:?}", argv);
        Ok(CommandSpec {
            raw: raw.to_string(),
            argv,
            cwd,
            timeout_secs: options.timeout_secs,
            env_overrides: options.env,
            capture_output: options.capture_output,
        })
    }

    fn analyze(&self, raw: &str, root: &Path, cwd_base: &Path) -> Result<Vec<String>, String> {
        let argv =
            shell_words::split(raw).map_err(|err| format!("malformed command: {}", err))?;
        let Some(program) = argv.first() else {
            return Err("empty command".to_string());
        };

        let base = base_command(program);
        if base.is_empty() {
            return Err("empty command".to_string());
        }
        if self.policy.is_denied(base) {
            return Err(format!("command '{}' is forbidden", base));
        }

        if program.contains('/') || program.contains('\\') {
            if Path::new(program).is_absolute() {
                return Err(format!(
                    "absolute executable path '{}' is not allowed",
                    program
                ));
            }
            // The runner launches these from the root, whatever the cwd.
            self.paths
                .resolve(root, program)
                .map_err(|err| format!("executable '{}' rejected: {}", program, reason_of(err)))?;
        } else if !self.policy.is_allowed(base) {
            return Err(format!("command '{}' is not in the allow-list", base));
        }

        if let Some(reason) = self.check_ecosystem(base, &argv[1..]) {
            return Err(reason);
        }

        if let Some(pattern) = patterns::scan(&self.policy.patterns, raw) {
            return Err(format!("dangerous pattern detected: {}", pattern.reason));
        }

        for arg in &argv[1..] {
            let Some(candidate) = path_operand(arg) else {
                continue;
            };
            if candidate.starts_with('~') {
                return Err(format!(
                    "argument '{}' refers to a home directory outside the workspace",
                    arg
                ));
            }
            if let Err(err) = self.check_path(root, cwd_base, candidate) {
                return Err(format!("argument '{}' rejected: {}", arg, reason_of(err)));
            }
        }

        Ok(argv)
    }

    fn check_path(&self, root: &Path, base: &Path, candidate: &str) -> SandboxResult<PathBuf> {
        let candidate = Path::new(candidate);
        if candidate.is_relative() && base != root {
            self.paths.resolve(root, base.join(candidate))
        } else {
            self.paths.resolve(root, candidate)
        }
    }

    fn check_ecosystem(&self, base: &str, args: &[String]) -> Option<String> {
        let ctx = EcosystemContext {
            require_ignore_scripts: self.policy.require_ignore_scripts,
        };

        // `python -m pip ...` is pip.
        if matches!(base, "python" | "python3")
            && args.first().map(String::as_str) == Some("-m")
            && matches!(args.get(1).map(String::as_str), Some("pip" | "pip3"))
        {
            return ecosystem::rule_for("pip").and_then(|rule| rule.check(&args[2..], ctx));
        }

        ecosystem::rule_for(base).and_then(|rule| rule.check(args, ctx))
    }
}

/// `/usr/bin/python3` -> `python3`, `tool.exe` -> `tool`.
fn base_command(program: &str) -> &str {
    let base = program.rsplit(['/', '\\']).next().unwrap_or(program);
    base.strip_suffix(".exe").unwrap_or(base)
}

/// The part of `arg` that may name a file: the whole word, the value of
/// `--flag=value`, or a value glued to a short flag as in `-o/tmp/out`.
fn path_operand(arg: &str) -> Option<&str> {
    let candidate = if let Some(long) = arg.strip_prefix("--") {
        long.split_once('=').map(|(_, value)| value)?
    } else if let Some(short) = arg.strip_prefix('-') {
        match short.split_once('=') {
            Some((_, value)) => value,
            None => short.get(1..).filter(|value| !value.is_empty())?,
        }
    } else {
        arg
    };
    looks_like_path(candidate).then_some(candidate)
}

fn looks_like_path(arg: &str) -> bool {
    if arg.contains("://") {
        return false;
    }
    if SCP_LIKE.as_ref().is_some_and(|re| re.is_match(arg)) {
        return false;
    }
    arg.contains('/') || arg.contains('\\') || arg.starts_with('.') || arg.starts_with('~')
}

fn reason_of(err: SandboxError) -> String {
    match err {
        SandboxError::Security { reason } => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validator() -> CommandValidator {
        CommandValidator::new(Arc::new(CommandPolicy::default()))
    }

    #[test]
    fn plain_commands_are_allowed() {
        let root = TempDir::new().unwrap();
        let v = validator();
        for raw in [
            "echo hello",
            "git status",
            "ls -la src",
            "python3 -m pytest -q tests",
            "npm install --ignore-scripts",
            "git clone https://github.com/example/repo.git .",
            "git clone git@github.com:example/repo.git .",
        ] {
            let verdict = v.validate(raw, root.path());
            assert!(verdict.allowed, "{raw}: {}", verdict.reason);
        }
    }

    #[test]
    fn deny_list_names_the_command() {
        let root = TempDir::new().unwrap();
        let verdict = validator().validate("rm -rf /", root.path());
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, "command 'rm' is forbidden");
    }

    #[test]
    fn deny_list_beats_allow_list() {
        let root = TempDir::new().unwrap();
        let overrides = PolicyOverrides {
            allow: vec!["rm".into(), "curl".into()],
            ..PolicyOverrides::default()
        };
        let v = CommandValidator::new(Arc::new(
            CommandPolicy::from_overrides(&overrides).unwrap(),
        ));
        assert!(!v.validate("rm file.txt", root.path()).allowed);
        assert!(!v.validate("curl http://example.com", root.path()).allowed);
        // Full paths do not dodge the deny-list.
        assert!(!v.validate("/bin/rm x", root.path()).allowed);
    }

    #[test]
    fn unknown_commands_are_denied() {
        let root = TempDir::new().unwrap();
        let verdict = validator().validate("nmap localhost", root.path());
        assert!(verdict.reason.contains("allow-list"));
    }

    #[test]
    fn malformed_quoting_and_empty_input_are_denied() {
        let root = TempDir::new().unwrap();
        let v = validator();
        assert!(v.validate("echo 'unterminated", root.path()).reason.contains("malformed"));
        assert!(v.validate("   ", root.path()).reason.contains("empty"));
    }

    #[test]
    fn workspace_executables() {
        let root = TempDir::new().unwrap();
        let v = validator();
        assert!(v.validate("./run_tests --fast", root.path()).allowed);
        assert!(!v.validate("../outside/tool", root.path()).allowed);
        assert!(!v.validate("/opt/tool", root.path()).allowed);
    }

    #[test]
    fn path_arguments_must_stay_inside() {
        let root = TempDir::new().unwrap();
        let v = validator();
        assert!(v.validate("cat src/main.rs", root.path()).allowed);
        assert!(!v.validate("cat ../../etc/passwd", root.path()).allowed);
        assert!(!v.validate("cat /etc/passwd", root.path()).allowed);
        assert!(!v.validate("cp a.txt --target-directory=/tmp", root.path()).allowed);
        assert!(!v.validate("ls ~/.ssh", root.path()).allowed);
    }

    #[test]
    fn glued_short_flag_values_are_checked() {
        let root = TempDir::new().unwrap();
        let v = validator();
        assert!(!v.validate("gcc x.c -o/tmp/evil", root.path()).allowed);
        assert!(!v.validate("make -C../..", root.path()).allowed);
        assert!(v.validate("gcc x.c -obuild/x", root.path()).allowed);
        assert!(v.validate("ls -la", root.path()).allowed);
    }

    #[cfg(unix)]
    #[test]
    fn dotdot_after_a_symlink_is_resolved_at_the_target() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::create_dir(outside.path().join("inner")).unwrap();
        std::fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("inner"), root.path().join("link"))
            .unwrap();

        let verdict = validator().validate("cat link/../secret.txt", root.path());
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("link/../secret.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn arguments_resolve_from_the_requested_cwd() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("sub/data")).unwrap();
        let v = validator();

        let options = || CommandOptions {
            cwd: Some("sub".into()),
            ..CommandOptions::default()
        };
        let err = v
            .prepare("cat data/secret.txt", root.path(), options())
            .unwrap_err();
        assert!(err.is_security());
        assert!(v.prepare("cat notes.txt", root.path(), options()).is_ok());
    }

    #[test]
    fn pip_through_python_module_is_checked() {
        let root = TempDir::new().unwrap();
        let verdict = validator().validate(
            "python3 -m pip install git+https://example.com/x.git",
            root.path(),
        );
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("VCS"));
    }

    #[test]
    fn dangerous_patterns_are_reported() {
        let root = TempDir::new().unwrap();
        let verdict = validator().validate("echo $(id)", root.path());
        assert!(verdict.reason.contains("command substitution"));
    }

    #[test]
    fn prepare_resolves_cwd_and_rejects_escapes() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("src")).unwrap();
        let v = validator();

        let spec = v
            .prepare(
                "ls",
                root.path(),
                CommandOptions {
                    cwd: Some("src".into()),
                    ..CommandOptions::default()
                },
            )
            .unwrap();
        assert_eq!(spec.argv(), ["ls".to_string()]);
        assert!(spec.cwd().unwrap().ends_with("src"));

        let err = v
            .prepare(
                "ls",
                root.path(),
                CommandOptions {
                    cwd: Some("../..".into()),
                    ..CommandOptions::default()
                },
            )
            .unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn policy_file_extends_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(
            &path,
            "[policy]\nallow = [\"terraform\"]\nextra_patterns = [\"--force-push\"]\n",
        )
        .unwrap();
        let policy = CommandPolicy::load_toml(&path).unwrap();
        assert!(policy.is_allowed("terraform"));
        assert!(policy.is_allowed("git"));

        let v = CommandValidator::new(Arc::new(policy));
        let verdict = v.validate("terraform plan --force-push", dir.path());
        assert!(verdict.reason.contains("--force-push"));
    }
}
