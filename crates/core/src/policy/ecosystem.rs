//! Per-tool rules for package managers and build tools.
//!
//! Each rule is data: which subcommands are allowed, which are refused
//! outright, and which options are never acceptable. A few tools need one
//! extra check that does not fit a table; those hang off `extra`.

/// Options applied by [`EcosystemRule::check`].
#[derive(Debug, Clone, Copy)]
pub struct EcosystemContext {
    pub require_ignore_scripts: bool,
}

type ExtraCheck = fn(subcommand: Option<&str>, args: &[String], ctx: EcosystemContext) -> Option<String>;

#[derive(Clone, Copy)]
pub struct EcosystemRule {
    pub name: &'static str,
    pub tools: &'static [&'static str],
    /// `None` means the tool takes no subcommand (positionals are files).
    pub allowed_subcommands: Option<&'static [&'static str]>,
    pub denied_subcommands: &'static [&'static str],
    /// Refused when an argument equals the option or starts with `option=`.
    pub dangerous_options: &'static [&'static str],
    /// Refused when any argument contains the fragment.
    pub dangerous_fragments: &'static [&'static str],
    /// Global options whose value is the next argument.
    pub value_flags: &'static [&'static str],
    /// Subcommand assumed when none is given.
    pub bare_subcommand: Option<&'static str>,
    pub extra: Option<ExtraCheck>,
}

const INSTALL_SUBCOMMANDS: &[&str] = &["install", "i", "ci", "add"];

pub const RULES: &[EcosystemRule] = &[
    EcosystemRule {
        name: "git",
        tools: &["git"],
        allowed_subcommands: Some(&[
            "status", "log", "diff", "show", "add", "commit", "checkout", "switch", "branch",
            "merge", "rebase", "pull", "fetch", "clone", "init", "stash", "tag", "reset",
            "restore", "rm", "mv", "remote", "rev-parse", "ls-files", "blame", "config",
            "cherry-pick", "revert", "describe", "shortlog", "grep", "apply",
        ]),
        denied_subcommands: &["daemon", "instaweb", "filter-branch", "submodule"],
        dangerous_options: &["--upload-pack", "--receive-pack", "--exec", "--git-dir", "--work-tree"],
        dangerous_fragments: &[
            "core.sshCommand",
            "core.hooksPath",
            "core.fsmonitor",
            "core.gitProxy",
            "core.editor",
            "core.pager",
            "credential.helper",
            "alias.",
            "filter.",
            "ext::",
        ],
        value_flags: &["-c", "-C"],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "npm",
        tools: &["npm"],
        allowed_subcommands: Some(&[
            "install", "i", "ci", "test", "t", "run", "run-script", "start", "build", "ls",
            "list", "audit", "outdated", "init", "version", "view", "pack", "uninstall",
            "update",
        ]),
        denied_subcommands: &["publish", "adduser", "login", "exec", "link", "config"],
        dangerous_options: &[
            "--registry",
            "--proxy",
            "--https-proxy",
            "--unsafe-perm",
            "--global",
            "-g",
            "--prefix",
            "--userconfig",
            "--globalconfig",
            "--script-shell",
            "--node-options",
        ],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: Some(require_ignore_scripts),
    },
    EcosystemRule {
        name: "npx",
        tools: &["npx"],
        allowed_subcommands: Some(&[
            "tsc", "eslint", "prettier", "jest", "ts-node", "vitest", "mocha", "tsx",
        ]),
        denied_subcommands: &[],
        dangerous_options: &["--registry", "--package", "-p", "--call", "-c", "--node-options"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "yarn",
        tools: &["yarn"],
        allowed_subcommands: Some(&[
            "install", "add", "remove", "test", "run", "build", "list", "info", "audit", "why",
            "upgrade",
        ]),
        denied_subcommands: &["publish", "login", "global", "dlx", "exec", "config"],
        dangerous_options: &["--registry", "--proxy", "--https-proxy", "--global-folder", "--prefix"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: Some("install"),
        extra: Some(require_ignore_scripts),
    },
    EcosystemRule {
        name: "pnpm",
        tools: &["pnpm"],
        allowed_subcommands: Some(&[
            "install", "i", "add", "remove", "test", "run", "build", "list", "ls", "audit",
            "why", "update",
        ]),
        denied_subcommands: &["publish", "login", "dlx", "exec", "config", "setup"],
        dangerous_options: &["--registry", "--proxy", "--https-proxy", "--global", "-g", "--prefix"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: Some(require_ignore_scripts),
    },
    EcosystemRule {
        name: "pip",
        tools: &["pip", "pip3"],
        allowed_subcommands: Some(&[
            "install", "uninstall", "list", "show", "freeze", "check", "download",
        ]),
        denied_subcommands: &["config"],
        dangerous_options: &[
            "--index-url",
            "-i",
            "--extra-index-url",
            "--trusted-host",
            "--proxy",
            "--target",
            "-t",
            "--prefix",
            "--root",
            "--src",
            "--global-option",
            "--install-option",
        ],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: Some(deny_remote_pip_requirements),
    },
    EcosystemRule {
        name: "cargo",
        tools: &["cargo"],
        allowed_subcommands: Some(&[
            "build", "check", "test", "run", "fmt", "clippy", "doc", "fetch", "tree", "metadata",
            "bench", "clean", "update", "new", "init", "add", "remove", "generate-lockfile",
        ]),
        // `install` builds and places arbitrary code outside the workspace.
        denied_subcommands: &["install", "uninstall", "publish", "login", "logout", "owner", "yank"],
        dangerous_options: &["--config", "-Z", "--registry", "--index"],
        dangerous_fragments: &[],
        value_flags: &["--color"],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "go",
        tools: &["go"],
        allowed_subcommands: Some(&[
            "build", "test", "run", "vet", "fmt", "mod", "get", "list", "version", "env", "doc",
            "clean",
        ]),
        denied_subcommands: &["generate", "tool", "install"],
        dangerous_options: &["-toolexec", "-exec", "-overlay", "-modfile"],
        dangerous_fragments: &["GOPROXY=", "GOFLAGS="],
        value_flags: &[],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "maven",
        tools: &["mvn", "mvnw"],
        allowed_subcommands: Some(&[
            "clean", "compile", "test", "package", "verify", "install", "validate",
            "test-compile", "dependency:tree", "dependency:resolve", "dependency:go-offline",
        ]),
        denied_subcommands: &["deploy", "release:perform"],
        dangerous_options: &["-s", "--settings", "-gs", "--global-settings"],
        dangerous_fragments: &["exec:", "antrun:", "-DaltDeploymentRepository", "maven.repo.remote"],
        value_flags: &["-f", "--file", "-P", "-pl"],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "gradle",
        tools: &["gradle", "gradlew"],
        allowed_subcommands: Some(&[
            "build", "test", "clean", "assemble", "check", "dependencies", "tasks", "run",
            "compileJava", "jar", "classes",
        ]),
        denied_subcommands: &["publish", "wrapper"],
        dangerous_options: &["--init-script", "-I", "--project-cache-dir", "--gradle-user-home", "-g"],
        dangerous_fragments: &[],
        value_flags: &["-p", "--project-dir", "-x", "--exclude-task"],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "dotnet",
        tools: &["dotnet"],
        allowed_subcommands: Some(&[
            "build", "test", "run", "restore", "clean", "format", "new", "list", "pack",
        ]),
        denied_subcommands: &["nuget", "tool", "workload", "publish"],
        dangerous_options: &["--source", "-s", "--configfile"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "tsc",
        tools: &["tsc"],
        allowed_subcommands: None,
        denied_subcommands: &[],
        dangerous_options: &["--generateTrace", "--plugins"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: None,
    },
    // -exec and friends would run anything, deny list or not.
    EcosystemRule {
        name: "find",
        tools: &["find"],
        allowed_subcommands: None,
        denied_subcommands: &[],
        dangerous_options: &[
            "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf",
            "-fls",
        ],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: None,
    },
    EcosystemRule {
        name: "eslint",
        tools: &["eslint"],
        allowed_subcommands: None,
        denied_subcommands: &[],
        dangerous_options: &["--resolve-plugins-relative-to"],
        dangerous_fragments: &[],
        value_flags: &[],
        bare_subcommand: None,
        extra: Some(deny_rulesdir_escape),
    },
];

pub fn rule_for(tool: &str) -> Option<&'static EcosystemRule> {
    RULES.iter().find(|rule| rule.tools.contains(&tool))
}

impl EcosystemRule {
    /// Check the arguments following the tool name. `Some(reason)` denies.
    pub fn check(&self, args: &[String], ctx: EcosystemContext) -> Option<String> {
        for arg in args {
            if let Some(option) = self.dangerous_options.iter().find(|opt| {
                arg == *opt || arg.strip_prefix(*opt).is_some_and(|rest| rest.starts_with('='))
            }) {
                return Some(format!("{} option '{}' is not allowed", self.name, option));
            }
            if let Some(fragment) = self.dangerous_fragments.iter().find(|f| arg.contains(*f)) {
                return Some(format!(
                    "{} argument containing '{}' is not allowed",
                    self.name, fragment
                ));
            }
        }

        let subcommand = self.subcommand(args);
        if let (Some(allowed), Some(sub)) = (self.allowed_subcommands, subcommand) {
            if self.denied_subcommands.contains(&sub) {
                return Some(format!("{} subcommand '{}' is forbidden", self.name, sub));
            }
            if !allowed.contains(&sub) {
                return Some(format!("{} subcommand '{}' is not allowed", self.name, sub));
            }
        }

        self.extra.and_then(|extra| extra(subcommand, args, ctx))
    }

    /// First positional argument, skipping global flags and their values.
    pub fn subcommand<'a>(&self, args: &'a [String]) -> Option<&'a str> {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if self.value_flags.contains(&arg.as_str()) {
                iter.next();
                continue;
            }
            // rustup-style toolchain selector, e.g. `cargo +nightly build`
            if arg.starts_with('-') || arg.starts_with('+') {
                continue;
            }
            return Some(arg.as_str());
        }
        self.bare_subcommand
    }
}

fn require_ignore_scripts(
    subcommand: Option<&str>,
    args: &[String],
    ctx: EcosystemContext,
) -> Option<String> {
    let Some(sub) = subcommand else {
        return None;
    };
    if !ctx.require_ignore_scripts || !INSTALL_SUBCOMMANDS.contains(&sub) {
        return None;
    }
    if args.iter().any(|arg| arg == "--ignore-scripts") {
        return None;
    }
    Some(format!(
        "'{}' must be run with --ignore-scripts to suppress lifecycle scripts",
        sub
    ))
}

const VCS_PREFIXES: &[&str] = &["git+", "hg+", "svn+", "bzr+"];

fn deny_remote_pip_requirements(
    subcommand: Option<&str>,
    args: &[String],
    _ctx: EcosystemContext,
) -> Option<String> {
    if !matches!(subcommand, Some("install") | Some("download")) {
        return None;
    }
    args.iter()
        .find(|arg| arg.contains("://") || VCS_PREFIXES.iter().any(|p| arg.starts_with(p)))
        .map(|arg| format!("pip install from URL or VCS source '{}' is not allowed", arg))
}

fn deny_rulesdir_escape(
    _subcommand: Option<&str>,
    args: &[String],
    _ctx: EcosystemContext,
) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let value = if arg == "--rulesdir" {
            iter.next().map(String::as_str)
        } else {
            arg.strip_prefix("--rulesdir=")
        };
        if value.is_some_and(|v| v.contains("..")) {
            return Some("eslint --rulesdir must stay inside the workspace".to_string());
        }
    }
    None
}
