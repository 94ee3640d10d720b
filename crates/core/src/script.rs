//! # Script Staging
//!
//! Inline script text is written to a uniquely named file inside the
//! workspace, run with the interpreter (or compiler, then binary) for its
//! declared type, and removed again when the [`StagedScript`] guard drops.
//!
//! Run steps are built from fixed argv templates and executed directly, never
//! through a shell, so they bypass the command policy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_common::fs::{SafeFileWriter, WriteMode};

use crate::errors::{SandboxError, SandboxResult};
use crate::path_security::PathValidator;
use crate::policy::CommandSpec;
use crate::runner::{ExecutionResult, ProcessRunner, RunOptions};
use crate::workspace::Workspace;

const FILE_PREFIX: &str = "warden_script";

/// Placeholders understood in step templates.
const FILE: &str = "{file}";
const BIN: &str = "{bin}";
const DIR: &str = "{dir}";

/// How one script type is staged and run.
#[derive(Debug, Clone, Copy)]
pub struct ScriptKind {
    pub names: &'static [&'static str],
    pub extension: &'static str,
    /// Run steps in order; each is an argv template.
    pub steps: &'static [&'static [&'static str]],
    /// Staged as `Main.<ext>` in its own directory.
    pub java_layout: bool,
}

pub const SCRIPT_KINDS: &[ScriptKind] = &[
    ScriptKind {
        names: &["python", "python3", "py"],
        extension: "py",
        steps: &[&["python3", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["bash"],
        extension: "sh",
        steps: &[&["bash", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["sh", "shell"],
        extension: "sh",
        steps: &[&["sh", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["javascript", "js", "node"],
        extension: "js",
        steps: &[&["node", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["typescript", "ts"],
        extension: "ts",
        steps: &[&["npx", "--no-install", "ts-node", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["ruby", "rb"],
        extension: "rb",
        steps: &[&["ruby", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["perl", "pl"],
        extension: "pl",
        steps: &[&["perl", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["php"],
        extension: "php",
        steps: &[&["php", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["go", "golang"],
        extension: "go",
        steps: &[&["go", "run", FILE]],
        java_layout: false,
    },
    ScriptKind {
        names: &["c"],
        extension: "c",
        steps: &[&["gcc", FILE, "-o", BIN], &[BIN]],
        java_layout: false,
    },
    ScriptKind {
        names: &["cpp", "c++"],
        extension: "cpp",
        steps: &[&["g++", FILE, "-o", BIN], &[BIN]],
        java_layout: false,
    },
    ScriptKind {
        names: &["rust", "rs"],
        extension: "rs",
        steps: &[&["rustc", FILE, "-o", BIN], &[BIN]],
        java_layout: false,
    },
    ScriptKind {
        names: &["java"],
        extension: "java",
        steps: &[&["javac", FILE], &["java", "-cp", DIR, "Main"]],
        java_layout: true,
    },
];

pub fn supported_types() -> Vec<String> {
    SCRIPT_KINDS.iter().map(|kind| kind.names[0].to_string()).collect()
}

pub fn lookup(script_type: &str) -> SandboxResult<&'static ScriptKind> {
    let wanted = script_type.trim().to_ascii_lowercase();
    SCRIPT_KINDS
        .iter()
        .find(|kind| kind.names.contains(&wanted.as_str()))
        .ok_or_else(|| SandboxError::UnknownScriptType {
            script_type: script_type.to_string(),
            supported: supported_types(),
        })
}

/// A script file on disk. Dropping it removes the file and everything built
/// from it.
#[derive(Debug)]
pub struct StagedScript {
    path: PathBuf,
    script_type: String,
    compiled_artifacts: Vec<PathBuf>,
    /// Private directory owned by this script (Java layout).
    own_dir: Option<PathBuf>,
}

impl StagedScript {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn script_type(&self) -> &str {
        &self.script_type
    }

    pub fn compiled_artifacts(&self) -> &[PathBuf] {
        &self.compiled_artifacts
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn binary(&self) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{}.exe", self.stem())
        } else {
            self.stem()
        };
        self.dir().join(name)
    }

    fn expand(&self, template: &[&str]) -> Vec<String> {
        template
            .iter()
            .map(|part| match *part {
                FILE => self.path.to_string_lossy().into_owned(),
                BIN => self.binary().to_string_lossy().into_owned(),
                DIR => self.dir().to_string_lossy().into_owned(),
                other => other.to_string(),
            })
            .collect()
    }
}

impl Drop for StagedScript {
    fn drop(&mut self) {
        if let Some(dir) = &self.own_dir {
            if let Err(err) = fs::remove_dir_all(dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove script directory {}: {}", dir.display(), err);
                }
            }
            return;
        }

        let stem = self.stem();
        let mut doomed = vec![self.path.clone()];
        doomed.extend(self.compiled_artifacts.iter().cloned());
        doomed.push(self.dir().join(format!("{}.o", stem)));
        doomed.push(self.dir().join(format!("{}.class", stem)));
        for path in doomed {
            remove_quietly(&path);
        }

        // Bytecode caches are named `<stem>.<tag>.pyc`.
        let cache = self.dir().join("__pycache__");
        if let Ok(entries) = fs::read_dir(&cache) {
            for entry in entries.filter_map(Result::ok) {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{}.", stem))
                {
                    remove_quietly(&entry.path());
                }
            }
            // Only goes if nothing else lives there.
            let _ = fs::remove_dir(&cache);
        }
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove {}: {}", path.display(), err),
    }
}

pub struct ScriptStaging<'a> {
    paths: &'a PathValidator,
    max_file_size: usize,
}

impl<'a> ScriptStaging<'a> {
    pub fn new(paths: &'a PathValidator, max_file_size: usize) -> Self {
        Self {
            paths,
            max_file_size,
        }
    }

    /// Write `content` under `workspace` (or `subdir` of it).
    pub fn stage(
        &self,
        content: &str,
        script_type: &str,
        workspace: &Workspace,
        subdir: Option<&str>,
    ) -> SandboxResult<StagedScript> {
        let kind = lookup(script_type)?;
        let root = workspace.root_path.as_path();

        let base = match subdir {
            Some(dir) if !dir.is_empty() => self.paths.resolve(root, dir)?,
            _ => root.to_path_buf(),
        };

        if content.len() > self.max_file_size {
            return Err(SandboxError::FileTooLarge {
                path: base.clone(),
                size: content.len() as u64,
                limit: self.max_file_size as u64,
            });
        }

        let unique = format!(
            "{}_{}_{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let (path, own_dir) = if kind.java_layout {
            let dir = base.join(&unique);
            (dir.join(format!("Main.{}", kind.extension)), Some(dir))
        } else {
            (base.join(format!("{}.{}", unique, kind.extension)), None)
        };

        let writer = SafeFileWriter::new(root)
            .map_err(|err| SandboxError::execution(format!("{:#}", err)))?
            .with_max_size(Some(self.max_file_size));
        // The guard exists before the write so a failed write still cleans up.
        let staged = StagedScript {
            path,
            script_type: kind.names[0].to_string(),
            compiled_artifacts: Vec::new(),
            own_dir,
        };
        writer
            .write_text(&staged.path, content, WriteMode::CreateNew)
            .map_err(|err| SandboxError::execution(format!("failed to stage script: {:#}", err)))?;

        debug!("staged {} script at {}", staged.script_type, staged.path.display());
        Ok(staged)
    }

    /// Stage, run and remove a script in one go.
    #[allow(clippy::too_many_arguments)]
    pub fn run_script(
        &self,
        runner: &ProcessRunner,
        content: &str,
        script_type: &str,
        timeout_secs: u64,
        workspace: &Workspace,
        subdir: Option<&str>,
        opts: &RunOptions,
    ) -> SandboxResult<ExecutionResult> {
        let mut staged = self.stage(content, script_type, workspace, subdir)?;
        let result = self.run(&mut staged, runner, workspace, timeout_secs, opts);
        drop(staged);
        Ok(result)
    }

    /// Run every step of the staged script, sharing one timeout budget.
    ///
    /// A failing step short-circuits: its result (e.g. the compiler output) is
    /// what the caller sees.
    pub fn run(
        &self,
        staged: &mut StagedScript,
        runner: &ProcessRunner,
        workspace: &Workspace,
        timeout_secs: u64,
        opts: &RunOptions,
    ) -> ExecutionResult {
        let started = Instant::now();
        let kind = match lookup(&staged.script_type) {
            Ok(kind) => kind,
            Err(err) => {
                return ExecutionResult::failure(
                    staged.path.to_string_lossy(),
                    err.to_string(),
                    started.elapsed(),
                )
            }
        };
        if kind.steps.len() > 1 && !kind.java_layout {
            let binary = staged.binary();
            staged.compiled_artifacts.push(binary);
        }

        let budget = Duration::from_secs(timeout_secs);
        let mut last = None;
        for (index, template) in kind.steps.iter().enumerate() {
            let remaining = budget.saturating_sub(started.elapsed());
            if index > 0 && remaining < Duration::from_secs(1) {
                let mut result = ExecutionResult::failure(
                    shell_words::join(staged.expand(template)),
                    format!("Command timed out after {} seconds", timeout_secs),
                    started.elapsed(),
                );
                result.timed_out = true;
                return result;
            }

            let spec = CommandSpec::trusted(
                staged.expand(template),
                Some(staged.dir().to_path_buf()),
                timeout_secs,
            )
            .with_timeout(remaining.as_secs().max(1));
            let result = runner.run(&spec, workspace, opts);
            if !result.success {
                return with_total_duration(result, started);
            }
            last = Some(result);
        }

        match last {
            Some(result) => with_total_duration(result, started),
            None => ExecutionResult::failure(
                staged.path.to_string_lossy(),
                "script type has no run steps",
                started.elapsed(),
            ),
        }
    }
}

fn with_total_duration(mut result: ExecutionResult, started: Instant) -> ExecutionResult {
    result.duration_seconds = started.elapsed().as_secs_f64();
    result
}
