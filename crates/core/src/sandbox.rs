//! # Sandbox
//!
//! The single entry point callers use. Owns the command policy, the
//! workspace registry and the process runner, and resolves per-workspace
//! settings against the global configuration for every call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use warden_common::limits::resolve_exec_limits;

use crate::config::{SandboxConfig, WorkspaceSettings};
use crate::errors::SandboxResult;
use crate::file_ops::{FileEntry, FileOps};
use crate::monitor::CancelToken;
use crate::policy::{CommandOptions, CommandPolicy, CommandValidator, ValidationVerdict};
use crate::runner::{ExecutionResult, ProcessRunner, RunOptions};
use crate::script::ScriptStaging;
use crate::workspace::{
    ArchiveManifest, RestoredFiles, SetupResult, Template, Workspace, WorkspaceEntry,
    WorkspaceManager, WorkspaceRegistry,
};

pub const DEFAULT_SCRIPT_TYPE: &str = "python";

/// Optional knobs for [`Sandbox::execute_command`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout_secs: Option<u64>,
    /// Relative to the workspace root
    pub cwd: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    /// Defaults to true
    pub capture_output: Option<bool>,
    pub cancel: Option<CancelToken>,
}

pub struct Sandbox {
    config: SandboxConfig,
    validator: CommandValidator,
    runner: ProcessRunner,
    workspaces: WorkspaceManager,
}

impl Sandbox {
    /// Build from configuration, with the built-in policy extended by the
    /// config's `[policy]` section.
    pub fn new(config: SandboxConfig) -> SandboxResult<Self> {
        let policy = CommandPolicy::from_overrides(&config.policy)?;
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: SandboxConfig, policy: CommandPolicy) -> SandboxResult<Self> {
        config.validate()?;
        let registry = Arc::new(WorkspaceRegistry::new());
        Ok(Self {
            validator: CommandValidator::new(Arc::new(policy)),
            runner: ProcessRunner::new(config.max_timeout_secs),
            workspaces: WorkspaceManager::new(config.workspace_base.clone(), registry),
            config,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn policy(&self) -> &CommandPolicy {
        self.validator.policy()
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn execute_command(
        &self,
        workspace_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> SandboxResult<ExecutionResult> {
        let entry = self.workspaces.entry(workspace_id)?;
        let workspace = entry.snapshot();
        let (run_opts, timeout_secs) =
            self.run_options(entry.settings(), options.timeout_secs, options.cancel);

        let spec = self.validator.prepare(
            command,
            &workspace.root_path,
            CommandOptions {
                timeout_secs,
                cwd: options.cwd,
                env: options.env_vars,
                capture_output: options.capture_output.unwrap_or(true),
            },
        )?;
        Ok(self.runner.run(&spec, &workspace, &run_opts))
    }

    pub fn execute_script(
        &self,
        workspace_id: &str,
        script_content: &str,
        script_type: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> SandboxResult<ExecutionResult> {
        let entry = self.workspaces.entry(workspace_id)?;
        let workspace = entry.snapshot();
        let (run_opts, timeout_secs) = self.run_options(entry.settings(), timeout_secs, None);
        let script_type = script_type.unwrap_or(DEFAULT_SCRIPT_TYPE);

        let started = Instant::now();
        let result = ScriptStaging::new(self.validator.path_validator(), self.max_file_size(&entry))
            .run_script(
                &self.runner,
                script_content,
                script_type,
                timeout_secs,
                &workspace,
                None,
                &run_opts,
            )?;
        info!(
            target: "warden",
            "script completed | workspace={} type={} success={} duration_ms={}",
            workspace_id,
            script_type,
            result.success,
            started.elapsed().as_millis()
        );
        Ok(result)
    }

    pub fn validate_command(&self, workspace_id: &str, command: &str) -> SandboxResult<ValidationVerdict> {
        let workspace = self.workspaces.get(workspace_id)?;
        Ok(self.validator.validate(command, &workspace.root_path))
    }

    pub fn create_workspace(
        &self,
        id: Option<&str>,
        template: Option<Template>,
        settings: Option<WorkspaceSettings>,
    ) -> SandboxResult<Workspace> {
        self.workspaces.create(id, template, settings)
    }

    /// Clone/update `repo_url` then run `commands` (or the template's
    /// defaults). Every command goes through the same validation as
    /// [`execute_command`](Self::execute_command).
    pub fn setup_workspace(
        &self,
        workspace_id: &str,
        repo_url: Option<&str>,
        commands: &[String],
    ) -> SandboxResult<SetupResult> {
        let entry = self.workspaces.entry(workspace_id)?;
        let (run_opts, timeout_secs) = self.run_options(entry.settings(), None, None);
        self.workspaces
            .setup(workspace_id, repo_url, commands, |workspace, command| {
                let spec = self.validator.prepare(
                    command,
                    &workspace.root_path,
                    CommandOptions {
                        timeout_secs,
                        ..CommandOptions::default()
                    },
                )?;
                Ok(self.runner.run(&spec, workspace, &run_opts))
            })
    }

    pub fn archive_session_work(
        &self,
        workspace_id: &str,
        session_id: Option<&str>,
        cleanup_temp: bool,
    ) -> SandboxResult<ArchiveManifest> {
        self.workspaces.archive(workspace_id, session_id, cleanup_temp)
    }

    pub fn restore_session(&self, workspace_id: &str, session_id: &str) -> SandboxResult<RestoredFiles> {
        self.workspaces.restore(workspace_id, session_id)
    }

    pub fn cleanup_workspace(&self, workspace_id: &str) -> bool {
        self.workspaces.cleanup(workspace_id)
    }

    pub fn get_workspace(&self, workspace_id: &str) -> SandboxResult<Workspace> {
        self.workspaces.get(workspace_id)
    }

    pub fn list_workspaces(&self) -> Vec<Workspace> {
        self.workspaces.list()
    }

    /// Attach a workspace directory created by another process.
    pub fn open_workspace(&self, workspace_id: &str) -> SandboxResult<Workspace> {
        self.workspaces.open(workspace_id)
    }

    pub fn discover_workspaces(&self) -> SandboxResult<Vec<Workspace>> {
        self.workspaces.discover()
    }

    pub fn read_file(&self, workspace_id: &str, path: &str) -> SandboxResult<String> {
        self.with_files(workspace_id, |ops| ops.read_file(path))
    }

    pub fn write_file(&self, workspace_id: &str, path: &str, content: &str) -> SandboxResult<PathBuf> {
        self.with_files(workspace_id, |ops| ops.write_file(path, content))
    }

    pub fn append_file(&self, workspace_id: &str, path: &str, content: &str) -> SandboxResult<PathBuf> {
        self.with_files(workspace_id, |ops| ops.append_file(path, content))
    }

    pub fn list_dir(&self, workspace_id: &str, path: &str) -> SandboxResult<Vec<FileEntry>> {
        self.with_files(workspace_id, |ops| ops.list_dir(path))
    }

    pub fn delete_file(&self, workspace_id: &str, path: &str) -> SandboxResult<()> {
        self.with_files(workspace_id, |ops| ops.delete_file(path))
    }

    pub fn create_dir(&self, workspace_id: &str, path: &str) -> SandboxResult<PathBuf> {
        self.with_files(workspace_id, |ops| ops.create_dir(path))
    }

    fn with_files<T>(
        &self,
        workspace_id: &str,
        op: impl FnOnce(&FileOps<'_>) -> SandboxResult<T>,
    ) -> SandboxResult<T> {
        let entry = self.workspaces.entry(workspace_id)?;
        let workspace = entry.snapshot();
        let ops = FileOps::new(
            &workspace.root_path,
            self.validator.path_validator(),
            self.max_file_size(&entry),
        );
        op(&ops)
    }

    fn max_file_size(&self, entry: &WorkspaceEntry) -> usize {
        entry
            .settings()
            .max_file_size
            .unwrap_or(self.config.max_file_size)
    }

    /// Run options for one call plus its effective timeout.
    fn run_options(
        &self,
        settings: &WorkspaceSettings,
        requested_timeout: Option<u64>,
        cancel: Option<CancelToken>,
    ) -> (RunOptions, u64) {
        let (limits, sources) = resolve_exec_limits(
            requested_timeout,
            settings
                .default_timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
            self.config.max_timeout_secs,
            settings.max_output_size.unwrap_or(self.config.max_output_size),
        );
        tracing::debug!(
            "resolved limits: timeout_secs={} ({}) max_output_bytes={} ({})",
            limits.timeout_secs,
            sources.timeout_secs,
            limits.max_output_bytes,
            sources.max_output_bytes
        );

        let mut opts = RunOptions::from_config(&self.config);
        opts.max_output_bytes = limits.max_output_bytes;
        if let Some(strict) = settings.strict_limits {
            opts.strict_limits = strict;
        }
        opts.cancel = cancel;
        (opts, limits.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(base: &TempDir) -> Sandbox {
        let config = SandboxConfig {
            workspace_base: base.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        Sandbox::new(config).unwrap()
    }

    #[test]
    fn unknown_workspace_is_reported() {
        let base = TempDir::new().unwrap();
        let sandbox = sandbox(&base);
        let err = sandbox
            .execute_command("missing", "echo hi", ExecOptions::default())
            .unwrap_err();
        assert_eq!(err.error_code(), "E_WORKSPACE_NOT_FOUND");
        assert!(sandbox.read_file("missing", "a.txt").is_err());
    }

    #[test]
    fn denied_command_never_runs() {
        let base = TempDir::new().unwrap();
        let sandbox = sandbox(&base);
        sandbox.create_workspace(Some("ws"), None, None).unwrap();
        let err = sandbox
            .execute_command("ws", "rm -rf /", ExecOptions::default())
            .unwrap_err();
        assert!(err.is_security());
        assert!(!sandbox.validate_command("ws", "sudo ls").unwrap().allowed);
        assert!(sandbox.validate_command("ws", "ls -la").unwrap().allowed);
    }

    #[test]
    fn workspace_settings_bound_file_size() {
        let base = TempDir::new().unwrap();
        let sandbox = sandbox(&base);
        let settings = WorkspaceSettings {
            max_file_size: Some(8),
            ..WorkspaceSettings::default()
        };
        sandbox.create_workspace(Some("small"), None, Some(settings)).unwrap();
        sandbox.write_file("small", "ok.txt", "12345678").unwrap();
        let err = sandbox.write_file("small", "big.txt", "123456789").unwrap_err();
        assert_eq!(err.error_code(), "E_FILE_TOO_LARGE");
    }

    #[test]
    fn unknown_script_type_lists_supported() {
        let base = TempDir::new().unwrap();
        let sandbox = sandbox(&base);
        sandbox.create_workspace(Some("ws"), None, None).unwrap();
        let err = sandbox
            .execute_script("ws", "x", Some("brainfuck"), None)
            .unwrap_err();
        assert!(err.to_string().contains("Supported types"));
    }

    #[cfg(unix)]
    #[test]
    fn command_runs_in_workspace_with_requested_cwd() {
        let base = TempDir::new().unwrap();
        let sandbox = sandbox(&base);
        let ws = sandbox.create_workspace(Some("ws"), None, None).unwrap();
        sandbox.create_dir("ws", "sub").unwrap();

        let result = sandbox
            .execute_command(
                "ws",
                "pwd",
                ExecOptions {
                    cwd: Some("sub".into()),
                    ..ExecOptions::default()
                },
            )
            .unwrap();
        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout.trim(), ws.root_path.join("sub").display().to_string());
    }
}
