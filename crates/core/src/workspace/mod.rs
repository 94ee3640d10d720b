//! # Workspace Manager
//!
//! A workspace is a directory under the configured base that is the sole
//! filesystem trust boundary for everything run on an agent's behalf.
//! Workspaces are tracked in an explicit [`WorkspaceRegistry`]; ids are never
//! silently reused.

pub mod archive;
pub mod registry;
pub mod templates;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkspaceSettings;
use crate::errors::{SandboxError, SandboxResult};
use crate::runner::ExecutionResult;

pub use archive::{ArchiveManifest, RestoredFiles, WorkspaceState};
pub use registry::{WorkspaceEntry, WorkspaceRegistry};
pub use templates::Template;

static ID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Archived,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workspace {
    pub id: String,
    /// Canonical root; nothing outside it is ever touched.
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: WorkspaceStatus,
    pub template: Template,
}

/// What happened to one setup command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SetupOutcome {
    Executed(ExecutionResult),
    Denied { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupStep {
    pub command: String,
    pub outcome: SetupOutcome,
}

impl SetupStep {
    pub fn succeeded(&self) -> bool {
        matches!(&self.outcome, SetupOutcome::Executed(result) if result.success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<SetupStep>,
    pub commands: Vec<SetupStep>,
}

pub fn validate_id(kind: &str, id: &str) -> SandboxResult<()> {
    let valid = ID_PATTERN.as_ref().is_some_and(|re| re.is_match(id));
    if valid {
        Ok(())
    } else {
        Err(SandboxError::security(format!(
            "invalid {} id '{}': expected 1-64 characters of [A-Za-z0-9_-]",
            kind, id
        )))
    }
}

pub struct WorkspaceManager {
    base: PathBuf,
    registry: Arc<WorkspaceRegistry>,
}

impl WorkspaceManager {
    pub fn new(base: PathBuf, registry: Arc<WorkspaceRegistry>) -> Self {
        Self { base, registry }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Create, scaffold and register a new workspace.
    pub fn create(
        &self,
        id: Option<&str>,
        template: Option<Template>,
        settings: Option<WorkspaceSettings>,
    ) -> SandboxResult<Workspace> {
        let id = match id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        validate_id("workspace", &id)?;
        let template = template.unwrap_or_default();

        // Held across the directory creation so two creates of one id cannot race.
        let mut entries = self.registry.entries();
        if entries.contains_key(&id) {
            return Err(SandboxError::WorkspaceExists { id });
        }

        fs::create_dir_all(&self.base)
            .map_err(|e| SandboxError::io(self.base.clone(), "create workspace base", e))?;
        let root = self.base.join(&id);
        match create_workspace_dir(&root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(SandboxError::WorkspaceExists { id });
            }
            Err(err) => return Err(SandboxError::io(root, "create workspace", err)),
        }

        let root_path = match root.canonicalize() {
            Ok(path) => path,
            Err(err) => {
                let _ = fs::remove_dir_all(&root);
                return Err(SandboxError::io(root, "canonicalize workspace", err));
            }
        };

        if let Err(err) = scaffold(&root_path, template) {
            let _ = fs::remove_dir_all(&root_path);
            return Err(err);
        }

        let workspace = Workspace {
            id: id.clone(),
            root_path,
            created_at: Utc::now(),
            status: WorkspaceStatus::Active,
            template,
        };
        entries.insert(
            id.clone(),
            Arc::new(WorkspaceEntry::new(
                workspace.clone(),
                settings.unwrap_or_default(),
            )),
        );

        info!(
            target: "warden",
            "workspace created | id={} template={} root={}",
            id,
            template,
            workspace.root_path.display()
        );
        Ok(workspace)
    }

    pub fn get(&self, id: &str) -> SandboxResult<Workspace> {
        Ok(self.entry(id)?.snapshot())
    }

    pub fn entry(&self, id: &str) -> SandboxResult<Arc<WorkspaceEntry>> {
        self.registry
            .get(id)
            .ok_or_else(|| SandboxError::WorkspaceNotFound { id: id.to_string() })
    }

    pub fn list(&self) -> Vec<Workspace> {
        self.registry.list()
    }

    /// Register a workspace directory left behind by an earlier process.
    ///
    /// Already registered ids are returned as they are. The template is
    /// inferred from the manifests present.
    pub fn open(&self, id: &str) -> SandboxResult<Workspace> {
        validate_id("workspace", id)?;
        let mut entries = self.registry.entries();
        if let Some(entry) = entries.get(id) {
            return Ok(entry.snapshot());
        }

        let root = self.base.join(id);
        if !root.is_dir() {
            return Err(SandboxError::WorkspaceNotFound { id: id.to_string() });
        }
        let root_path = root
            .canonicalize()
            .map_err(|e| SandboxError::io(root.clone(), "canonicalize workspace", e))?;
        let created_at = fs::metadata(&root_path)
            .and_then(|meta| meta.created().or_else(|_| meta.modified()))
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let workspace = Workspace {
            id: id.to_string(),
            template: Template::detect(&root_path),
            root_path,
            created_at,
            status: WorkspaceStatus::Active,
        };
        entries.insert(
            id.to_string(),
            Arc::new(WorkspaceEntry::new(workspace.clone(), WorkspaceSettings::default())),
        );
        debug!("reopened workspace {} at {}", id, workspace.root_path.display());
        Ok(workspace)
    }

    /// Open every workspace directory under the base.
    pub fn discover(&self) -> SandboxResult<Vec<Workspace>> {
        let read = match fs::read_dir(&self.base) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SandboxError::io(self.base.clone(), "list workspace base", err)),
        };
        for entry in read.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && validate_id("workspace", &name).is_ok() {
                self.open(&name)?;
            }
        }
        Ok(self.list())
    }

    /// Clone or update the repository, then run the setup commands in order.
    ///
    /// `run` validates and executes one command line. Every command runs even
    /// after a failure; overall success is the AND of all steps.
    pub fn setup<F>(
        &self,
        workspace_id: &str,
        repo_url: Option<&str>,
        commands: &[String],
        mut run: F,
    ) -> SandboxResult<SetupResult>
    where
        F: FnMut(&Workspace, &str) -> SandboxResult<ExecutionResult>,
    {
        let entry = self.entry(workspace_id)?;
        let _op = entry.begin_operation();
        let workspace = entry.snapshot();
        let root = workspace.root_path.as_path();

        let mut step = |command: String| -> SetupStep {
            let outcome = match run(&workspace, &command) {
                Ok(result) => SetupOutcome::Executed(result),
                Err(err) => SetupOutcome::Denied {
                    reason: err.to_string(),
                },
            };
            SetupStep { command, outcome }
        };

        let repository = match repo_url {
            Some(url) if root.join(".git").exists() => {
                debug!("updating existing checkout for {}", url);
                Some(step("git pull --ff-only".to_string()))
            }
            Some(url) if is_effectively_empty(root) => {
                Some(step(shell_words::join(["git", "clone", url, "."])))
            }
            Some(url) => {
                let command = shell_words::join(["git", "clone", url, "."]);
                let refused = ExecutionResult::failure(
                    command.clone(),
                    "workspace is not empty and has no .git directory; refusing to clone into it",
                    std::time::Duration::ZERO,
                );
                Some(SetupStep {
                    command,
                    outcome: SetupOutcome::Executed(refused),
                })
            }
            None => None,
        };

        let command_list = if commands.is_empty() {
            workspace.template.default_setup_commands(root)
        } else {
            commands.to_vec()
        };
        let steps: Vec<SetupStep> = command_list.into_iter().map(&mut step).collect();

        let success = repository.as_ref().map_or(true, SetupStep::succeeded)
            && steps.iter().all(SetupStep::succeeded);
        if !success {
            warn!(target: "warden", "workspace setup incomplete | id={}", workspace_id);
        }
        Ok(SetupResult {
            success,
            repository,
            commands: steps,
        })
    }

    /// Snapshot the workspace into `.archive/<session_id>/`.
    pub fn archive(
        &self,
        workspace_id: &str,
        session_id: Option<&str>,
        cleanup_temp: bool,
    ) -> SandboxResult<ArchiveManifest> {
        let entry = self.entry(workspace_id)?;
        let _op = entry.begin_operation();
        let workspace = entry.snapshot();

        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => format!(
                "session_{}_{}",
                Utc::now().format("%Y%m%d_%H%M%S"),
                &Uuid::new_v4().simple().to_string()[..8]
            ),
        };
        validate_id("session", &session_id)?;

        let archive_root = archive::confine(&workspace.root_path, Path::new(archive::ARCHIVE_DIR))?;
        let dest = archive_root.join(&session_id);
        if dest.exists() {
            return Err(SandboxError::execution(format!(
                "session '{}' is already archived in workspace '{}'",
                session_id, workspace_id
            )));
        }
        fs::create_dir_all(&dest)
            .map_err(|e| SandboxError::io(dest.clone(), "create archive directory", e))?;

        let stats = match archive::copy_into_archive(&workspace.root_path, &dest, cleanup_temp) {
            Ok(stats) => stats,
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&dest) {
                    warn!("failed to remove partial archive {}: {}", dest.display(), cleanup);
                }
                return Err(err);
            }
        };

        entry.set_status(WorkspaceStatus::Archived);
        let manifest = ArchiveManifest {
            session_id: session_id.clone(),
            archived_at: Utc::now(),
            files_archived: stats.files_archived,
            temp_files_removed: stats.temp_files_removed,
            archive_location: dest.clone(),
            workspace_state: WorkspaceState {
                workspace_id: workspace.id.clone(),
                template: workspace.template.to_string(),
                status: WorkspaceStatus::Archived.as_str().to_string(),
                file_count: stats.files_archived,
                total_bytes: stats.total_bytes,
            },
        };
        archive::write_manifest(&dest, &manifest)?;

        info!(
            target: "warden",
            "session archived | workspace={} session={} files={} temp_removed={}",
            workspace_id,
            session_id,
            manifest.files_archived,
            manifest.temp_files_removed
        );
        Ok(manifest)
    }

    /// Copy an archived session back into the workspace.
    pub fn restore(&self, workspace_id: &str, session_id: &str) -> SandboxResult<RestoredFiles> {
        validate_id("session", session_id)?;
        let entry = self.entry(workspace_id)?;
        let _op = entry.begin_operation();
        let workspace = entry.snapshot();

        let source = archive::confine(
            &workspace.root_path,
            &Path::new(archive::ARCHIVE_DIR).join(session_id),
        )?;
        if !source.is_dir() {
            return Err(SandboxError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        let files = archive::copy_from_archive(&source, &workspace.root_path)?;
        entry.set_status(WorkspaceStatus::Active);
        info!(
            target: "warden",
            "session restored | workspace={} session={} files={}",
            workspace_id,
            session_id,
            files.len()
        );
        Ok(RestoredFiles {
            session_id: session_id.to_string(),
            files,
        })
    }

    /// Remove the workspace tree and forget it. Safe to call repeatedly.
    ///
    /// Returns `false` only when the directory could not be removed.
    pub fn cleanup(&self, workspace_id: &str) -> bool {
        if validate_id("workspace", workspace_id).is_err() {
            warn!("cleanup refused for invalid workspace id {:?}", workspace_id);
            return false;
        }

        let entry = self.registry.get(workspace_id);
        let _op = entry.as_ref().map(|entry| entry.begin_operation());
        let root = entry
            .as_ref()
            .map(|entry| entry.snapshot().root_path)
            .unwrap_or_else(|| self.base.join(workspace_id));

        let removed = match fs::remove_dir_all(&root) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!("failed to remove workspace {}: {}", root.display(), err);
                false
            }
        };

        if removed {
            self.registry.remove(workspace_id);
            info!(target: "warden", "workspace cleaned up | id={}", workspace_id);
        }
        removed
    }
}

fn create_workspace_dir(root: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().mode(0o700).create(root)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir(root)
    }
}

fn scaffold(root: &Path, template: Template) -> SandboxResult<()> {
    for (rel, content) in template.files() {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SandboxError::io(parent.to_path_buf(), "scaffold workspace", e))?;
        }
        fs::write(&path, content).map_err(|e| SandboxError::io(path.clone(), "scaffold workspace", e))?;
    }
    Ok(())
}

/// Empty apart from the sandbox's own bookkeeping directories.
fn is_effectively_empty(root: &Path) -> bool {
    match fs::read_dir(root) {
        Ok(entries) => entries.filter_map(Result::ok).all(|entry| {
            let name = entry.file_name();
            name == ".home" || name == ".tmp" || name == archive::ARCHIVE_DIR
        }),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(base: &TempDir) -> WorkspaceManager {
        WorkspaceManager::new(base.path().to_path_buf(), Arc::new(WorkspaceRegistry::new()))
    }

    #[test]
    fn create_scaffolds_and_registers() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        let ws = mgr.create(Some("demo"), Some(Template::Python), None).unwrap();
        assert!(ws.root_path.join("main.py").is_file());
        assert!(ws.root_path.join("tests/test_main.py").is_file());
        assert_eq!(mgr.get("demo").unwrap().id, "demo");
        assert_eq!(mgr.list().len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&ws.root_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn open_reattaches_existing_directories() {
        let base = TempDir::new().unwrap();
        let created = manager(&base)
            .create(Some("kept"), Some(Template::Rust), None)
            .unwrap();
        fs::create_dir_all(base.path().join("not a workspace")).unwrap();

        let fresh = manager(&base);
        let reopened = fresh.open("kept").unwrap();
        assert_eq!(reopened.root_path, created.root_path);
        assert_eq!(reopened.template, Template::Rust);
        assert_eq!(fresh.discover().unwrap().len(), 1);
        assert!(matches!(
            fresh.open("missing"),
            Err(SandboxError::WorkspaceNotFound { .. })
        ));
    }

    #[test]
    fn default_id_is_a_uuid() {
        let base = TempDir::new().unwrap();
        let ws = manager(&base).create(None, None, None).unwrap();
        assert!(Uuid::parse_str(&ws.id).is_ok());
        assert_eq!(ws.template, Template::Generic);
    }

    #[test]
    fn ids_are_never_reused() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        mgr.create(Some("dup"), None, None).unwrap();
        let err = mgr.create(Some("dup"), None, None).unwrap_err();
        assert_eq!(err.error_code(), "E_WORKSPACE_EXISTS");

        // A directory left over from another process counts too.
        fs::create_dir(base.path().join("stale")).unwrap();
        assert!(mgr.create(Some("stale"), None, None).is_err());
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        let long = "x".repeat(65);
        for id in ["../escape", "", "has space", long.as_str()] {
            assert!(mgr.create(Some(id), None, None).is_err(), "{id}");
        }
    }

    #[test]
    fn cleanup_is_idempotent() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        let ws = mgr.create(Some("gone"), None, None).unwrap();
        assert!(mgr.cleanup("gone"));
        assert!(!ws.root_path.exists());
        assert!(mgr.cleanup("gone"));
        assert!(matches!(
            mgr.get("gone"),
            Err(SandboxError::WorkspaceNotFound { .. })
        ));
    }

    #[test]
    fn archive_then_restore_round_trips_files() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        let ws = mgr.create(Some("arch"), Some(Template::Generic), None).unwrap();
        fs::create_dir_all(ws.root_path.join("data")).unwrap();
        fs::write(ws.root_path.join("data/results.csv"), "a,b\n1,2\n").unwrap();
        fs::write(ws.root_path.join("scratch.swp"), "swap").unwrap();

        let manifest = mgr.archive("arch", Some("s1"), true).unwrap();
        assert_eq!(manifest.files_archived, 2); // README.md + results.csv
        assert_eq!(manifest.temp_files_removed, 1);
        assert!(manifest.archive_location.join(archive::MANIFEST_FILE).is_file());
        assert_eq!(mgr.get("arch").unwrap().status, WorkspaceStatus::Archived);

        let on_disk = archive::read_manifest(&manifest.archive_location).unwrap();
        assert_eq!(on_disk, manifest);

        fs::remove_file(ws.root_path.join("data/results.csv")).unwrap();
        let restored = mgr.restore("arch", "s1").unwrap();
        assert_eq!(restored.files.len(), 2);
        assert!(!restored.files.contains(&PathBuf::from(archive::MANIFEST_FILE)));
        assert_eq!(
            fs::read_to_string(ws.root_path.join("data/results.csv")).unwrap(),
            "a,b\n1,2\n"
        );
        assert!(!ws.root_path.join(archive::MANIFEST_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn archive_dir_symlinked_outside_is_refused() {
        let base = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let mgr = manager(&base);
        let ws = mgr.create(Some("ws"), None, None).unwrap();
        std::os::unix::fs::symlink(outside.path(), ws.root_path.join(archive::ARCHIVE_DIR))
            .unwrap();

        let err = mgr.archive("ws", Some("s1"), false).unwrap_err();
        assert!(err.is_security());
        assert!(!outside.path().join("s1").exists());
        assert!(mgr.restore("ws", "s1").unwrap_err().is_security());
    }

    #[test]
    fn restoring_an_unknown_session_fails() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        mgr.create(Some("ws"), None, None).unwrap();
        let err = mgr.restore("ws", "nope").unwrap_err();
        assert_eq!(err.error_code(), "E_SESSION_NOT_FOUND");
    }

    #[test]
    fn setup_runs_every_command_and_ands_success() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        mgr.create(Some("setup"), None, None).unwrap();

        let mut seen = Vec::new();
        let result = mgr
            .setup(
                "setup",
                None,
                &["first".to_string(), "second".to_string(), "third".to_string()],
                |_, command| {
                    seen.push(command.to_string());
                    match command {
                        "second" => Err(SandboxError::security("denied")),
                        _ => Ok(ExecutionResult {
                            success: true,
                            exit_code: Some(0),
                            ..ExecutionResult::failure(command, "", std::time::Duration::ZERO)
                        }),
                    }
                },
            )
            .unwrap();

        assert_eq!(seen, vec!["first", "second", "third"]);
        assert!(!result.success);
        assert!(result.repository.is_none());
        assert!(matches!(result.commands[1].outcome, SetupOutcome::Denied { .. }));
        assert!(result.commands[2].succeeded());
    }

    #[test]
    fn clone_targets_only_empty_workspaces() {
        let base = TempDir::new().unwrap();
        let mgr = manager(&base);
        mgr.create(Some("clone"), None, None).unwrap();

        let result = mgr
            .setup("clone", Some("https://example.com/r.git"), &[], |_, _| {
                panic!("nothing should run")
            })
            .unwrap();
        assert!(!result.success);
        let repo = result.repository.unwrap();
        match repo.outcome {
            SetupOutcome::Executed(r) => assert!(r.stderr.contains("not empty")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
