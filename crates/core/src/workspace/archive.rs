//! Session archives kept inside the workspace under `.archive/<session_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;
use warden_common::process_utils::canonicalize_within_root;

use crate::errors::{SandboxError, SandboxResult};

pub const ARCHIVE_DIR: &str = ".archive";
pub const MANIFEST_FILE: &str = "session_summary.json";

/// Top-level entries never copied into an archive.
const EXCLUDED_ROOTS: &[&str] = &[ARCHIVE_DIR, ".git", ".home", ".tmp"];

/// Build and editor leftovers that are not worth keeping.
pub const TEMP_PATTERNS: &[&str] = &[
    "*.pyc",
    "*.pyo",
    "*.tmp",
    "*.swp",
    "*~",
    ".DS_Store",
    "**/__pycache__/**",
    "*.class",
    "*.o",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub workspace_id: String,
    pub template: String,
    pub status: String,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Persisted as `session_summary.json` next to the archived files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub session_id: String,
    pub archived_at: DateTime<Utc>,
    pub files_archived: usize,
    pub temp_files_removed: usize,
    pub archive_location: PathBuf,
    pub workspace_state: WorkspaceState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoredFiles {
    pub session_id: String,
    pub files: Vec<PathBuf>,
}

pub(crate) fn temp_matcher() -> SandboxResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in TEMP_PATTERNS {
        let glob = Glob::new(pattern).map_err(|err| SandboxError::Config {
            message: format!("invalid temp pattern '{}': {}", pattern, err),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| SandboxError::Config {
        message: format!("failed to build temp pattern set: {}", err),
    })
}

pub(crate) fn is_temp(matcher: &GlobSet, rel: &Path) -> bool {
    let rel_text = rel.to_string_lossy().replace('\\', "/");
    matcher.is_match(&rel_text)
        || rel
            .file_name()
            .is_some_and(|name| matcher.is_match(Path::new(name)))
}

/// Counts gathered while copying a workspace into an archive.
pub(crate) struct CopyStats {
    pub files_archived: usize,
    pub temp_files_removed: usize,
    pub total_bytes: u64,
}

/// Copy every regular file of `root` into `dest`, skipping sandbox-internal
/// directories and temp files. Temp files are deleted when `cleanup_temp`.
pub(crate) fn copy_into_archive(
    root: &Path,
    dest: &Path,
    cleanup_temp: bool,
) -> SandboxResult<CopyStats> {
    let matcher = temp_matcher()?;
    let mut stats = CopyStats {
        files_archived: 0,
        temp_files_removed: 0,
        total_bytes: 0,
    };
    let mut temp_dirs: Vec<PathBuf> = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && is_excluded_root(entry.file_name())));

    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf);
            SandboxError::io(path, "walk workspace", err.into())
        })?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };

        if entry.file_type().is_dir() {
            if entry.file_name() == "__pycache__" {
                temp_dirs.push(entry.path().to_path_buf());
            }
            continue;
        }
        if !entry.file_type().is_file() {
            debug!("archive skips non-regular file {}", rel.display());
            continue;
        }

        if is_temp(&matcher, &rel) {
            if cleanup_temp {
                match fs::remove_file(entry.path()) {
                    Ok(()) => stats.temp_files_removed += 1,
                    Err(err) => warn!("failed to remove temp file {}: {}", rel.display(), err),
                }
            }
            continue;
        }

        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SandboxError::io(parent.to_path_buf(), "create archive directory", e))?;
        }
        let copied = fs::copy(entry.path(), &target)
            .map_err(|e| SandboxError::io(entry.path().to_path_buf(), "copy into archive", e))?;
        stats.files_archived += 1;
        stats.total_bytes += copied;
    }

    if cleanup_temp {
        // Deepest first so nested caches empty their parents.
        temp_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in temp_dirs {
            // Only succeeds when empty; anything left in there is not ours.
            let _ = fs::remove_dir(&dir);
        }
    }

    Ok(stats)
}

/// `rel` under `root` with every existing symlink followed. Anything that
/// lands outside the root is a security error.
pub(crate) fn confine(root: &Path, rel: &Path) -> SandboxResult<PathBuf> {
    canonicalize_within_root(root, rel).map_err(|err| match err.kind() {
        std::io::ErrorKind::PermissionDenied => SandboxError::security(format!(
            "path outside workspace: '{}' resolves outside the workspace",
            rel.display()
        )),
        _ => SandboxError::io(root.join(rel), "resolve path", err),
    })
}

/// Copy an archive back over `root`, leaving the manifest behind.
///
/// Every target is resolved before anything is written, so a symlink planted
/// in the workspace since the archive was taken aborts the restore untouched.
pub(crate) fn copy_from_archive(archive: &Path, root: &Path) -> SandboxResult<Vec<PathBuf>> {
    let mut plan = Vec::new();
    for entry in WalkDir::new(archive).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf);
            SandboxError::io(path, "walk archive", err.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(archive) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        if rel == Path::new(MANIFEST_FILE) {
            continue;
        }
        let target = confine(root, &rel)?;
        plan.push((entry.into_path(), target, rel));
    }

    let mut restored = Vec::with_capacity(plan.len());
    for (source, target, rel) in plan {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SandboxError::io(parent.to_path_buf(), "create restore directory", e))?;
        }
        fs::copy(&source, &target)
            .map_err(|e| SandboxError::io(target.clone(), "restore file", e))?;
        restored.push(rel);
    }
    Ok(restored)
}

pub(crate) fn write_manifest(dest: &Path, manifest: &ArchiveManifest) -> SandboxResult<()> {
    let path = dest.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(manifest).map_err(|err| SandboxError::Execution {
        message: format!("failed to serialise archive manifest: {}", err),
    })?;
    fs::write(&path, json).map_err(|e| SandboxError::io(path, "write archive manifest", e))
}

pub fn read_manifest(dest: &Path) -> SandboxResult<ArchiveManifest> {
    let path = dest.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|e| SandboxError::io(path.clone(), "read archive manifest", e))?;
    serde_json::from_slice(&raw).map_err(|err| SandboxError::Execution {
        message: format!("corrupt archive manifest {}: {}", path.display(), err),
    })
}

fn is_excluded_root(name: &std::ffi::OsStr) -> bool {
    EXCLUDED_ROOTS.iter().any(|excluded| name == *excluded)
}
