use crate::errors::{SandboxError, SandboxResult};
use std::io;
use std::path::{Component, Path, PathBuf};
use warden_common::process_utils::canonicalize_within_root;

/// Locations no workspace path may ever point into.
pub const DEFAULT_FORBIDDEN_PATHS: &[&str] = &[
    "/etc",
    "/usr",
    "/bin",
    "/sbin",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/root",
    "/var/run",
    "C:\\Windows",
    "C:\\Program Files",
];

/// Resolves caller-supplied paths against a workspace root.
///
/// Every path the sandbox touches goes through [`PathValidator::resolve`]. The
/// result is an absolute path that is a descendant of the canonical root, with
/// symlinks along the existing prefix already followed.
#[derive(Debug, Clone)]
pub struct PathValidator {
    forbidden: Vec<String>,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new(DEFAULT_FORBIDDEN_PATHS.iter().map(|s| s.to_string()))
    }
}

impl PathValidator {
    pub fn new<I, S>(forbidden: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let forbidden = forbidden
            .into_iter()
            .map(|entry| normalize_separators(&entry.into()))
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { forbidden }
    }

    pub fn forbidden(&self) -> &[String] {
        &self.forbidden
    }

    /// Resolve `candidate` inside `root`.
    ///
    /// Relative candidates are joined to the root, absolute ones are taken as
    /// is and must already point inside it.
    pub fn resolve<P: AsRef<Path>>(&self, root: &Path, candidate: P) -> SandboxResult<PathBuf> {
        let candidate = candidate.as_ref();
        let raw = candidate.to_string_lossy();

        if raw.contains('\0') {
            return Err(SandboxError::security(format!(
                "path '{}' contains a NUL byte",
                raw.escape_default()
            )));
        }

        let canonical_root = root
            .canonicalize()
            .map_err(|e| SandboxError::io(root.to_path_buf(), "canonicalize workspace root", e))?;

        if candidate.is_relative() && escapes_lexically(candidate) {
            return Err(SandboxError::security(format!(
                "path traversal detected: '{}' escapes the workspace",
                candidate.display()
            )));
        }

        let resolved = match canonicalize_within_root(&canonical_root, candidate) {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                let what = if has_parent_component(candidate) {
                    "path traversal detected"
                } else {
                    "path outside workspace"
                };
                return Err(SandboxError::security(format!(
                    "{}: '{}' resolves outside the workspace",
                    what,
                    candidate.display()
                )));
            }
            Err(err) => {
                return Err(SandboxError::io(
                    candidate.to_path_buf(),
                    "resolve path",
                    err,
                ))
            }
        };

        if has_parent_component(&resolved) {
            return Err(SandboxError::security(format!(
                "path traversal detected: '{}' still contains '..'",
                resolved.display()
            )));
        }

        let below_root = resolved
            .strip_prefix(&canonical_root)
            .unwrap_or(Path::new(""));
        self.check_forbidden(candidate, below_root)?;

        Ok(resolved)
    }

    /// `absolute` expressed relative to `root`, for reporting.
    pub fn relative(root: &Path, absolute: &Path) -> PathBuf {
        if let Ok(rel) = absolute.strip_prefix(root) {
            return rel.to_path_buf();
        }
        if let Ok(canonical_root) = root.canonicalize() {
            if let Ok(rel) = absolute.strip_prefix(&canonical_root) {
                return rel.to_path_buf();
            }
        }
        absolute.to_path_buf()
    }

    // Forbidden locations are matched against the part below the root only, so
    // a workspace living under e.g. /usr/src keeps working.
    fn check_forbidden(&self, candidate: &Path, below_root: &Path) -> SandboxResult<()> {
        let mut text = String::from("/");
        text.push_str(&normalize_separators(&below_root.to_string_lossy()));

        for entry in &self.forbidden {
            if contains_at_boundary(&text, entry) {
                return Err(SandboxError::security(format!(
                    "path '{}' touches forbidden location '{}'",
                    candidate.display(),
                    entry
                )));
            }
        }
        Ok(())
    }
}

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// True when `..` climbs above the starting directory at any point.
fn escapes_lexically(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

fn normalize_separators(raw: &str) -> String {
    raw.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Substring match that only counts when the match ends on a path boundary,
/// so `/bin` matches `/bin/ls` but not `/binaries`.
fn contains_at_boundary(haystack: &str, needle: &str) -> bool {
    let haystack_lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    let mut start = 0;
    while let Some(pos) = haystack_lower[start..].find(&needle_lower) {
        let end = start + pos + needle_lower.len();
        if end == haystack_lower.len() || haystack_lower.as_bytes()[end] == b'/' {
            return true;
        }
        start += pos + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathValidator) {
        (TempDir::new().unwrap(), PathValidator::default())
    }

    #[test]
    fn relative_paths_resolve_inside_root() {
        let (root, validator) = setup();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        let resolved = validator.resolve(root.path(), "src/./main.rs").unwrap();
        assert_eq!(
            resolved,
            root.path().canonicalize().unwrap().join("src/main.rs")
        );
    }

    #[test]
    fn inner_dotdot_that_stays_inside_is_fine() {
        let (root, validator) = setup();
        let resolved = validator.resolve(root.path(), "a/b/../c.txt").unwrap();
        assert!(resolved.ends_with("a/c.txt"));
    }

    #[test]
    fn traversal_is_reported_as_traversal() {
        let (root, validator) = setup();
        let err = validator
            .resolve(root.path(), "../../etc/passwd")
            .unwrap_err();
        assert!(err.is_security());
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let (root, validator) = setup();
        let err = validator.resolve(root.path(), "/etc/passwd").unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let (root, validator) = setup();
        let inside = root.path().canonicalize().unwrap().join("notes.txt");
        assert_eq!(validator.resolve(root.path(), &inside).unwrap(), inside);
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let (root, validator) = setup();
        let err = validator.resolve(root.path(), "file\0.txt").unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn forbidden_names_below_root_are_rejected() {
        let (root, validator) = setup();
        assert!(validator.resolve(root.path(), "mirror/etc/hosts").is_err());
        assert!(validator.resolve(root.path(), "proc").is_err());
        // Boundary-aware: prefixes of other names are fine.
        assert!(validator.resolve(root.path(), "binaries/tool").is_ok());
        assert!(validator.resolve(root.path(), "etcetera.txt").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (root, validator) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();
        let err = validator
            .resolve(root.path(), "escape/loot.txt")
            .unwrap_err();
        assert!(err.is_security());
    }

    #[test]
    fn relative_strips_root() {
        let (root, _) = setup();
        let canonical = root.path().canonicalize().unwrap();
        assert_eq!(
            PathValidator::relative(root.path(), &canonical.join("a/b.txt")),
            PathBuf::from("a/b.txt")
        );
    }
}
