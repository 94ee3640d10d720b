//! # File Operations
//!
//! Read, write and list files inside one workspace. Every path goes through
//! [`PathValidator`] first and writes are bounded by the configured maximum
//! file size, checked before anything touches the disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use warden_common::fs::{SafeFileWriter, WriteMode};

use crate::errors::{SandboxError, SandboxResult};
use crate::path_security::PathValidator;
use crate::workspace::archive::ARCHIVE_DIR;

/// File entry with metadata for listing operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Relative to the workspace root
    pub path: PathBuf,
    pub entry_type: FileType,
    /// None for directories
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

pub struct FileOps<'a> {
    root: &'a Path,
    paths: &'a PathValidator,
    max_file_size: usize,
}

impl<'a> FileOps<'a> {
    pub fn new(root: &'a Path, paths: &'a PathValidator, max_file_size: usize) -> Self {
        Self {
            root,
            paths,
            max_file_size,
        }
    }

    pub fn read_file(&self, rel: &str) -> SandboxResult<String> {
        let path = self.paths.resolve(self.root, rel)?;
        let metadata =
            fs::metadata(&path).map_err(|e| SandboxError::io(path.clone(), "read file metadata", e))?;
        if !metadata.is_file() {
            return Err(SandboxError::execution(format!("'{}' is not a file", rel)));
        }
        if metadata.len() > self.max_file_size as u64 {
            return Err(SandboxError::FileTooLarge {
                path,
                size: metadata.len(),
                limit: self.max_file_size as u64,
            });
        }
        fs::read_to_string(&path).map_err(|e| SandboxError::io(path, "read file content", e))
    }

    /// Replace (or create) `rel` with `content`. Parents are created.
    pub fn write_file(&self, rel: &str, content: &str) -> SandboxResult<PathBuf> {
        let path = self.paths.resolve(self.root, rel)?;
        self.check_size(&path, content.len() as u64)?;
        self.writer()?
            .write_text(&path, content, WriteMode::Overwrite)
            .map_err(|err| SandboxError::execution(format!("failed to write '{}': {:#}", rel, err)))?;
        info!(target: "warden", "file written | path={} bytes={}", rel, content.len());
        Ok(PathValidator::relative(self.root, &path))
    }

    pub fn append_file(&self, rel: &str, content: &str) -> SandboxResult<PathBuf> {
        let path = self.paths.resolve(self.root, rel)?;
        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(SandboxError::io(path, "read file metadata", err)),
        };
        self.check_size(&path, existing + content.len() as u64)?;
        self.writer()?
            .write_text(&path, content, WriteMode::Append)
            .map_err(|err| SandboxError::execution(format!("failed to append to '{}': {:#}", rel, err)))?;
        Ok(PathValidator::relative(self.root, &path))
    }

    /// Direct children of `rel`, sorted by name. The archive directory is
    /// left out.
    pub fn list_dir(&self, rel: &str) -> SandboxResult<Vec<FileEntry>> {
        let dir = self.paths.resolve(self.root, rel)?;
        let read = fs::read_dir(&dir).map_err(|e| SandboxError::io(dir.clone(), "list directory", e))?;

        let at_root = dir == self.canonical_root()?;

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| SandboxError::io(dir.clone(), "list directory", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if at_root && name == ARCHIVE_DIR {
                continue;
            }
            let metadata = entry
                .path()
                .symlink_metadata()
                .map_err(|e| SandboxError::io(entry.path(), "read file metadata", e))?;
            let entry_type = if metadata.file_type().is_symlink() {
                FileType::Symlink
            } else if metadata.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            };
            entries.push(FileEntry {
                name,
                path: PathValidator::relative(self.root, &entry.path()),
                entry_type,
                size: metadata.is_file().then(|| metadata.len()),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove one file. Directories and the root itself are refused.
    pub fn delete_file(&self, rel: &str) -> SandboxResult<()> {
        let path = self.paths.resolve(self.root, rel)?;
        if path == self.canonical_root()? {
            return Err(SandboxError::security("refusing to delete the workspace root"));
        }
        let metadata = path
            .symlink_metadata()
            .map_err(|e| SandboxError::io(path.clone(), "read file metadata", e))?;
        if metadata.is_dir() {
            return Err(SandboxError::execution(format!(
                "'{}' is a directory; only files can be deleted",
                rel
            )));
        }
        fs::remove_file(&path).map_err(|e| SandboxError::io(path, "delete file", e))?;
        info!(target: "warden", "file deleted | path={}", rel);
        Ok(())
    }

    pub fn create_dir(&self, rel: &str) -> SandboxResult<PathBuf> {
        let path = self.paths.resolve(self.root, rel)?;
        fs::create_dir_all(&path).map_err(|e| SandboxError::io(path.clone(), "create directory", e))?;
        Ok(PathValidator::relative(self.root, &path))
    }

    fn check_size(&self, path: &Path, size: u64) -> SandboxResult<()> {
        if size > self.max_file_size as u64 {
            return Err(SandboxError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                limit: self.max_file_size as u64,
            });
        }
        Ok(())
    }

    fn writer(&self) -> SandboxResult<SafeFileWriter> {
        SafeFileWriter::new(self.root)
            .map(|writer| writer.with_max_size(Some(self.max_file_size)))
            .map_err(|err| SandboxError::execution(format!("{:#}", err)))
    }

    fn canonical_root(&self) -> SandboxResult<PathBuf> {
        self.root
            .canonicalize()
            .map_err(|e| SandboxError::io(self.root.to_path_buf(), "canonicalize workspace root", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ops<'a>(dir: &'a TempDir, paths: &'a PathValidator) -> FileOps<'a> {
        FileOps::new(dir.path(), paths, 64)
    }

    #[test]
    fn write_then_read_creates_parents() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        let ops = ops(&dir, &paths);
        let rel = ops.write_file("src/lib.py", "x = 1\n").unwrap();
        assert_eq!(rel, PathBuf::from("src/lib.py"));
        assert_eq!(ops.read_file("src/lib.py").unwrap(), "x = 1\n");
        ops.append_file("src/lib.py", "y = 2\n").unwrap();
        assert_eq!(ops.read_file("src/lib.py").unwrap(), "x = 1\ny = 2\n");
    }

    #[test]
    fn oversized_write_leaves_existing_file_untouched() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        let ops = ops(&dir, &paths);
        ops.write_file("data.txt", "small").unwrap();

        let err = ops.write_file("data.txt", &"z".repeat(65)).unwrap_err();
        assert_eq!(err.error_code(), "E_FILE_TOO_LARGE");
        assert_eq!(ops.read_file("data.txt").unwrap(), "small");

        let err = ops.append_file("data.txt", &"z".repeat(60)).unwrap_err();
        assert_eq!(err.error_code(), "E_FILE_TOO_LARGE");
        assert_eq!(ops.read_file("data.txt").unwrap(), "small");
    }

    #[test]
    fn oversized_read_is_refused() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        fs::write(dir.path().join("big.bin"), vec![b'a'; 128]).unwrap();
        let err = ops(&dir, &paths).read_file("big.bin").unwrap_err();
        assert!(matches!(err, SandboxError::FileTooLarge { size: 128, limit: 64, .. }));
    }

    #[test]
    fn traversal_is_rejected_everywhere() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        let ops = ops(&dir, &paths);
        assert!(ops.read_file("../../etc/passwd").unwrap_err().is_security());
        assert!(ops.write_file("../out.txt", "x").unwrap_err().is_security());
        assert!(ops.list_dir("..").unwrap_err().is_security());
        assert!(ops.create_dir("a/../../b").unwrap_err().is_security());
    }

    #[test]
    fn list_is_sorted_and_hides_archive() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        let ops = ops(&dir, &paths);
        ops.write_file("b.txt", "bb").unwrap();
        ops.write_file("a.txt", "a").unwrap();
        ops.create_dir("nested").unwrap();
        ops.create_dir(ARCHIVE_DIR).unwrap();

        let entries = ops.list_dir(".").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "nested"]);
        assert_eq!(entries[1].size, Some(2));
        assert_eq!(entries[2].entry_type, FileType::Directory);
        assert_eq!(entries[2].size, None);
    }

    #[test]
    fn delete_refuses_directories_and_root() {
        let dir = TempDir::new().unwrap();
        let paths = PathValidator::default();
        let ops = ops(&dir, &paths);
        ops.create_dir("keep").unwrap();
        ops.write_file("gone.txt", "x").unwrap();

        assert!(ops.delete_file("keep").is_err());
        assert!(ops.delete_file(".").unwrap_err().is_security());
        ops.delete_file("gone.txt").unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }
}
