use anyhow::{bail, Context, Result};
use path_clean::PathClean;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
    CreateNew,
}

/// Writes files below a single root without ever leaving a partially written
/// file behind.
///
/// Content is size-checked before anything touches the disk. Overwrites go to a
/// sibling temp file that is renamed over the target.
pub struct SafeFileWriter {
    root: PathBuf,
    max_file_size: Option<usize>,
}

impl SafeFileWriter {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve root '{}'", root.display()))?;
        Ok(Self {
            root,
            max_file_size: Some(10 * 1024 * 1024), // 10MB default max
        })
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_file_size = max_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_path(&self, path: &Path) -> Result<()> {
        let cleaned_path = path.clean();

        if !cleaned_path.is_absolute() {
            bail!(
                "path '{}' must be resolved against the root before writing",
                path.display()
            );
        }

        if !cleaned_path.starts_with(&self.root) {
            bail!(
                "path '{}' is outside of root '{}'",
                path.display(),
                self.root.display()
            );
        }

        if cleaned_path == self.root {
            bail!("refusing to write over the root directory itself");
        }

        Ok(())
    }

    fn validate_size(&self, total: usize) -> Result<()> {
        if let Some(max_size) = self.max_file_size {
            if total > max_size {
                bail!("content size {} exceeds maximum {} bytes", total, max_size);
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path, content: &[u8], mode: WriteMode) -> Result<()> {
        self.validate_path(path)?;

        let existing_len = match mode {
            WriteMode::Append => fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0),
            _ => 0,
        };
        self.validate_size(existing_len.saturating_add(content.len()))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create parent directories for '{}'",
                        parent.display()
                    )
                })?;
            }
        }

        match mode {
            WriteMode::Overwrite => self.replace_atomically(path, content)?,
            WriteMode::Append => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open '{}' for append", path.display()))?;

                file.write_all(content)
                    .with_context(|| format!("failed to append data into '{}'", path.display()))?;
            }
            WriteMode::CreateNew => {
                if path.exists() {
                    bail!("file '{}' already exists", path.display());
                }
                self.replace_atomically(path, content)?;
            }
        }

        Ok(())
    }

    pub fn write_text(&self, path: &Path, content: &str, mode: WriteMode) -> Result<()> {
        self.write(path, content.as_bytes(), mode)
    }

    fn replace_atomically(&self, path: &Path, content: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(
            ".{}.{}.tmp",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let result = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .with_context(|| format!("failed to create '{}'", temp_path.display()))?;
            file.write_all(content)
                .with_context(|| format!("failed to write '{}'", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync '{}'", temp_path.display()))?;
            fs::rename(&temp_path, path)
                .with_context(|| format!("failed to move data into '{}'", path.display()))?;
            Ok(())
        })();

        if result.is_err() {
            if let Err(err) = fs::remove_file(&temp_path) {
                tracing::debug!("temp file {} not removed: {}", temp_path.display(), err);
            }
        }

        result
    }
}
