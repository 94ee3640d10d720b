//! # Warden Configuration
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (WARDEN_*)
//! 2. Configuration files (warden.toml, .warden/warden.toml)
//! 3. Built-in defaults

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use warden_common::limits::{parse_env_bool, parse_env_u64};

use crate::errors::{SandboxError, SandboxResult};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024; // 1 MiB
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024; // 10 MiB
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_CPU_PERCENT: f64 = 90.0;
pub const DEFAULT_CPU_CONSECUTIVE_SAMPLES: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_KILL_GRACE_MS: u64 = 500;

/// Top-level configuration for a [`Sandbox`](crate::sandbox::Sandbox).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory under which every workspace is created
    pub workspace_base: PathBuf,

    /// Timeout applied when a request does not carry one
    pub default_timeout_secs: u64,

    /// Upper bound for any timeout; larger requests are clamped
    pub max_timeout_secs: u64,

    /// Cap for each of stdout and stderr
    pub max_output_size: usize,

    /// Cap for file reads and writes through the file operations surface
    pub max_file_size: usize,

    /// Time between SIGTERM and SIGKILL when a tree is torn down
    pub kill_grace_ms: u64,

    pub resources: ResourceConfig,

    pub policy: PolicyOverrides,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_base: env::temp_dir().join("warden-workspaces"),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            resources: ResourceConfig::default(),
            policy: PolicyOverrides::default(),
        }
    }
}

/// Watchdog limits. Only enforced when `strict_limits` is on for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub strict_limits: bool,
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
    pub cpu_consecutive_samples: u32,
    pub poll_interval_ms: u64,
    /// Address-space cap applied at spawn (RLIMIT_AS / job memory limit).
    pub hard_memory_limit_bytes: Option<u64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            strict_limits: false,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_cpu_percent: DEFAULT_MAX_CPU_PERCENT,
            cpu_consecutive_samples: DEFAULT_CPU_CONSECUTIVE_SAMPLES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            hard_memory_limit_bytes: None,
        }
    }
}

/// Additions layered on top of the built-in command policy.
///
/// Entries only ever extend the defaults; a command added to `allow` that is
/// also denied stays denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub extra_patterns: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub require_ignore_scripts: Option<bool>,
}

/// Per-workspace overrides passed to `create_workspace`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub default_timeout_secs: Option<u64>,
    pub max_output_size: Option<usize>,
    pub max_file_size: Option<usize>,
    pub strict_limits: Option<bool>,
}

impl SandboxConfig {
    /// Load from an explicit file, `WARDEN_CONFIG`, or the default locations,
    /// then apply environment overrides.
    pub fn load(path_override: Option<PathBuf>) -> SandboxResult<Self> {
        let mut config = match Self::discover_config_path(path_override) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SandboxResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| SandboxError::io(path.to_path_buf(), "read config", source))?;
        debug!("loading configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> SandboxResult<Self> {
        toml::from_str(contents).map_err(|err| SandboxError::Config {
            message: err.to_string(),
        })
    }

    fn discover_config_path(path_override: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = path_override {
            return Some(path);
        }

        if let Ok(from_env) = env::var("WARDEN_CONFIG") {
            let trimmed = from_env.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        let candidates = [
            PathBuf::from("warden.toml"),
            Path::new(".warden").join("warden.toml"),
        ];
        candidates.into_iter().find(|candidate| candidate.is_file())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = parse_env_u64("WARDEN_MAX_TIMEOUT") {
            self.max_timeout_secs = value;
        }
        if let Some(value) = parse_env_u64("WARDEN_DEFAULT_TIMEOUT") {
            self.default_timeout_secs = value;
        }
        if let Some(value) = parse_env_u64("WARDEN_MAX_OUTPUT_SIZE") {
            self.max_output_size = value as usize;
        }
        if let Some(value) = parse_env_u64("WARDEN_MAX_FILE_SIZE") {
            self.max_file_size = value as usize;
        }
        if let Ok(value) = env::var("WARDEN_WORKSPACE_BASE") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.workspace_base = PathBuf::from(trimmed);
            }
        }
        if let Some(value) = parse_env_bool("WARDEN_STRICT_LIMITS") {
            self.resources.strict_limits = value;
        }
    }

    pub fn validate(&self) -> SandboxResult<()> {
        let mut errors = Vec::new();
        if self.max_timeout_secs == 0 {
            errors.push("max_timeout_secs must be at least 1".to_string());
        }
        if self.max_output_size == 0 {
            errors.push("max_output_size must be greater than zero".to_string());
        }
        if self.max_file_size == 0 {
            errors.push("max_file_size must be greater than zero".to_string());
        }
        if self.resources.cpu_consecutive_samples == 0 {
            errors.push("resources.cpu_consecutive_samples must be at least 1".to_string());
        }
        if self.resources.poll_interval_ms == 0 {
            errors.push("resources.poll_interval_ms must be greater than zero".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Config {
                message: errors.join(", "),
            })
        }
    }
}
