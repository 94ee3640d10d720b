//! # Warden Core
//!
//! Runs build and test commands on behalf of an LLM agent without letting
//! them escape a designated workspace or exhaust the host.
//!
//! ## Architecture
//!
//! - **Path validation**: every path an agent names is resolved against the
//!   workspace root and rejected if it leaves it
//! - **Command policy**: allow/deny tables, per-ecosystem subcommand rules and
//!   a dangerous-pattern scan decide what may run
//! - **Process runner**: spawns approved commands in their own process group
//!   with a scrubbed environment, capped output and a wall-clock timeout
//! - **Resource monitor**: optional watchdog killing trees that exceed memory
//!   or sustained CPU limits
//! - **Workspaces**: creation from templates, setup, session archives and
//!   teardown
//!
//! [`Sandbox`] ties these together and is what callers normally use.

pub mod config;
pub mod errors;
pub mod file_ops;
pub mod monitor;
pub mod path_security;
pub mod policy;
pub mod runner;
pub mod sandbox;
pub mod script;
pub mod workspace;

pub use config::{ResourceConfig, SandboxConfig, WorkspaceSettings};
pub use errors::{ErrorCategory, SandboxError, SandboxResult};
pub use file_ops::{FileEntry, FileOps, FileType};
pub use monitor::{CancelToken, ResourceLimits, ResourceMonitor, TerminationReason};
pub use path_security::PathValidator;
pub use policy::{CommandOptions, CommandPolicy, CommandSpec, CommandValidator, ValidationVerdict};
pub use runner::{ExecutionResult, ProcessRunner, RunOptions};
pub use sandbox::{ExecOptions, Sandbox};
pub use script::{ScriptStaging, StagedScript};
pub use workspace::{
    ArchiveManifest, RestoredFiles, SetupOutcome, SetupResult, SetupStep, Template, Workspace,
    WorkspaceManager, WorkspaceRegistry, WorkspaceStatus,
};
