//! Platform process isolation for the warden runner.
//!
//! A spawned command always lives in its own kill domain: a process group on
//! POSIX, a job object on Windows. [`ProcessGroup`] is the handle used to tear
//! that domain down; it is shared between the runner's wait loop and the
//! resource watchdog, so every termination call is idempotent.

pub mod backend;
pub mod tree;

pub use backend::{ProcessGroup, ProcessHandle, SandboxBackend, RUN_TAG_VAR};

#[cfg(unix)]
pub type PlatformSandbox = backend::unix::UnixSandbox;

#[cfg(windows)]
pub type PlatformSandbox = backend::windows::WindowsSandbox;
