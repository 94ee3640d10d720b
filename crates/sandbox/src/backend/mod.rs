use anyhow::Result;
use std::io;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Environment variable holding the per-spawn tag. Every process started by a
/// command inherits it unless it rewrites its own environment.
pub const RUN_TAG_VAR: &str = "WARDEN_RUN_TAG";

pub trait SandboxBackend: Send {
    type Child: ProcessHandle;

    /// Spawn `cmd` in a fresh kill domain. Stdio must already be configured.
    fn spawn(&mut self, cmd: Command) -> Result<Self::Child>;
    fn set_memory_limit(&mut self, bytes: u64) -> Result<()>;
}

pub trait ProcessHandle: Send {
    fn id(&self) -> u32;
    /// Shared termination handle for this child's whole tree.
    fn group(&self) -> Arc<dyn ProcessGroup>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    fn take_stdout(&mut self) -> Option<ChildStdout>;
    fn take_stderr(&mut self) -> Option<ChildStderr>;
    fn take_stdin(&mut self) -> Option<ChildStdin>;
}

/// Kill domain of one spawned command.
///
/// All methods tolerate the group being gone already: signalling an empty
/// group returns `Ok(())`.
pub trait ProcessGroup: Send + Sync {
    fn leader(&self) -> u32;
    /// Ask every member to exit, descendants before the leader.
    fn terminate(&self) -> io::Result<()>;
    /// Forcefully kill every member still alive.
    fn kill(&self) -> io::Result<()>;
    fn is_running(&self) -> bool;

    /// Terminate, give the tree `grace` to exit, then kill stragglers.
    fn shutdown(&self, grace: Duration) -> io::Result<()> {
        self.terminate()?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.is_running() {
            std::thread::sleep(Duration::from_millis(20));
        }
        // Always sent: orphaned members are invisible to `is_running`.
        self.kill()
    }
}

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;
