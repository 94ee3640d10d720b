use super::{ProcessGroup, ProcessHandle, SandboxBackend, RUN_TAG_VAR};
use crate::tree;
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use warden_common::process_utils::process_alive;

#[derive(Debug, Default, Clone)]
pub struct UnixSandbox {
    memory_limit_bytes: Option<u64>,
}

impl UnixSandbox {
    pub fn new() -> io::Result<Self> {
        Ok(Self::default())
    }
}

impl SandboxBackend for UnixSandbox {
    type Child = UnixChild;

    fn spawn(&mut self, mut cmd: Command) -> Result<Self::Child> {
        let memory_limit = self.memory_limit_bytes;
        let tag = Uuid::new_v4().simple().to_string();
        cmd.env(RUN_TAG_VAR, &tag);

        unsafe {
            cmd.pre_exec(move || {
                // New process group so the whole subtree can be signalled at once.
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }

                if let Some(bytes) = memory_limit {
                    let limit = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let group = Arc::new(UnixProcessGroup::new(child.id(), tag));
        Ok(UnixChild { child, group })
    }

    fn set_memory_limit(&mut self, bytes: u64) -> Result<()> {
        self.memory_limit_bytes = Some(bytes);
        Ok(())
    }
}

pub struct UnixChild {
    child: Child,
    group: Arc<UnixProcessGroup>,
}

impl ProcessHandle for UnixChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn group(&self) -> Arc<dyn ProcessGroup> {
        self.group.clone()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.group.mark_reaped();
        Ok(status)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.group.mark_reaped();
        }
        Ok(status)
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }
}

/// POSIX process group whose id equals the leader's pid.
///
/// A member that calls `setsid()` leaves the group, and one whose parent
/// exits is reparented out of the leader's tree. Both still carry the run tag,
/// so every signal also goes to the tagged processes.
#[derive(Debug)]
pub struct UnixProcessGroup {
    pgid: u32,
    tag: String,
    // Once the leader is reaped its pid may be recycled, so the tree walk from
    // the leader is no longer trustworthy.
    reaped: AtomicBool,
}

impl UnixProcessGroup {
    pub fn new(pgid: u32, tag: String) -> Self {
        Self {
            pgid,
            tag,
            reaped: AtomicBool::new(false),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    fn signal_tree(&self, signal: Signal) -> io::Result<()> {
        let mut targets = Vec::new();
        if !self.reaped.load(Ordering::SeqCst) {
            targets.extend(tree::descendants(self.pgid));
        }
        for pid in tree::tagged(RUN_TAG_VAR, &self.tag) {
            if pid != self.pgid && !targets.contains(&pid) {
                targets.push(pid);
            }
        }
        for pid in targets {
            if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
                debug!("signal {:?} to member {} failed: {}", signal, pid, err);
            }
        }

        match killpg(Pid::from_raw(self.pgid as i32), signal) {
            Ok(()) => Ok(()),
            // Group already empty, or only foreign processes left in it.
            Err(Errno::ESRCH) | Err(Errno::EPERM) => Ok(()),
            Err(err) => Err(io::Error::from(err)),
        }
    }
}

impl ProcessGroup for UnixProcessGroup {
    fn leader(&self) -> u32 {
        self.pgid
    }

    fn terminate(&self) -> io::Result<()> {
        self.signal_tree(Signal::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.signal_tree(Signal::SIGKILL)
    }

    fn is_running(&self) -> bool {
        if self.reaped.load(Ordering::SeqCst) {
            return killpg(Pid::from_raw(self.pgid as i32), None).is_ok();
        }
        process_alive(self.pgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    fn spawn_sleep(secs: &str) -> UnixChild {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        UnixSandbox::new().unwrap().spawn(cmd).expect("spawn sleep")
    }

    #[test]
    fn child_leads_its_own_group() {
        let mut child = spawn_sleep("5");
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(child.id() as i32))).unwrap();
        assert_eq!(pgid.as_raw() as u32, child.id());
        child.group().kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn shutdown_stops_the_group() {
        let mut child = spawn_sleep("30");
        let group = child.group();
        let started = Instant::now();
        group.shutdown(Duration::from_millis(500)).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn memory_limit_becomes_an_address_space_rlimit() {
        let mut sandbox = UnixSandbox::new().unwrap();
        sandbox.set_memory_limit(512 * 1024 * 1024).unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("ulimit -v")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = sandbox.spawn(cmd).unwrap();
        let mut out = String::new();
        std::io::Read::read_to_string(&mut child.take_stdout().unwrap(), &mut out).unwrap();
        child.wait().unwrap();
        assert_eq!(out.trim(), "524288");
    }

    #[test]
    fn kill_reaches_members_that_left_the_session() {
        if !["/usr/bin/setsid", "/bin/setsid"]
            .iter()
            .any(|path| std::path::Path::new(path).exists())
        {
            return;
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("setsid sleep 30 & sleep 0.3")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = UnixSandbox::new().unwrap().spawn(cmd).unwrap();
        child.wait().unwrap();
        let tag = child.group.tag().to_string();
        assert!(!tree::tagged(RUN_TAG_VAR, &tag).is_empty());

        child.group().kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !tree::tagged(RUN_TAG_VAR, &tag).is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(tree::tagged(RUN_TAG_VAR, &tag).is_empty());
    }

    #[test]
    fn killing_a_reaped_group_is_a_no_op() {
        let mut child = spawn_sleep("0");
        child.wait().unwrap();
        let group = child.group();
        assert!(group.kill().is_ok());
        assert!(group.terminate().is_ok());
        assert!(!group.is_running());
    }
}
