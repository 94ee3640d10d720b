use super::{ProcessGroup, ProcessHandle, SandboxBackend};
use anyhow::Result;
use std::io;
use std::mem::{size_of, zeroed};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use warden_common::process_utils::process_alive;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::JobObjects::*;

#[derive(Debug, Default)]
pub struct WindowsSandbox {
    memory_limit: Option<u64>,
}

impl WindowsSandbox {
    pub fn new() -> io::Result<Self> {
        Ok(Self::default())
    }

    fn create_job(&self) -> io::Result<OwnedHandle> {
        let raw_job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
        if raw_job.is_null() {
            return Err(io::Error::last_os_error());
        }
        let job = unsafe { OwnedHandle::from_raw_handle(raw_job as RawHandle) };

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { zeroed() };
        // Closing the last job handle takes the whole tree down with it.
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        if let Some(bytes) = self.memory_limit {
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
            info.ProcessMemoryLimit = bytes as usize;
        }

        let result = unsafe {
            SetInformationJobObject(
                job.as_raw_handle() as HANDLE,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as *mut _,
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(job)
    }
}

impl SandboxBackend for WindowsSandbox {
    type Child = WindowsChild;

    fn spawn(&mut self, mut cmd: Command) -> Result<Self::Child> {
        let job = self.create_job()?;
        let child = cmd.spawn()?;

        let process_handle = child.as_raw_handle() as HANDLE;
        let result = unsafe { AssignProcessToJobObject(job.as_raw_handle() as HANDLE, process_handle) };
        if result == 0 {
            let err = io::Error::last_os_error();
            let mut child = child;
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        let group = Arc::new(WindowsJobGroup {
            job,
            leader: child.id(),
            reaped: AtomicBool::new(false),
        });

        Ok(WindowsChild { child, group })
    }

    fn set_memory_limit(&mut self, bytes: u64) -> Result<()> {
        self.memory_limit = Some(bytes);
        Ok(())
    }
}

pub struct WindowsChild {
    child: Child,
    group: Arc<WindowsJobGroup>,
}

impl ProcessHandle for WindowsChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn group(&self) -> Arc<dyn ProcessGroup> {
        self.group.clone()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.group.reaped.store(true, Ordering::SeqCst);
        Ok(status)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.group.reaped.store(true, Ordering::SeqCst);
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

/// Job object holding the spawned process and everything it creates.
#[derive(Debug)]
pub struct WindowsJobGroup {
    job: OwnedHandle,
    leader: u32,
    reaped: AtomicBool,
}

impl WindowsJobGroup {
    fn terminate_job(&self) -> io::Result<()> {
        let terminated = unsafe { TerminateJobObject(self.job.as_raw_handle() as HANDLE, 1) };
        if terminated == 0 {
            let err = io::Error::last_os_error();
            // Terminating a job with no live processes is not an error for us.
            if !self.is_running() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl ProcessGroup for WindowsJobGroup {
    fn leader(&self) -> u32 {
        self.leader
    }

    // Windows has no graceful tree signal; the job is terminated as a unit.
    fn terminate(&self) -> io::Result<()> {
        self.terminate_job()
    }

    fn kill(&self) -> io::Result<()> {
        self.terminate_job()
    }

    fn is_running(&self) -> bool {
        !self.reaped.load(Ordering::SeqCst) && process_alive(self.leader)
    }
}
