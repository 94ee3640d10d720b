use std::io;
use std::path::{Component, Path, PathBuf};

#[cfg(windows)]
use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
};

/// Minimal view of `/proc/[pid]/stat`
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub state: char,
    pub ppid: u32,
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat`.
///
/// The command name (field 2) may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[cfg(target_os = "linux")]
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{}/stat", pid);
    let content = std::fs::read_to_string(&path)?;
    let invalid = |what: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Missing {} field in {}", what, path),
        )
    };

    let tail = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| invalid("comm"))?;
    let parts: Vec<&str> = tail.split_whitespace().collect();

    // parts[0] is field 3 (state), parts[1] field 4 (ppid), parts[19] field 22 (starttime)
    let state = parts
        .first()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| invalid("state"))?;
    let ppid = parts
        .get(1)
        .ok_or_else(|| invalid("ppid"))?
        .parse::<u32>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse ppid in {}: {}", path, err),
            )
        })?;
    let starttime = parts
        .get(19)
        .ok_or_else(|| invalid("starttime"))?
        .parse::<u64>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse starttime in {}: {}", path, err),
            )
        })?;

    Ok(ProcStat {
        state,
        ppid,
        starttime,
    })
}

/// Whether `pid` refers to a live process. Zombies count as dead.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    read_proc_stat(pid)
        .map(|stat| !matches!(stat.state, 'Z' | 'X' | 'x'))
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

/// Canonicalise `candidate` relative to `root`, refusing anything that resolves
/// outside of it.
///
/// The path is walked component by component the way the kernel does it: a
/// symlink is followed as soon as it is reached, so `link/..` lands next to the
/// link target and not back in `root`. The non-existent suffix is kept
/// lexically.
pub fn canonicalize_within_root(root: &Path, candidate: &Path) -> io::Result<PathBuf> {
    let root = std::fs::canonicalize(root)?;
    let combined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = resolve_physically(&combined)?;

    if !resolved.starts_with(&root) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "Path {} escapes sandbox root {}",
                resolved.display(),
                root.display()
            ),
        ));
    }

    Ok(resolved)
}

// --- helpers ----------------------------------------------------------------

fn resolve_physically(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    // Once a component is missing nothing below it can be a symlink.
    let mut on_disk = true;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                if !on_disk {
                    continue;
                }
                match std::fs::symlink_metadata(&resolved) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        resolved = std::fs::canonicalize(&resolved).map_err(|err| {
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!("Cannot resolve {}: {}", resolved.display(), err),
                            )
                        })?;
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => on_disk = false,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    if resolved.as_os_str().is_empty() {
        resolved.push(".");
    }
    Ok(resolved)
}
