//! Process-group helpers for reliable child process cleanup.
//!
//! Every command runs as the leader of its own session/process group, so the
//! shell pid doubles as the group id and one signal reaches the whole tree:
//! - `detach_from_tty` runs in `pre_exec` and starts a new session so the child
//!   does not inherit the controlling TTY (or receive terminal Ctrl+C).
//! - `set_parent_death_signal` (Linux only) delivers `SIGTERM` to the child if
//!   the runtime itself dies.
//! - `signal_process_tree` targets the whole group by its leader pid.
//!
//! On non-Unix platforms the helpers fall back to terminating the single
//! process.

use std::io;

/// Signal to send when stopping a process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM - allows graceful shutdown
    #[default]
    Term,
    /// SIGKILL - immediate termination
    Kill,
}

#[cfg(unix)]
impl KillSignal {
    fn as_libc_signal(self) -> libc::c_int {
        match self {
            KillSignal::Term => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Ensure the child receives SIGTERM when the original parent dies.
///
/// Must run inside `pre_exec`; `parent_pid` is captured before the fork so a
/// parent that exits between fork and exec is still detected.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }

    Ok(())
}

/// Start a new session so the child leads its own process group.
#[cfg(unix)]
pub fn detach_from_tty() -> io::Result<()> {
    let result = unsafe { libc::setsid() };
    if result == -1 {
        let err = io::Error::last_os_error();
        // EPERM means we're already a session leader, fall back to setpgid
        if err.raw_os_error() == Some(libc::EPERM) {
            return set_process_group();
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Send `signal` to the process group led by `leader_pid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_process_tree(leader_pid: u32, signal: KillSignal) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(leader_pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("pid {leader_pid} out of range"),
        ));
    };

    if unsafe { libc::killpg(pgid, signal.as_libc_signal()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Windows has no process groups here; terminate the process itself.
#[cfg(windows)]
pub fn signal_process_tree(leader_pid: u32, _signal: KillSignal) -> io::Result<()> {
    unsafe {
        let handle = winapi::um::processthreadsapi::OpenProcess(
            winapi::um::winnt::PROCESS_TERMINATE,
            0,
            leader_pid,
        );
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        let success = winapi::um::processthreadsapi::TerminateProcess(handle, 1);
        let err = io::Error::last_os_error();
        winapi::um::handleapi::CloseHandle(handle);
        if success == 0 { Err(err) } else { Ok(()) }
    }
}

#[cfg(not(any(unix, windows)))]
pub fn signal_process_tree(_leader_pid: u32, _signal: KillSignal) -> io::Result<()> {
    Ok(())
}

/// Check whether any member of the group led by `leader_pid` is still alive.
#[cfg(unix)]
pub fn is_process_tree_alive(leader_pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(leader_pid) else {
        return false;
    };
    // Signal 0 probes for existence without delivering anything
    if unsafe { libc::killpg(pgid, 0) } == 0 {
        return true;
    }
    // EPERM: exists but owned by someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_tree_alive(_leader_pid: u32) -> bool {
    false
}
