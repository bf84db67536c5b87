//! Process-group control for the privilege helper.
//!
//! The helper is spawned as the leader of a new process group, so a stop request reaches every
//! process it forked (`sudo` runs the command as its own child) instead of only the helper.
//!
//! On non-Unix platforms the group is not created and signalling reports `Unsupported`.

#![allow(unsafe_code)]

use std::ffi::OsStr;
use std::io;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Signal {
    /// Relayed by `sudo` to the command it runs.
    Term,
    Kill,
    /// Signal 0: delivers nothing, only reports whether members exist and can be signalled.
    Exists,
}

/// `async-process` command whose child becomes the leader of a new process group.
///
/// The group id equals the child's pid.
pub(crate) fn command_in_new_group(program: &OsStr) -> async_process::Command {
    #[cfg_attr(not(unix), allow(unused_mut))]
    let mut cmd = std::process::Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    async_process::Command::from(cmd)
}

#[cfg(unix)]
/// Send `signal` to every process in `pgid`.
///
/// A group that no longer exists is not an error. `PermissionDenied` means no member could be
/// signalled, e.g. a command `pkexec` runs as root.
pub(crate) fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process group id out of range"))?;
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
        Signal::Exists => 0,
    };

    // SAFETY: killpg only takes integers and does not touch this process's memory.
    let result = unsafe { libc::killpg(pgid, signal) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
