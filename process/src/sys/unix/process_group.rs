//! Signal plumbing behind `SessionOptions::new_process_group` and
//! `SessionOptions::parent_death_signal`.
//!
//! The two `pre_exec` hooks run between fork and exec of the child. The kill
//! helpers back `ProcessSession::terminate` and kill-on-drop, signalling the
//! whole group when the child leads one.

use std::io;
use std::io::ErrorKind;

/// Signal used for forced termination.
pub(crate) const TERMINATION_SIGNAL: libc::c_int = libc::SIGKILL;

#[cfg(target_os = "linux")]
/// Ties the child's lifetime to the supervising process: the child gets
/// SIGTERM once the supervisor dies. If the supervisor is already gone by the
/// time the hook runs (`getppid` no longer matches `parent_pid`), the child
/// signals itself.
pub(crate) fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    let orphaned = unsafe { libc::getppid() } != parent_pid;
    if orphaned && unsafe { libc::raise(libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
/// Parent-death signals are Linux only; the option is ignored elsewhere.
pub(crate) fn set_parent_death_signal(_parent_pid: libc::pid_t) -> io::Result<()> {
    Ok(())
}

/// Makes the freshly forked child the leader of a new group, so
/// `kill_process_group` also reaches anything it spawns.
pub(crate) fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Signal every process in `process_group_id`. A group that is already gone
/// is not an error.
pub(crate) fn kill_process_group(process_group_id: u32) -> io::Result<()> {
    let pgid = process_group_id as libc::pid_t;
    ignore_not_found(unsafe { libc::killpg(pgid, TERMINATION_SIGNAL) })
}

/// Signal a single process. A process that is already gone is not an error.
pub(crate) fn kill_process(pid: u32) -> io::Result<()> {
    ignore_not_found(unsafe { libc::kill(pid as libc::pid_t, TERMINATION_SIGNAL) })
}

fn ignore_not_found(result: libc::c_int) -> io::Result<()> {
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound && err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}
