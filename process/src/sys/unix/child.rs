use std::io;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use super::pipe::wait_readable;
use super::process_group;
use crate::error::ProcessError;
use crate::error::Result;
use crate::options::SessionOptions;
use crate::sys::ChildStdio;
use crate::sys::Launcher;

const EXIT_PROBE_SLICE: Duration = Duration::from_millis(10);

/// What a [`Launcher`] returns on Unix.
pub type Launched = Child;

/// The prepared process-creation request.
///
/// The command already carries the argv split from the command line and the
/// child's stdin/stdout/stderr wiring; a custom [`Launcher`] may add
/// environment, working directory, or `pre_exec` hooks before spawning it.
pub struct LaunchRequest<'a> {
    command_line: &'a str,
    command: &'a mut Command,
}

impl LaunchRequest<'_> {
    pub fn command_line(&self) -> &str {
        self.command_line
    }

    pub fn command(&mut self) -> &mut Command {
        self.command
    }
}

/// A launched child plus its process-exit readiness source.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    /// Linux pidfd; readable once the child has exited.
    pidfd: Option<OwnedFd>,
    process_group: bool,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    fn new(child: Child, process_group: bool) -> Self {
        let pidfd = open_pidfd(child.id());
        Self {
            child,
            pidfd,
            process_group,
            status: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Cached exit code; `None` until exit has been collected.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.map(exit_code_of)
    }

    pub(crate) fn exit_fd(&self) -> Option<BorrowedFd<'_>> {
        self.pidfd.as_ref().map(AsFd::as_fd)
    }

    pub(crate) fn has_status(&self) -> bool {
        self.status.is_some()
    }

    /// Waits up to `timeout` for the child to exit without reaping it.
    pub(crate) fn probe_exit(&self, timeout: Duration) -> io::Result<bool> {
        if self.status.is_some() {
            return Ok(true);
        }
        if let Some(pidfd) = &self.pidfd {
            return wait_readable(pidfd.as_fd(), timeout);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.probe_exit_now()? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            std::thread::sleep(remaining.min(EXIT_PROBE_SLICE));
        }
    }

    /// Zero-wait exit check that leaves the child unreaped.
    pub(crate) fn probe_exit_now(&self) -> io::Result<bool> {
        if self.status.is_some() {
            return Ok(true);
        }
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                self.child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        // With WNOHANG, si_pid stays zero while the child is still running.
        Ok(unsafe { info.si_pid() } != 0)
    }

    /// Reaps the child if it has exited and caches its exit code.
    pub(crate) fn collect_exit_code(&mut self) -> io::Result<Option<i32>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.exit_code())
    }

    pub(crate) fn terminate(&self) -> io::Result<()> {
        // Once reaped the pid may belong to an unrelated process.
        if self.status.is_some() {
            return Ok(());
        }
        if self.process_group {
            process_group::kill_process_group(self.child.id())
        } else {
            process_group::kill_process(self.child.id())
        }
    }
}

/// Exit code for a normal exit, `128 + signal` for a signal death.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or_default())
}

#[cfg(target_os = "linux")]
fn open_pidfd(pid: u32) -> Option<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd < 0 {
        debug!(
            pid,
            error = %io::Error::last_os_error(),
            "pidfd_open unavailable; falling back to waitid probing"
        );
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

#[cfg(not(target_os = "linux"))]
fn open_pidfd(_pid: u32) -> Option<OwnedFd> {
    None
}

/// Splits the command line into argv, wires `stdio`, and creates the process
/// through `launcher` (or `Command::spawn`).
pub(crate) fn launch(
    command_line: &str,
    stdio: ChildStdio,
    options: &SessionOptions,
    launcher: Option<&mut dyn Launcher>,
) -> Result<ChildProcess> {
    let argv = shlex::split(command_line).unwrap_or_default();
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::InvalidCommandLine(command_line.to_string()));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::from(stdio.stdin))
        .stdout(Stdio::from(stdio.stdout))
        .stderr(Stdio::from(stdio.stderr));

    let new_process_group = options.new_process_group;
    let parent_death_signal = options.parent_death_signal;
    if new_process_group || parent_death_signal {
        let parent_pid = unsafe { libc::getpid() };
        unsafe {
            command.pre_exec(move || {
                if new_process_group {
                    process_group::set_process_group()?;
                }
                if parent_death_signal {
                    process_group::set_parent_death_signal(parent_pid)?;
                }
                Ok(())
            });
        }
    }

    let spawned = {
        let mut request = LaunchRequest {
            command_line,
            command: &mut command,
        };
        match launcher {
            Some(launcher) => launcher.launch(&mut request),
            None => request.command().spawn(),
        }
    };
    // The command still holds the child's ends; the parent must not keep them
    // open or it would never observe end-of-file.
    drop(command);

    let child = spawned.map_err(|source| ProcessError::ProcessCreation {
        command_line: command_line.to_string(),
        source,
    })?;
    Ok(ChildProcess::new(child, new_process_group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn signal_deaths_map_above_128() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(7 << 8)), 7);
        assert_eq!(exit_code_of(ExitStatus::from_raw(libc::SIGKILL)), 137);
    }
}
