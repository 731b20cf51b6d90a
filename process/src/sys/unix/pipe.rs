use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use super::AccessPolicy;
use super::ChildProcess;
use super::access::OWNER_ONLY_MODE;
use super::cvt;
use crate::options::SessionOptions;
use crate::sys::Source;

/// Poll slice used when the child has no pidfd and exit must be probed.
const EXIT_PROBE_SLICE: Duration = Duration::from_millis(10);

pub(crate) fn pipe_name(options: &SessionOptions, token: &str) -> PathBuf {
    options
        .resolved_pipe_dir()
        .join(format!("{}.{token}", options.pipe_name_prefix))
}

/// Creates an owner-only FIFO at `name`, opens both ends, and unlinks it.
///
/// The read end is opened first (non-blocking, so the open does not wait for
/// a writer), then the write end; both are close-on-exec. Once both are open
/// the name is removed, leaving a pipe reachable only through the two
/// descriptors.
pub(crate) fn create_pipe(name: &Path, policy: &AccessPolicy) -> io::Result<(OwnedFd, OwnedFd)> {
    let c_name = CString::new(name.as_os_str().as_bytes())?;
    cvt(unsafe { libc::mkfifo(c_name.as_ptr(), OWNER_ONLY_MODE) })?;
    let _unlink = UnlinkOnDrop(&c_name);
    // mkfifo honours the umask; pin the mode exactly.
    cvt(unsafe { libc::chmod(c_name.as_ptr(), OWNER_ONLY_MODE) })?;

    let read = open(
        &c_name,
        libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC | libc::O_NOFOLLOW,
    )?;
    policy.verify(read.as_fd())?;
    let write = open(&c_name, libc::O_WRONLY | libc::O_CLOEXEC | libc::O_NOFOLLOW)?;
    policy.verify(write.as_fd())?;

    // The read end may be handed to a child as its stdin.
    set_nonblocking(read.as_fd(), false)?;
    Ok((read, write))
}

/// Duplicates `end` into a new owned descriptor.
///
/// The duplicate stays close-on-exec: `std::process::Command` installs it on
/// the child's standard slot with `dup2`, which is the only place it is
/// inherited.
pub(crate) fn duplicate_inheritable(end: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    end.try_clone_to_owned()
}

/// Number of bytes that can be read from `end` without blocking.
pub(crate) fn bytes_available(end: BorrowedFd<'_>) -> io::Result<usize> {
    let mut available: libc::c_int = 0;
    cvt(unsafe {
        libc::ioctl(
            end.as_raw_fd(),
            libc::FIONREAD,
            &mut available as *mut libc::c_int,
        )
    })?;
    Ok(available.max(0) as usize)
}

/// Waits until one of the three sources is ready and returns the first ready
/// one in `order`, or `None` once `timeout` elapses.
pub(crate) fn wait_any(
    stdout: BorrowedFd<'_>,
    stderr: BorrowedFd<'_>,
    child: &ChildProcess,
    order: [Source; 3],
    timeout: Duration,
) -> io::Result<Option<Source>> {
    let deadline = Instant::now() + timeout;
    loop {
        let exit_fd = child.exit_fd();
        let exit_known = child.has_status();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = if exit_known {
            Duration::ZERO
        } else if exit_fd.is_none() {
            remaining.min(EXIT_PROBE_SLICE)
        } else {
            remaining
        };

        let mut fds = [
            poll_fd(stdout.as_raw_fd()),
            poll_fd(stderr.as_raw_fd()),
            // poll(2) skips negative descriptors.
            poll_fd(exit_fd.map_or(-1, |fd| fd.as_raw_fd())),
        ];
        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                poll_timeout_ms(slice),
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        let exit_ready = exit_known
            || match exit_fd {
                Some(_) => fds[2].revents != 0,
                None => child.probe_exit_now()?,
            };
        for source in order {
            let ready = match source {
                Source::Stdout => fds[0].revents != 0,
                Source::Stderr => fds[1].revents != 0,
                Source::Exit => exit_ready,
            };
            if ready {
                return Ok(Some(source));
            }
        }

        if Instant::now() >= deadline {
            return Ok(None);
        }
    }
}

/// Blocks for at most `timeout` until `fd` becomes readable.
pub(super) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut fds = [poll_fd(fd.as_raw_fd())];
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, poll_timeout_ms(remaining)) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted && Instant::now() < deadline {
                continue;
            }
            return Err(err);
        }
        return Ok(fds[0].revents != 0);
    }
}

fn poll_fd(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Rounds up so that a sub-millisecond remainder still sleeps.
fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_micros().div_ceil(1000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

fn open(name: &CStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::open(name.as_ptr(), flags) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) })?;
    Ok(())
}

struct UnlinkOnDrop<'a>(&'a CStr);

impl Drop for UnlinkOnDrop<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::unlink(self.0.as_ptr());
        }
    }
}
