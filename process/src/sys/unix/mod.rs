use std::io;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

mod access;
mod child;
mod pipe;
mod process_group;

pub use access::AccessPolicy;
pub use access::PipeAccess;
pub use child::ChildProcess;
pub use child::LaunchRequest;
pub use child::Launched;
pub(crate) use child::launch;
pub(crate) use pipe::bytes_available;
pub(crate) use pipe::create_pipe;
pub(crate) use pipe::duplicate_inheritable;
pub(crate) use pipe::pipe_name;
pub(crate) use pipe::wait_any;

pub type OwnedEnd = OwnedFd;
pub type BorrowedEnd<'a> = BorrowedFd<'a>;

pub(crate) fn borrow_end<T: AsFd>(owner: &T) -> BorrowedFd<'_> {
    owner.as_fd()
}

pub(crate) fn current_thread_id() -> u32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        (unsafe { libc::pthread_self() }) as usize as u32
    }
}

/// Milliseconds since the epoch, truncated to 32 bits.
pub(crate) fn tick_count() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u32)
        .unwrap_or_default()
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
