use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::AsHandle;
use std::os::windows::io::AsRawHandle;
use std::os::windows::io::BorrowedHandle;
use std::os::windows::io::FromRawHandle;
use std::os::windows::io::OwnedHandle;
use std::os::windows::io::RawHandle;
use windows_sys::Win32::Foundation::BOOL;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
use windows_sys::Win32::System::SystemInformation::GetTickCount;
use windows_sys::Win32::System::Threading::GetCurrentThreadId;

mod access;
mod child;
mod pipe;

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

pub type OwnedEnd = OwnedHandle;
pub type BorrowedEnd<'a> = BorrowedHandle<'a>;

pub(crate) fn borrow_end<T: AsHandle>(owner: &T) -> BorrowedHandle<'_> {
    owner.as_handle()
}

pub(crate) fn current_thread_id() -> u32 {
    unsafe { GetCurrentThreadId() }
}

pub(crate) fn tick_count() -> u32 {
    unsafe { GetTickCount() }
}

pub(crate) fn to_wide<S: AsRef<OsStr>>(s: S) -> Vec<u16> {
    let mut v: Vec<u16> = s.as_ref().encode_wide().collect();
    v.push(0);
    v
}

fn raw(handle: BorrowedHandle<'_>) -> HANDLE {
    handle.as_raw_handle() as HANDLE
}

fn cvt(ok: BOOL) -> io::Result<()> {
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Takes ownership of a handle returned by a Win32 creation call, mapping the
/// null and `INVALID_HANDLE_VALUE` failure sentinels to the last OS error.
///
/// # Safety
/// `handle` must be a freshly created handle that nothing else closes.
unsafe fn owned_handle(handle: HANDLE) -> io::Result<OwnedHandle> {
    if handle == 0 || handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}
