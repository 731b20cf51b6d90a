use std::io;
use std::os::windows::io::BorrowedHandle;
use std::os::windows::io::FromRawHandle;
use std::os::windows::io::OwnedHandle;
use std::os::windows::io::RawHandle;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use windows_sys::Win32::Foundation::DuplicateHandle;
use windows_sys::Win32::Foundation::DUPLICATE_SAME_ACCESS;
use windows_sys::Win32::Foundation::ERROR_BROKEN_PIPE;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Foundation::WAIT_FAILED;
use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
use windows_sys::Win32::Foundation::WAIT_TIMEOUT;
use windows_sys::Win32::Storage::FileSystem::CreateFileW;
use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_FIRST_PIPE_INSTANCE;
use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_NO_BUFFERING;
use windows_sys::Win32::Storage::FileSystem::OPEN_EXISTING;
use windows_sys::Win32::Storage::FileSystem::PIPE_ACCESS_INBOUND;
use windows_sys::Win32::System::Pipes::CreateNamedPipeW;
use windows_sys::Win32::System::Pipes::PeekNamedPipe;
use windows_sys::Win32::System::Pipes::PIPE_READMODE_BYTE;
use windows_sys::Win32::System::Pipes::PIPE_REJECT_REMOTE_CLIENTS;
use windows_sys::Win32::System::Pipes::PIPE_TYPE_BYTE;
use windows_sys::Win32::System::Pipes::PIPE_WAIT;
use windows_sys::Win32::System::Threading::GetCurrentProcess;
use windows_sys::Win32::System::Threading::WaitForMultipleObjects;

use super::AccessPolicy;
use super::ChildProcess;
use super::cvt;
use super::owned_handle;
use super::raw;
use super::to_wide;
use crate::event::CHUNK_SIZE;
use crate::options::SessionOptions;
use crate::sys::Source;

const GENERIC_WRITE: u32 = 0x4000_0000;
const PIPE_BUFFER_SIZE: u32 = CHUNK_SIZE as u32;
const PIPE_DEFAULT_TIMEOUT_MS: u32 = 3000;

pub(crate) fn pipe_name(options: &SessionOptions, token: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{}.{token}", options.pipe_name_prefix))
}

/// Creates a single-instance inbound named pipe guarded by `policy` and opens
/// its client side for writing.
pub(crate) fn create_pipe(
    name: &Path,
    policy: &AccessPolicy,
) -> io::Result<(OwnedHandle, OwnedHandle)> {
    let wide = to_wide(name);
    let attributes = policy.security_attributes();
    let read = unsafe {
        owned_handle(CreateNamedPipeW(
            wide.as_ptr(),
            // Fails instead of joining a pipe someone else created first.
            PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            1,
            PIPE_BUFFER_SIZE,
            PIPE_BUFFER_SIZE,
            PIPE_DEFAULT_TIMEOUT_MS,
            &attributes,
        ))
    }?;
    let write = unsafe {
        owned_handle(CreateFileW(
            wide.as_ptr(),
            GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_NO_BUFFERING,
            0,
        ))
    }?;
    Ok((read, write))
}

/// Duplicates `end` into an inheritable handle with the same access.
pub(crate) fn duplicate_inheritable(end: BorrowedHandle<'_>) -> io::Result<OwnedHandle> {
    let mut duplicate: HANDLE = 0;
    cvt(unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            raw(end),
            GetCurrentProcess(),
            &mut duplicate,
            0,
            1,
            DUPLICATE_SAME_ACCESS,
        )
    })?;
    Ok(unsafe { OwnedHandle::from_raw_handle(duplicate as RawHandle) })
}

/// Bytes buffered in the pipe. A pipe whose writer is gone reports zero.
pub(crate) fn bytes_available(end: BorrowedHandle<'_>) -> io::Result<usize> {
    let mut available = 0u32;
    let result = cvt(unsafe {
        PeekNamedPipe(
            raw(end),
            std::ptr::null_mut(),
            0,
            std::ptr::null_mut(),
            &mut available,
            std::ptr::null_mut(),
        )
    });
    match result {
        Ok(()) => Ok(available as usize),
        Err(err) if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) => Ok(0),
        Err(err) => Err(err),
    }
}

/// Waits on the three sources with the handle array laid out in `order`, so
/// the wait reports the first signaled one in that order.
pub(crate) fn wait_any(
    stdout: BorrowedHandle<'_>,
    stderr: BorrowedHandle<'_>,
    child: &ChildProcess,
    order: [Source; 3],
    timeout: Duration,
) -> io::Result<Option<Source>> {
    let handles = order.map(|source| match source {
        Source::Stdout => raw(stdout),
        Source::Stderr => raw(stderr),
        Source::Exit => raw(child.process_handle()),
    });
    let ret = unsafe {
        WaitForMultipleObjects(
            handles.len() as u32,
            handles.as_ptr(),
            0,
            wait_timeout_ms(timeout),
        )
    };
    if ret == WAIT_TIMEOUT {
        return Ok(None);
    }
    if ret == WAIT_FAILED {
        return Err(io::Error::last_os_error());
    }
    match ret.checked_sub(WAIT_OBJECT_0).map(|index| index as usize) {
        Some(index) if index < order.len() => Ok(Some(order[index])),
        _ => Err(io::Error::other(format!("unexpected wait result {ret:#x}"))),
    }
}

/// Rounds up and stays below `INFINITE`.
pub(super) fn wait_timeout_ms(timeout: Duration) -> u32 {
    let millis = timeout.as_micros().div_ceil(1000);
    millis.min(u128::from(u32::MAX - 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pipe_names_live_in_the_pipe_namespace() {
        let options = SessionOptions::default();
        assert_eq!(
            pipe_name(&options, "000100020000000300000004"),
            PathBuf::from(r"\\.\pipe\rpa.000100020000000300000004")
        );
    }

    #[test]
    fn second_server_instance_is_rejected() -> anyhow::Result<()> {
        let policy = AccessPolicy::current()?;
        let name = pipe_name(&SessionOptions::default(), "first-instance-test");
        let (_read, _write) = create_pipe(&name, &policy)?;
        assert!(create_pipe(&name, &policy).is_err());
        Ok(())
    }

    #[test]
    fn wait_timeout_never_means_infinite() {
        assert_eq!(wait_timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(wait_timeout_ms(Duration::MAX), u32::MAX - 1);
    }
}
