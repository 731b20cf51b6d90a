use std::io;
use std::os::windows::io::AsHandle;
use std::os::windows::io::BorrowedHandle;
use std::os::windows::io::FromRawHandle;
use std::os::windows::io::OwnedHandle;
use std::os::windows::io::RawHandle;
use std::time::Duration;
use windows_sys::Win32::Foundation::WAIT_FAILED;
use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
use windows_sys::Win32::Foundation::WAIT_TIMEOUT;
use windows_sys::Win32::System::Threading::CreateProcessW;
use windows_sys::Win32::System::Threading::GetExitCodeProcess;
use windows_sys::Win32::System::Threading::TerminateProcess;
use windows_sys::Win32::System::Threading::WaitForSingleObject;
use windows_sys::Win32::System::Threading::CREATE_NEW_CONSOLE;
use windows_sys::Win32::System::Threading::PROCESS_INFORMATION;
use windows_sys::Win32::System::Threading::STARTF_USESHOWWINDOW;
use windows_sys::Win32::System::Threading::STARTF_USESTDHANDLES;
use windows_sys::Win32::System::Threading::STARTUPINFOW;
use windows_sys::Win32::UI::WindowsAndMessaging::SW_HIDE;

use super::cvt;
use super::pipe::wait_timeout_ms;
use super::raw;
use super::to_wide;
use crate::error::ProcessError;
use crate::error::Result;
use crate::options::SessionOptions;
use crate::sys::ChildStdio;
use crate::sys::Launcher;

const STILL_ACTIVE: u32 = 259;
const TERMINATION_EXIT_CODE: u32 = 1;

/// What a [`Launcher`] returns on Windows. Both handles are owned by the
/// session afterwards.
pub type Launched = PROCESS_INFORMATION;

/// The prepared `CreateProcessW` arguments: a writable NUL-terminated UTF-16
/// command line and a `STARTUPINFOW` whose standard handles are the child's
/// inheritable pipe ends.
pub struct LaunchRequest<'a> {
    command_line: &'a mut Vec<u16>,
    startup_info: &'a mut STARTUPINFOW,
}

impl LaunchRequest<'_> {
    pub fn command_line(&mut self) -> &mut Vec<u16> {
        self.command_line
    }

    pub fn startup_info(&mut self) -> &mut STARTUPINFOW {
        self.startup_info
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    process: OwnedHandle,
    _thread: Option<OwnedHandle>,
    pid: u32,
    exit_code: Option<i32>,
}

impl ChildProcess {
    /// # Safety
    /// `info` must hold handles freshly returned by process creation.
    unsafe fn from_info(info: PROCESS_INFORMATION) -> Self {
        let thread = (info.hThread != 0)
            .then(|| unsafe { OwnedHandle::from_raw_handle(info.hThread as RawHandle) });
        Self {
            process: unsafe { OwnedHandle::from_raw_handle(info.hProcess as RawHandle) },
            _thread: thread,
            pid: info.dwProcessId,
            exit_code: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Cached exit code; `None` until collected, or when the OS reported the
    /// process as still active.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub(crate) fn process_handle(&self) -> BorrowedHandle<'_> {
        self.process.as_handle()
    }

    pub(crate) fn probe_exit(&self, timeout: Duration) -> io::Result<bool> {
        let ret =
            unsafe { WaitForSingleObject(raw(self.process_handle()), wait_timeout_ms(timeout)) };
        match ret {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            other => Err(io::Error::other(format!("unexpected wait result {other:#x}"))),
        }
    }

    pub(crate) fn collect_exit_code(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_none() {
            let mut code = 0u32;
            cvt(unsafe { GetExitCodeProcess(raw(self.process_handle()), &mut code) })?;
            if code != STILL_ACTIVE {
                self.exit_code = Some(code as i32);
            }
        }
        Ok(self.exit_code)
    }

    pub(crate) fn terminate(&self) -> io::Result<()> {
        cvt(unsafe { TerminateProcess(raw(self.process_handle()), TERMINATION_EXIT_CODE) })
    }
}

/// Creates the process with handle inheritance, a hidden new console, and
/// `stdio` installed as its standard handles.
pub(crate) fn launch(
    command_line: &str,
    stdio: ChildStdio,
    _options: &SessionOptions,
    launcher: Option<&mut dyn Launcher>,
) -> Result<ChildProcess> {
    let mut command_line_buf = to_wide(command_line);
    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup_info.dwFlags = STARTF_USESHOWWINDOW | STARTF_USESTDHANDLES;
    startup_info.wShowWindow = SW_HIDE as u16;
    startup_info.hStdInput = raw(stdio.stdin.as_handle());
    startup_info.hStdOutput = raw(stdio.stdout.as_handle());
    startup_info.hStdError = raw(stdio.stderr.as_handle());

    let launched = {
        let mut request = LaunchRequest {
            command_line: &mut command_line_buf,
            startup_info: &mut startup_info,
        };
        match launcher {
            Some(launcher) => launcher.launch(&mut request),
            None => create_process(&mut request),
        }
    };
    // The child holds its own copies now; the parent's must go or end-of-file
    // is never observed.
    drop(stdio);

    let info = launched.map_err(|source| ProcessError::ProcessCreation {
        command_line: command_line.to_string(),
        source,
    })?;
    Ok(unsafe { ChildProcess::from_info(info) })
}

fn create_process(request: &mut LaunchRequest<'_>) -> io::Result<PROCESS_INFORMATION> {
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    cvt(unsafe {
        CreateProcessW(
            std::ptr::null(),
            request.command_line.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1,
            CREATE_NEW_CONSOLE,
            std::ptr::null(),
            std::ptr::null(),
            &*request.startup_info,
            &mut info,
        )
    })?;
    Ok(info)
}
