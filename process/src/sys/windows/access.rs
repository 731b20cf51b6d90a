use std::ffi::c_void;
use std::fmt;
use std::io;
use std::os::windows::io::AsHandle;
use std::os::windows::io::BorrowedHandle;
use std::os::windows::io::FromRawHandle;
use std::os::windows::io::OwnedHandle;
use std::os::windows::io::RawHandle;
use windows_sys::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER;
use windows_sys::Win32::Foundation::ERROR_SUCCESS;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Foundation::HLOCAL;
use windows_sys::Win32::Foundation::LocalFree;
use windows_sys::Win32::Security::AclSizeInformation;
use windows_sys::Win32::Security::Authorization::GetSecurityInfo;
use windows_sys::Win32::Security::Authorization::SetEntriesInAclW;
use windows_sys::Win32::Security::Authorization::EXPLICIT_ACCESS_W;
use windows_sys::Win32::Security::Authorization::TRUSTEE_IS_SID;
use windows_sys::Win32::Security::Authorization::TRUSTEE_IS_USER;
use windows_sys::Win32::Security::Authorization::TRUSTEE_W;
use windows_sys::Win32::Security::EqualSid;
use windows_sys::Win32::Security::GetAce;
use windows_sys::Win32::Security::GetAclInformation;
use windows_sys::Win32::Security::GetTokenInformation;
use windows_sys::Win32::Security::InitializeSecurityDescriptor;
use windows_sys::Win32::Security::SetSecurityDescriptorDacl;
use windows_sys::Win32::Security::TokenUser;
use windows_sys::Win32::Security::ACE_HEADER;
use windows_sys::Win32::Security::ACL;
use windows_sys::Win32::Security::ACL_SIZE_INFORMATION;
use windows_sys::Win32::Security::DACL_SECURITY_INFORMATION;
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Security::SECURITY_DESCRIPTOR;
use windows_sys::Win32::Security::TOKEN_QUERY;
use windows_sys::Win32::Security::TOKEN_USER;
use windows_sys::Win32::System::Threading::GetCurrentProcess;
use windows_sys::Win32::System::Threading::OpenProcessToken;

use super::cvt;
use super::raw;
use crate::error::ProcessError;
use crate::error::Result;

const SE_KERNEL_OBJECT: i32 = 6;
const SET_ACCESS: i32 = 2;
const NO_INHERITANCE: u32 = 0;
const GENERIC_ALL: u32 = 0x1000_0000;
const SECURITY_DESCRIPTOR_REVISION: u32 = 1;
const ACCESS_ALLOWED_ACE_TYPE: u8 = 0;

/// Security descriptor whose DACL holds a single entry granting full access to
/// the current user's SID. Applied to every named pipe this process creates.
pub struct AccessPolicy {
    // TOKEN_USER followed by the SID it points into; u64 keeps it aligned.
    token_user: Vec<u64>,
    dacl: LocalAcl,
    descriptor: Box<SECURITY_DESCRIPTOR>,
}

impl AccessPolicy {
    pub fn current() -> Result<Self> {
        let token_user = current_token_user().map_err(ProcessError::IdentityLookup)?;
        let sid = unsafe { (*token_user.as_ptr().cast::<TOKEN_USER>()).User.Sid };
        let (dacl, descriptor) =
            owner_only_descriptor(sid).map_err(ProcessError::AccessDescriptor)?;
        Ok(Self {
            token_user,
            dacl,
            descriptor,
        })
    }

    fn sid(&self) -> *mut c_void {
        unsafe { (*self.token_user.as_ptr().cast::<TOKEN_USER>()).User.Sid }
    }

    /// Non-inheritable attributes carrying the owner-only descriptor. Valid
    /// while `self` is alive.
    pub(crate) fn security_attributes(&self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: (&*self.descriptor as *const SECURITY_DESCRIPTOR)
                .cast_mut()
                .cast::<c_void>(),
            bInheritHandle: 0,
        }
    }

    /// Reads back the DACL actually applied to the pipe object behind `end`.
    pub fn inspect(&self, end: BorrowedHandle<'_>) -> io::Result<PipeAccess> {
        let mut dacl: *mut ACL = std::ptr::null_mut();
        let mut descriptor: *mut c_void = std::ptr::null_mut();
        let code = unsafe {
            GetSecurityInfo(
                raw(end),
                SE_KERNEL_OBJECT,
                DACL_SECURITY_INFORMATION,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut dacl,
                std::ptr::null_mut(),
                &mut descriptor,
            )
        };
        if code != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(code as i32));
        }
        let access = unsafe { summarize_dacl(dacl, self.sid()) };
        if !descriptor.is_null() {
            unsafe {
                LocalFree(descriptor as HLOCAL);
            }
        }
        access
    }
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("dacl", &self.dacl.0)
            .finish_non_exhaustive()
    }
}

/// Result of [`AccessPolicy::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeAccess {
    entries: u32,
    current_identity_allowed: u32,
}

impl PipeAccess {
    /// Number of ACEs in the DACL.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// True when the DACL holds exactly one entry and it allows the current
    /// user's SID.
    pub fn grants_only_current_identity(&self) -> bool {
        self.entries == 1 && self.current_identity_allowed == 1
    }
}

struct LocalAcl(*mut ACL);

impl Drop for LocalAcl {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                LocalFree(self.0 as HLOCAL);
            }
        }
    }
}

fn current_token_user() -> io::Result<Vec<u64>> {
    let mut token: HANDLE = 0;
    cvt(unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) })?;
    let owned_token = unsafe { OwnedHandle::from_raw_handle(token as RawHandle) };
    let token = raw(owned_token.as_handle());

    let mut len = 0u32;
    if unsafe { GetTokenInformation(token, TokenUser, std::ptr::null_mut(), 0, &mut len) } == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
            return Err(err);
        }
    }
    let mut buf = vec![0u64; (len as usize).div_ceil(std::mem::size_of::<u64>())];
    cvt(unsafe {
        GetTokenInformation(
            token,
            TokenUser,
            buf.as_mut_ptr().cast::<c_void>(),
            len,
            &mut len,
        )
    })?;
    Ok(buf)
}

fn owner_only_descriptor(sid: *mut c_void) -> io::Result<(LocalAcl, Box<SECURITY_DESCRIPTOR>)> {
    let entry = EXPLICIT_ACCESS_W {
        grfAccessPermissions: GENERIC_ALL,
        grfAccessMode: SET_ACCESS,
        grfInheritance: NO_INHERITANCE,
        Trustee: TRUSTEE_W {
            pMultipleTrustee: std::ptr::null_mut(),
            MultipleTrusteeOperation: 0,
            TrusteeForm: TRUSTEE_IS_SID,
            TrusteeType: TRUSTEE_IS_USER,
            ptstrName: sid as *mut u16,
        },
    };
    let mut acl: *mut ACL = std::ptr::null_mut();
    let code = unsafe { SetEntriesInAclW(1, &entry, std::ptr::null(), &mut acl) };
    if code != ERROR_SUCCESS {
        return Err(io::Error::from_raw_os_error(code as i32));
    }
    let acl = LocalAcl(acl);

    let mut descriptor: Box<SECURITY_DESCRIPTOR> = Box::new(unsafe { std::mem::zeroed() });
    let psd = (&mut *descriptor as *mut SECURITY_DESCRIPTOR).cast::<c_void>();
    cvt(unsafe { InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION) })?;
    cvt(unsafe { SetSecurityDescriptorDacl(psd, 1, acl.0, 0) })?;
    Ok((acl, descriptor))
}

/// # Safety
/// `dacl` must be null or point to a valid ACL; `sid` must be a valid SID.
unsafe fn summarize_dacl(dacl: *mut ACL, sid: *mut c_void) -> io::Result<PipeAccess> {
    if dacl.is_null() {
        // A null DACL grants everyone full access.
        return Ok(PipeAccess {
            entries: 0,
            current_identity_allowed: 0,
        });
    }
    let mut info: ACL_SIZE_INFORMATION = unsafe { std::mem::zeroed() };
    cvt(unsafe {
        GetAclInformation(
            dacl as *const ACL,
            &mut info as *mut _ as *mut c_void,
            std::mem::size_of::<ACL_SIZE_INFORMATION>() as u32,
            AclSizeInformation,
        )
    })?;

    let mut current_identity_allowed = 0;
    for i in 0..info.AceCount {
        let mut ace: *mut c_void = std::ptr::null_mut();
        cvt(unsafe { GetAce(dacl as *const ACL, i, &mut ace) })?;
        let header = unsafe { &*(ace as *const ACE_HEADER) };
        if header.AceType != ACCESS_ALLOWED_ACE_TYPE {
            continue;
        }
        let ace_sid = (ace as usize + std::mem::size_of::<ACE_HEADER>() + std::mem::size_of::<u32>())
            as *mut c_void;
        if unsafe { EqualSid(ace_sid, sid) } != 0 {
            current_identity_allowed += 1;
        }
    }
    Ok(PipeAccess {
        entries: info.AceCount,
        current_identity_allowed,
    })
}
