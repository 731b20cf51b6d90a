use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;

use super::cvt;
use crate::error::Result;

/// Permission bits for every FIFO: read/write for the owner, nothing else.
pub(crate) const OWNER_ONLY_MODE: libc::mode_t = 0o600;

/// Owner-only access for pipes created by this process.
///
/// On Unix the identity is the effective uid. FIFOs are created with mode
/// `0600` and their owner is checked after opening, so another local user can
/// neither open the FIFO by name nor swap in a FIFO of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    uid: libc::uid_t,
}

impl AccessPolicy {
    /// Captures the identity of the running process.
    pub fn current() -> Result<Self> {
        Ok(Self {
            uid: unsafe { libc::geteuid() },
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Reports the access control actually applied to an open pipe endpoint.
    pub fn inspect(&self, end: BorrowedFd<'_>) -> io::Result<PipeAccess> {
        let stat = fstat(end)?;
        Ok(PipeAccess {
            owner: stat.st_uid,
            mode: (stat.st_mode as u32) & 0o7777,
            is_fifo: (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO,
            expected_owner: self.uid,
        })
    }

    /// Rejects endpoints that are not FIFOs owned by this identity.
    pub(crate) fn verify(&self, end: BorrowedFd<'_>) -> io::Result<()> {
        let access = self.inspect(end)?;
        if access.is_fifo && access.owner == self.uid {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "pipe endpoint is not a FIFO owned by uid {} (owner {}, mode {:o})",
                    self.uid, access.owner, access.mode
                ),
            ))
        }
    }
}

/// Result of [`AccessPolicy::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeAccess {
    owner: u32,
    mode: u32,
    is_fifo: bool,
    expected_owner: u32,
}

impl PipeAccess {
    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// True when the pipe is owned by the creating identity and grants no
    /// group or other permissions.
    pub fn grants_only_current_identity(&self) -> bool {
        self.owner == self.expected_owner && self.mode & 0o077 == 0
    }
}

fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) })?;
    Ok(stat)
}
