use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

use crate::error::ProcessError;
use crate::error::Result;
use crate::options::SessionOptions;
use crate::pipe_name::next_pipe_token;
use crate::sys;
use crate::sys::AccessPolicy;
use crate::sys::BorrowedEnd;
use crate::sys::OwnedEnd;
use crate::sys::PipeAccess;

/// One unidirectional byte pipe whose access is restricted to the current
/// identity.
///
/// Each endpoint has exactly one owner. The `detach_*` methods move an
/// endpoint out of the pair; from then on the pair neither observes nor
/// closes it. Endpoints still owned when the pair is dropped (or
/// [`close`](Self::close)d) are closed.
#[derive(Debug)]
pub struct SecurePipePair {
    name: PathBuf,
    read: Option<OwnedEnd>,
    write: Option<OwnedEnd>,
    last_error: Option<i32>,
}

impl SecurePipePair {
    /// Creates a pipe under a fresh process-unique name.
    pub fn create(options: &SessionOptions) -> Result<Self> {
        let name = sys::pipe_name(options, &next_pipe_token());
        let policy = AccessPolicy::current()?;
        let (read, write) =
            sys::create_pipe(&name, &policy).map_err(|source| ProcessError::PipeCreation {
                name: name.display().to_string(),
                source,
            })?;
        debug!(name = %name.display(), "created pipe pair");
        Ok(Self {
            name,
            read: Some(read),
            write: Some(write),
            last_error: None,
        })
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// OS error recorded by the last failed duplication, if any.
    pub fn last_error(&self) -> Option<i32> {
        self.last_error
    }

    pub fn read_end(&self) -> Option<BorrowedEnd<'_>> {
        self.read.as_ref().map(sys::borrow_end)
    }

    pub fn write_end(&self) -> Option<BorrowedEnd<'_>> {
        self.write.as_ref().map(sys::borrow_end)
    }

    pub fn detach_read(&mut self) -> Option<OwnedEnd> {
        self.read.take()
    }

    pub fn detach_write(&mut self) -> Option<OwnedEnd> {
        self.write.take()
    }

    /// Duplicates the read end into a handle a child process can inherit and
    /// closes the original. On failure the pair keeps the original.
    pub fn detach_inheritable_read(&mut self) -> io::Result<OwnedEnd> {
        detach_inheritable(&mut self.read, &mut self.last_error)
    }

    /// Write-end counterpart of
    /// [`detach_inheritable_read`](Self::detach_inheritable_read).
    pub fn detach_inheritable_write(&mut self) -> io::Result<OwnedEnd> {
        detach_inheritable(&mut self.write, &mut self.last_error)
    }

    /// Closes every endpoint still owned. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.read = None;
        self.write = None;
    }

    /// Inspects the access control applied to the pipe object.
    pub fn access(&self) -> Result<PipeAccess> {
        let end = self
            .read_end()
            .or_else(|| self.write_end())
            .ok_or_else(|| ProcessError::AccessDescriptor(detached_error()))?;
        AccessPolicy::current()?
            .inspect(end)
            .map_err(ProcessError::AccessDescriptor)
    }
}

fn detach_inheritable(
    slot: &mut Option<OwnedEnd>,
    last_error: &mut Option<i32>,
) -> io::Result<OwnedEnd> {
    let Some(end) = slot.as_ref() else {
        return Err(detached_error());
    };
    match sys::duplicate_inheritable(sys::borrow_end(end)) {
        Ok(duplicate) => {
            // The non-inheritable original must not stay open in the parent.
            *slot = None;
            Ok(duplicate)
        }
        Err(err) => {
            *last_error = err.raw_os_error();
            Err(err)
        }
    }
}

fn detached_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "pipe endpoint already detached")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::fs::File;
    use std::io::Read;
    use std::io::Write;

    fn options_in(dir: &Path) -> SessionOptions {
        SessionOptions {
            pipe_dir: Some(dir.to_path_buf()),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn fresh_pair_owns_both_ends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pair = SecurePipePair::create(&options_in(dir.path()))?;
        assert!(pair.read_end().is_some());
        assert!(pair.write_end().is_some());
        assert_eq!(pair.last_error(), None);
        let file_name = pair
            .name()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(file_name.starts_with("rpa."), "unexpected name {file_name}");
        Ok(())
    }

    #[test]
    fn detached_ends_are_no_longer_observed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pair = SecurePipePair::create(&options_in(dir.path()))?;
        let read = pair.detach_read();
        assert!(read.is_some());
        assert!(pair.read_end().is_none());
        assert!(pair.detach_read().is_none());
        assert!(pair.write_end().is_some());
        Ok(())
    }

    #[test]
    fn inheritable_detach_consumes_the_original() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pair = SecurePipePair::create(&options_in(dir.path()))?;
        let duplicate = pair.detach_inheritable_write()?;
        assert!(pair.write_end().is_none());

        let mut writer = File::from(duplicate);
        writer.write_all(b"through the duplicate")?;
        drop(writer);

        let mut reader = pair
            .detach_read()
            .map(File::from)
            .ok_or_else(|| anyhow::anyhow!("read end missing"))?;
        let mut received = Vec::new();
        reader.read_to_end(&mut received)?;
        assert_eq!(received, b"through the duplicate");
        Ok(())
    }

    #[test]
    fn inheritable_detach_of_a_detached_end_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pair = SecurePipePair::create(&options_in(dir.path()))?;
        let _read = pair.detach_read();
        let err = match pair.detach_inheritable_read() {
            Ok(_) => anyhow::bail!("expected detached read end to fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut pair = SecurePipePair::create(&options_in(dir.path()))?;
        let _write = pair.detach_write();
        pair.close();
        pair.close();
        assert!(pair.read_end().is_none());
        assert!(pair.write_end().is_none());
        Ok(())
    }

    #[test]
    fn access_is_restricted_to_the_current_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pair = SecurePipePair::create(&options_in(dir.path()))?;
        let access = pair.access()?;
        assert!(
            access.grants_only_current_identity(),
            "pipe access too broad: {access:?}"
        );
        #[cfg(unix)]
        assert_eq!(access.mode(), 0o600);
        Ok(())
    }

    #[test]
    fn concurrent_creations_get_distinct_names() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let options = options_in(dir.path());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let options = options.clone();
                std::thread::spawn(move || -> Result<Vec<PathBuf>> {
                    (0..250)
                        .map(|_| {
                            SecurePipePair::create(&options)
                                .map(|pair| pair.name().to_path_buf())
                        })
                        .collect()
                })
            })
            .collect();

        let mut names = HashSet::new();
        for handle in handles {
            let created = handle
                .join()
                .map_err(|_| anyhow::anyhow!("creator thread panicked"))??;
            for name in created {
                assert!(names.insert(name), "duplicate pipe name");
            }
        }
        assert_eq!(names.len(), 1000);
        Ok(())
    }
}
