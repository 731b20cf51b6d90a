//! Per-OS primitives behind one contract: pipe creation with an owner-only
//! access policy, handle duplication, readiness waits, and process launch.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::*;

/// One of the three readiness sources multiplexed by the poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Stdout,
    Stderr,
    Exit,
}

impl Source {
    pub(crate) const ALL: [Source; 3] = [Source::Stdout, Source::Stderr, Source::Exit];

    /// `ALL`, rotated so that `ALL[offset % 3]` comes first.
    pub(crate) fn rotated(offset: usize) -> [Source; 3] {
        let start = offset % Self::ALL.len();
        [
            Self::ALL[start],
            Self::ALL[(start + 1) % 3],
            Self::ALL[(start + 2) % 3],
        ]
    }
}

/// Endpoints handed to the child at launch. Dropping this closes them, which
/// is how a failed launch avoids leaking inheritable handles.
#[derive(Debug)]
pub(crate) struct ChildStdio {
    pub(crate) stdin: OwnedEnd,
    pub(crate) stdout: OwnedEnd,
    pub(crate) stderr: OwnedEnd,
}

/// Replaces the OS process-creation call while keeping the pipe wiring that
/// [`crate::ProcessSession::execute`] prepared.
///
/// Implementations must not replace the standard handles carried by the
/// [`LaunchRequest`].
pub trait Launcher: Send {
    fn launch(&mut self, request: &mut LaunchRequest<'_>) -> io::Result<Launched>;
}

impl<F> Launcher for F
where
    F: FnMut(&mut LaunchRequest<'_>) -> io::Result<Launched> + Send,
{
    fn launch(&mut self, request: &mut LaunchRequest<'_>) -> io::Result<Launched> {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rotation_advances_the_first_source() {
        assert_eq!(
            Source::rotated(0),
            [Source::Stdout, Source::Stderr, Source::Exit]
        );
        assert_eq!(
            Source::rotated(1),
            [Source::Stderr, Source::Exit, Source::Stdout]
        );
        assert_eq!(
            Source::rotated(5),
            [Source::Exit, Source::Stdout, Source::Stderr]
        );
    }
}
