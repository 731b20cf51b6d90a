//! Poll-driven supervision of a child process wired to private pipes.
//!
//! A [`ProcessSession`] owns three [`SecurePipePair`]s (stdin, stdout,
//! stderr) and the launched child. The caller drives it by calling
//! [`ProcessSession::poll`] repeatedly; every call does at most one unit of
//! work (one chunk of output, or one exit confirmation) and never spawns a
//! thread.

mod error;
mod event;
mod options;
mod pipe;
mod pipe_name;
mod session;
mod sys;

/// Error type shared by every fallible operation in this crate.
pub use error::ProcessError;
/// Result alias using [`ProcessError`].
pub use error::Result;
/// Output/exit notifications handed to the poll callback.
pub use event::ProcessEvent;
/// Outcome of one poll step.
pub use event::PollStatus;
/// Maximum number of bytes delivered per output event.
pub use event::CHUNK_SIZE;
/// Tunables for pipe creation, polling and process launch.
pub use options::SessionOptions;
/// Private unidirectional pipe with move-only endpoints.
pub use pipe::SecurePipePair;
/// Generates process-unique pipe names.
pub use pipe_name::next_pipe_token;
/// Owner-only access descriptor derived from the current identity.
pub use sys::AccessPolicy;
/// Inspection result of the access control applied to a pipe.
pub use sys::PipeAccess;
/// Launched child process identifiers.
pub use sys::ChildProcess;
/// Strategy used to create the OS process.
pub use sys::Launcher;
/// Process object a [`Launcher`] hands back (`Child` on Unix,
/// `PROCESS_INFORMATION` on Windows).
pub use sys::Launched;
/// Platform-specific launch request handed to a [`Launcher`].
pub use sys::LaunchRequest;
/// Owned pipe endpoint (`OwnedFd` on Unix, `OwnedHandle` on Windows).
pub use sys::OwnedEnd;
/// Borrowed pipe endpoint.
pub use sys::BorrowedEnd;
/// Caller-driven process session.
pub use session::ProcessSession;
/// Lifecycle state of a [`ProcessSession`].
pub use session::SessionState;
