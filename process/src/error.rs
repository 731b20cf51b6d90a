use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Every OS-backed variant carries the underlying `io::Error`; no further
/// classification is layered on top of the OS status code.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to look up the current process identity: {0}")]
    IdentityLookup(#[source] io::Error),
    #[error("failed to build the pipe access descriptor: {0}")]
    AccessDescriptor(#[source] io::Error),
    #[error("failed to create pipe `{name}`: {source}")]
    PipeCreation {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create process `{command_line}`: {source}")]
    ProcessCreation {
        command_line: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait on process sources: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to read process output: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write to process stdin: {0}")]
    Write(#[source] io::Error),
    #[error("failed to terminate process: {0}")]
    Termination(#[source] io::Error),
    #[error("command line cannot be split into arguments: {0:?}")]
    InvalidCommandLine(String),
    #[error("process has not been launched")]
    NotLaunched,
    #[error("process session was already launched")]
    AlreadyLaunched,
    #[error("stdin is closed for this session")]
    StdinClosed,
}

impl ProcessError {
    /// Raw OS status code behind this error, when there is one.
    pub fn os_code(&self) -> Option<i32> {
        self.io_error().and_then(io::Error::raw_os_error)
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::IdentityLookup(err)
            | Self::AccessDescriptor(err)
            | Self::Wait(err)
            | Self::Read(err)
            | Self::Write(err)
            | Self::Termination(err) => Some(err),
            Self::PipeCreation { source, .. } | Self::ProcessCreation { source, .. } => {
                Some(source)
            }
            Self::InvalidCommandLine(_)
            | Self::NotLaunched
            | Self::AlreadyLaunched
            | Self::StdinClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn os_code_comes_from_the_wrapped_error() {
        let err = ProcessError::PipeCreation {
            name: "rpa.test".to_string(),
            source: io::Error::from_raw_os_error(2),
        };
        assert_eq!(err.os_code(), Some(2));
        assert_eq!(ProcessError::NotLaunched.os_code(), None);
    }

    #[test]
    fn display_names_the_failing_stage() {
        let err = ProcessError::Wait(io::Error::other("boom"));
        assert_eq!(err.to_string(), "failed to wait on process sources: boom");
    }
}
