use std::fmt;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::ProcessError;
use crate::error::Result;
use crate::event::CHUNK_SIZE;
use crate::event::PollStatus;
use crate::event::ProcessEvent;
use crate::options::SessionOptions;
use crate::pipe::SecurePipePair;
use crate::sys;
use crate::sys::ChildProcess;
use crate::sys::ChildStdio;
use crate::sys::Launcher;
use crate::sys::Source;

/// Upper bound for the exit probe that follows a pipe reporting end-of-file.
const EXIT_PROBE_WAIT: Duration = Duration::from_millis(10);
/// How long `Drop` waits for a killed child before leaving it unreaped.
const DROP_REAP_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Pipes are prepared (or failed to prepare); nothing launched yet.
    Prepared,
    Running,
    /// Exit was observed. Output still buffered in the pipes is delivered by
    /// `poll` until it reports [`PollStatus::Done`].
    Exited,
    /// Pipe preparation or process creation failed. Terminal.
    Failed,
}

/// The three pipes prepared at construction time.
#[derive(Debug)]
struct StdioPipes {
    stdin: SecurePipePair,
    stdout: SecurePipePair,
    stderr: SecurePipePair,
}

impl StdioPipes {
    fn create(options: &SessionOptions) -> Result<Self> {
        Ok(Self {
            stdin: SecurePipePair::create(options)?,
            stdout: SecurePipePair::create(options)?,
            stderr: SecurePipePair::create(options)?,
        })
    }
}

/// State that exists only once the child is running.
#[derive(Debug)]
struct Running {
    child: ChildProcess,
    stdin: Option<File>,
    stdout: File,
    stderr: File,
}

/// A child process wired to three private pipes and driven by repeated calls
/// to [`poll`](Self::poll).
///
/// ```no_run
/// # fn main() -> pollproc_process::Result<()> {
/// use pollproc_process::PollStatus;
/// use pollproc_process::ProcessEvent;
/// use pollproc_process::ProcessSession;
///
/// let mut session = ProcessSession::new("sh -c 'echo hello'");
/// session.execute()?;
/// loop {
///     let status = session.poll(|event| {
///         if let ProcessEvent::Stdout(bytes) = event {
///             print!("{}", String::from_utf8_lossy(bytes));
///         }
///     })?;
///     match status {
///         PollStatus::Done => break,
///         PollStatus::Idle => std::thread::sleep(std::time::Duration::from_millis(10)),
///         PollStatus::Handled => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct ProcessSession {
    command_line: String,
    options: SessionOptions,
    pipes: Option<StdioPipes>,
    pipe_error: Option<ProcessError>,
    launcher: Option<Box<dyn Launcher>>,
    running: Option<Running>,
    state: SessionState,
    alive: bool,
    exit_reported: bool,
    rotation: usize,
    exit_observations: u32,
}

impl ProcessSession {
    pub fn new(command_line: impl Into<String>) -> Self {
        Self::with_options(command_line, SessionOptions::default())
    }

    /// Prepares the three pipes. A pipe failure is kept and returned by
    /// [`execute`](Self::execute).
    pub fn with_options(command_line: impl Into<String>, options: SessionOptions) -> Self {
        let command_line = command_line.into();
        let (pipes, pipe_error) = match StdioPipes::create(&options) {
            Ok(pipes) => (Some(pipes), None),
            Err(err) => {
                warn!(command_line, error = %err, "failed to prepare session pipes");
                (None, Some(err))
            }
        };
        Self {
            command_line,
            options,
            pipes,
            pipe_error,
            launcher: None,
            running: None,
            state: SessionState::Prepared,
            alive: false,
            exit_reported: false,
            rotation: 0,
            exit_observations: 0,
        }
    }

    /// Replaces the default process-creation call. Takes effect on the next
    /// [`execute`](Self::execute).
    pub fn set_launcher<L>(&mut self, launcher: L)
    where
        L: Launcher + 'static,
    {
        self.launcher = Some(Box::new(launcher));
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|running| running.child.pid())
    }

    /// Cached exit code. `None` until exit has been confirmed by
    /// [`poll`](Self::poll) or observed by [`check_alive`](Self::check_alive),
    /// and whenever the OS could not report one.
    pub fn exit_code(&self) -> Option<i32> {
        self.running
            .as_ref()
            .and_then(|running| running.child.exit_code())
    }

    /// Launches the child with its standard streams wired to the session's
    /// pipes.
    pub fn execute(&mut self) -> Result<()> {
        if self.state != SessionState::Prepared {
            return Err(ProcessError::AlreadyLaunched);
        }
        if let Some(err) = self.pipe_error.take() {
            self.state = SessionState::Failed;
            return Err(err);
        }
        let Some(mut pipes) = self.pipes.take() else {
            self.state = SessionState::Failed;
            return Err(ProcessError::AlreadyLaunched);
        };

        let launcher = self
            .launcher
            .as_mut()
            .map(|launcher| launcher.as_mut() as &mut dyn Launcher);
        match launch(&self.command_line, &mut pipes, &self.options, launcher) {
            Ok(running) => {
                debug!(
                    command_line = self.command_line,
                    pid = running.child.pid(),
                    "launched child process"
                );
                self.running = Some(running);
                self.state = SessionState::Running;
                self.alive = true;
                Ok(())
            }
            Err(err) => {
                warn!(
                    command_line = self.command_line,
                    error = %err,
                    "failed to launch child process"
                );
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    /// Performs at most one unit of work, waiting no longer than the wait
    /// budget.
    ///
    /// Delivers one output chunk of at most [`CHUNK_SIZE`] bytes and returns
    /// [`PollStatus::Handled`], or reports exit through
    /// [`ProcessEvent::Exited`] and returns [`PollStatus::Done`], or returns
    /// [`PollStatus::Idle`] when nothing became ready. Exit is reported only
    /// after both output pipes have been drained.
    pub fn poll<F>(&mut self, mut handler: F) -> Result<PollStatus>
    where
        F: FnMut(ProcessEvent<'_>),
    {
        if self.exit_reported {
            return Ok(PollStatus::Done);
        }
        let Some(running) = self.running.as_mut() else {
            return Err(ProcessError::NotLaunched);
        };

        let order = Source::rotated(self.rotation);
        self.rotation = (self.rotation + 1) % Source::ALL.len();
        let required = self.options.required_confirmations();
        let deadline = Instant::now() + self.options.wait_budget();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = sys::wait_any(
                sys::borrow_end(&running.stdout),
                sys::borrow_end(&running.stderr),
                &running.child,
                order,
                remaining,
            )
            .map_err(ProcessError::Wait)?;

            match ready {
                None if self.exit_observations == 0 => return Ok(PollStatus::Idle),
                None => return Ok(PollStatus::Handled),
                Some(Source::Exit) => {}
                Some(stream) => {
                    if running.deliver_chunk(stream, &mut handler)? {
                        self.exit_observations = 0;
                        return Ok(PollStatus::Handled);
                    }
                    // Readable with nothing buffered: the writer is gone.
                }
            }

            // Exit is never confirmed while output is still buffered.
            if running.deliver_any_chunk(order, &mut handler)? {
                self.exit_observations = 0;
                return Ok(PollStatus::Handled);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if running
                .child
                .probe_exit(remaining.min(EXIT_PROBE_WAIT))
                .map_err(ProcessError::Wait)?
            {
                self.exit_observations += 1;
                trace!(
                    observations = self.exit_observations,
                    required, "observed child exit"
                );
            }

            if self.exit_observations >= required {
                let exit_code = running
                    .child
                    .collect_exit_code()
                    .map_err(ProcessError::Wait)?;
                self.alive = false;
                self.exit_reported = true;
                self.state = SessionState::Exited;
                debug!(pid = running.child.pid(), ?exit_code, "child exit confirmed");
                handler(ProcessEvent::Exited { exit_code });
                return Ok(PollStatus::Done);
            }
            if self.exit_observations == 0 {
                return Ok(PollStatus::Idle);
            }
            if Instant::now() >= deadline {
                return Ok(PollStatus::Handled);
            }
        }
    }

    /// Liveness without side effects: the cached flag refined by a zero-wait
    /// exit probe.
    pub fn is_alive(&self) -> bool {
        if !self.alive {
            return false;
        }
        match &self.running {
            Some(running) => !matches!(running.child.probe_exit(Duration::ZERO), Ok(true)),
            None => false,
        }
    }

    /// Like [`is_alive`](Self::is_alive), but caches the result and collects
    /// the exit code on the transition to not alive.
    pub fn check_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        if !matches!(running.child.probe_exit(Duration::ZERO), Ok(true)) {
            return true;
        }
        self.alive = false;
        self.state = SessionState::Exited;
        match running.child.collect_exit_code() {
            Ok(exit_code) => debug!(pid = running.child.pid(), ?exit_code, "child exited"),
            Err(err) => warn!(pid = running.child.pid(), error = %err, "failed to collect exit code"),
        }
        false
    }

    /// Forcefully terminates the child. Exit is still confirmed by
    /// [`poll`](Self::poll).
    pub fn terminate(&self) -> Result<()> {
        let running = self.running.as_ref().ok_or(ProcessError::NotLaunched)?;
        debug!(pid = running.child.pid(), "terminating child process");
        running.child.terminate().map_err(ProcessError::Termination)
    }

    /// Writes all of `bytes` to the child's stdin, blocking until the pipe
    /// accepts them.
    pub fn write_stdin(&mut self, bytes: &[u8]) -> Result<()> {
        let running = self.running.as_mut().ok_or(ProcessError::NotLaunched)?;
        let stdin = running.stdin.as_mut().ok_or(ProcessError::StdinClosed)?;
        stdin.write_all(bytes).map_err(ProcessError::Write)
    }

    #[cfg(test)]
    pub(crate) fn exit_observations(&self) -> u32 {
        self.exit_observations
    }

    /// Closes the parent's end of stdin so the child reads end-of-file.
    pub fn close_stdin(&mut self) {
        if let Some(running) = self.running.as_mut()
            && running.stdin.take().is_some()
        {
            trace!(pid = running.child.pid(), "closed child stdin");
        }
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("command_line", &self.command_line)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("alive", &self.alive)
            .field("custom_launcher", &self.launcher.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if !self.alive {
            return;
        }
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if self.options.kill_on_drop {
            if let Err(err) = running.child.terminate() {
                warn!(pid = running.child.pid(), error = %err, "failed to kill child on drop");
                return;
            }
            let _ = running.child.probe_exit(DROP_REAP_WAIT);
        }
        // Reaps a child that already exited. One still running is left alone
        // and stays unreaped until this process exits.
        match running.child.collect_exit_code() {
            Ok(Some(_)) => {}
            Ok(None) => debug!(pid = running.child.pid(), "leaving child running on drop"),
            Err(err) => {
                warn!(pid = running.child.pid(), error = %err, "failed to reap child on drop");
            }
        }
    }
}

impl Running {
    fn stream(&self, source: Source) -> Option<&File> {
        match source {
            Source::Stdout => Some(&self.stdout),
            Source::Stderr => Some(&self.stderr),
            Source::Exit => None,
        }
    }

    /// Delivers the first pending chunk among the output streams in `order`.
    fn deliver_any_chunk<F>(&self, order: [Source; 3], handler: &mut F) -> Result<bool>
    where
        F: FnMut(ProcessEvent<'_>),
    {
        for source in order {
            if source != Source::Exit && self.deliver_chunk(source, handler)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reads at most one chunk from `source` if bytes are buffered. Returns
    /// `false` when the pipe is empty.
    fn deliver_chunk<F>(&self, source: Source, handler: &mut F) -> Result<bool>
    where
        F: FnMut(ProcessEvent<'_>),
    {
        let Some(file) = self.stream(source) else {
            return Ok(false);
        };
        let available = sys::bytes_available(sys::borrow_end(file)).map_err(ProcessError::Read)?;
        if available == 0 {
            return Ok(false);
        }

        let mut buf = [0u8; CHUNK_SIZE];
        let len = available.min(CHUNK_SIZE);
        let read = loop {
            match (&*file).read(&mut buf[..len]) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProcessError::Read(err)),
            }
        };
        if read == 0 {
            return Ok(false);
        }

        let chunk = &buf[..read];
        trace!(?source, len = read, "delivering output chunk");
        match source {
            Source::Stdout => handler(ProcessEvent::Stdout(chunk)),
            Source::Stderr => handler(ProcessEvent::Stderr(chunk)),
            Source::Exit => return Ok(false),
        }
        Ok(true)
    }
}

/// Wires the child's ends into inheritable duplicates, keeps the parent's
/// ends, and creates the process. On error every duplicate is closed on
/// return.
fn launch(
    command_line: &str,
    pipes: &mut StdioPipes,
    options: &SessionOptions,
    launcher: Option<&mut dyn Launcher>,
) -> Result<Running> {
    let stdio = ChildStdio {
        stdin: pipes
            .stdin
            .detach_inheritable_read()
            .map_err(|source| creation_error(command_line, source))?,
        stdout: pipes
            .stdout
            .detach_inheritable_write()
            .map_err(|source| creation_error(command_line, source))?,
        stderr: pipes
            .stderr
            .detach_inheritable_write()
            .map_err(|source| creation_error(command_line, source))?,
    };
    let (Some(stdin), Some(stdout), Some(stderr)) = (
        pipes.stdin.detach_write(),
        pipes.stdout.detach_read(),
        pipes.stderr.detach_read(),
    ) else {
        return Err(ProcessError::AlreadyLaunched);
    };

    let child = sys::launch(command_line, stdio, options, launcher)?;
    Ok(Running {
        child,
        stdin: Some(File::from(stdin)),
        stdout: File::from(stdout),
        stderr: File::from(stderr),
    })
}

fn creation_error(command_line: &str, source: io::Error) -> ProcessError {
    ProcessError::ProcessCreation {
        command_line: command_line.to_string(),
        source,
    }
}
