/// Maximum number of bytes delivered by a single output event.
pub const CHUNK_SIZE: usize = 128;

/// Notification handed to the poll callback. Borrowed buffers are only valid
/// for the duration of the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent<'a> {
    Stdout(&'a [u8]),
    Stderr(&'a [u8]),
    /// Delivered exactly once per session, alongside [`PollStatus::Done`].
    Exited { exit_code: Option<i32> },
}

/// Result of one [`crate::ProcessSession::poll`] call. Wait failures are
/// reported through the `Err` side of the returned `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Exit was confirmed and reported. Terminal.
    Done,
    /// Nothing became ready within the wait budget; back off before polling
    /// again.
    Idle,
    /// A chunk was delivered, or exit was observed but not yet confirmed.
    /// Poll again promptly.
    Handled,
}

impl PollStatus {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}
