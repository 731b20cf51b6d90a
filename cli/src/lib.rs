//! Library side of the `pollproc` binary: argument parsing, config layering
//! and the poll loop that forwards a child's output.

use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use pollproc_process::PollStatus;
use pollproc_process::ProcessEvent;
use pollproc_process::ProcessSession;
use tracing::debug;
use tracing::warn;

mod command_line;
mod config;

pub use command_line::join_command_line;
pub use config::ConfigToml;
pub use config::DEFAULT_IDLE_BACKOFF_MS;
pub use config::RunConfig;

/// Exit status reported when the child's own status is unknown.
pub const UNKNOWN_EXIT_CODE: i32 = 1;

/// Run a command with its standard streams wired through private pipes and
/// forward its output.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// TOML file with a `[session]` table plus `idle_backoff_ms` and
    /// `timeout_ms`.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Text written to the child's stdin. Stdin is closed afterwards either
    /// way.
    #[arg(long, value_name = "TEXT")]
    pub stdin: Option<String>,

    /// Forcefully terminate the child after this many milliseconds.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Sleep between polls that found nothing to do.
    #[arg(long, value_name = "MS")]
    pub idle_backoff_ms: Option<u64>,

    /// Command line to run. A single argument is used verbatim; several are
    /// quoted and joined.
    #[arg(
        value_name = "COMMAND_LINE",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Runs the command to completion and returns the exit status to report.
pub fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = RunConfig::resolve(&cli)?;
    let command_line = join_command_line(&cli.command)?;

    let mut session = ProcessSession::with_options(command_line.as_str(), config.session.clone());
    session
        .execute()
        .with_context(|| format!("failed to launch `{command_line}`"))?;
    if let Some(text) = &cli.stdin {
        session
            .write_stdin(text.as_bytes())
            .context("failed to write to child stdin")?;
    }
    session.close_stdin();

    let started = Instant::now();
    let mut terminated = false;
    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut stdout = stdout.lock();
    let mut stderr = stderr.lock();
    let mut forward_error: Option<io::Error> = None;

    loop {
        if !terminated
            && let Some(timeout) = config.timeout
            && started.elapsed() >= timeout
        {
            warn!(?timeout, pid = ?session.pid(), "timeout elapsed; terminating child");
            session
                .terminate()
                .context("failed to terminate timed-out child")?;
            terminated = true;
        }

        let status = session.poll(|event| {
            let result = match event {
                ProcessEvent::Stdout(bytes) => stdout.write_all(bytes).and_then(|()| stdout.flush()),
                ProcessEvent::Stderr(bytes) => stderr.write_all(bytes).and_then(|()| stderr.flush()),
                ProcessEvent::Exited { exit_code } => {
                    debug!(?exit_code, "child exited");
                    Ok(())
                }
            };
            if let Err(err) = result {
                forward_error.get_or_insert(err);
            }
        })?;
        if let Some(err) = forward_error.take() {
            return Err(err).context("failed to forward child output");
        }

        match status {
            PollStatus::Done => break,
            PollStatus::Idle => std::thread::sleep(config.idle_backoff),
            PollStatus::Handled => {}
        }
    }

    Ok(session.exit_code().unwrap_or(UNKNOWN_EXIT_CODE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trailing_arguments_keep_their_hyphens() {
        let cli = Cli::parse_from([
            "pollproc",
            "--stdin",
            "input",
            "--",
            "sh",
            "-c",
            "echo hi",
        ]);
        assert_eq!(cli.stdin.as_deref(), Some("input"));
        assert_eq!(cli.command, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn command_line_is_required() {
        assert!(Cli::try_parse_from(["pollproc"]).is_err());
    }
}
