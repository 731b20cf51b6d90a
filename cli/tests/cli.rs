#![cfg(unix)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

/// Runs the binary with pipes created under `pipe_dir`.
fn pollproc(pipe_dir: &Path) -> Result<Command> {
    let config = pipe_dir.join("pollproc.toml");
    std::fs::write(
        &config,
        format!("[session]\npipe_dir = {:?}\n", pipe_dir.display().to_string()),
    )?;
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pollproc"));
    cmd.arg("--config").arg(config);
    Ok(cmd)
}

#[test]
fn forwards_output_and_exit_code() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--", "sh -c 'echo hello; echo oops >&2; exit 7'"])
        .assert()
        .code(7)
        .stdout("hello\n")
        .stderr(contains("oops"));
    Ok(())
}

#[test]
fn separate_arguments_are_quoted() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--", "sh", "-c", "echo \"two words\""])
        .assert()
        .success()
        .stdout("two words\n");
    Ok(())
}

#[test]
fn stdin_text_reaches_the_child() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--stdin", "fed through a pipe\n", "--", "cat"])
        .assert()
        .success()
        .stdout("fed through a pipe\n");
    Ok(())
}

#[test]
fn stdin_is_closed_without_input() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--", "cat"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout("");
    Ok(())
}

#[test]
fn timeout_terminates_the_child() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--timeout-ms", "200", "--", "sleep 30"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .code(137);
    Ok(())
}

#[test]
fn missing_program_is_a_launch_error() -> Result<()> {
    let dir = TempDir::new()?;
    pollproc(dir.path())?
        .args(["--", "definitely-not-a-real-program-4242"])
        .assert()
        .failure()
        .stderr(contains("failed to launch"));
    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[session]\nwait_budget = 10\n")?;
    Command::new(env!("CARGO_BIN_EXE_pollproc"))
        .arg("--config")
        .arg(&config)
        .args(["--", "true"])
        .assert()
        .failure()
        .stderr(contains("failed to parse config file"));
    Ok(())
}
