//! Entry-point for the `pollproc` binary.
use clap::Parser;
use pollproc_cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let exit_code = pollproc_cli::run(cli)?;
    std::process::exit(exit_code);
}
