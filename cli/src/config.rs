use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use pollproc_process::SessionOptions;
use serde::Deserialize;

use crate::Cli;

pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 10;

/// On-disk shape of the `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigToml {
    pub session: SessionOptions,
    /// Sleep after a poll that found nothing to do.
    pub idle_backoff_ms: Option<u64>,
    /// Terminate the child once it has run this long.
    pub timeout_ms: Option<u64>,
}

impl ConfigToml {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Settings for one run, after command-line flags are layered over the
/// config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub session: SessionOptions,
    pub idle_backoff: Duration,
    pub timeout: Option<Duration>,
}

impl RunConfig {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => ConfigToml::load(path)?,
            None => ConfigToml::default(),
        };
        Ok(Self::merge(file, cli))
    }

    fn merge(file: ConfigToml, cli: &Cli) -> Self {
        let idle_backoff_ms = cli
            .idle_backoff_ms
            .or(file.idle_backoff_ms)
            .unwrap_or(DEFAULT_IDLE_BACKOFF_MS);
        Self {
            session: file.session,
            idle_backoff: Duration::from_millis(idle_backoff_ms),
            timeout: cli
                .timeout_ms
                .or(file.timeout_ms)
                .map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn config_file_sets_session_and_runner_options() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"
idle_backoff_ms = 25
timeout_ms = 5000

[session]
pipe_name_prefix = "demo"
wait_budget_ms = 50
kill_on_drop = true
"#
        )?;

        let config = ConfigToml::load(file.path())?;
        assert_eq!(config.idle_backoff_ms, Some(25));
        assert_eq!(config.timeout_ms, Some(5000));
        assert_eq!(
            config.session,
            SessionOptions {
                pipe_name_prefix: "demo".to_string(),
                wait_budget_ms: 50,
                kill_on_drop: true,
                ..SessionOptions::default()
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_keys_are_reported() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "[session]\nwait_budget = 10\n")?;

        let err = match ConfigToml::load(file.path()) {
            Ok(config) => anyhow::bail!("unexpected success: {config:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("unknown field"), "{err:#}");
        Ok(())
    }

    #[test]
    fn flags_override_the_config_file() {
        let file = ConfigToml {
            idle_backoff_ms: Some(25),
            timeout_ms: Some(5000),
            ..ConfigToml::default()
        };
        let cli = Cli::parse_from(["pollproc", "--timeout-ms", "100", "--", "true"]);

        let config = RunConfig::merge(file, &cli);
        assert_eq!(config.idle_backoff, Duration::from_millis(25));
        assert_eq!(config.timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let cli = Cli::parse_from(["pollproc", "true"]);
        let config = RunConfig::merge(ConfigToml::default(), &cli);
        assert_eq!(
            config,
            RunConfig {
                session: SessionOptions::default(),
                idle_backoff: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MS),
                timeout: None,
            }
        );
    }
}
