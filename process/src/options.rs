use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_PIPE_NAME_PREFIX: &str = "rpa";
pub const DEFAULT_WAIT_BUDGET_MS: u64 = 100;

// Pipe closure and the process-exit signal are not observed atomically on
// Windows, so exit must be seen twice before it is final.
#[cfg(windows)]
pub const DEFAULT_EXIT_CONFIRMATIONS: u32 = 2;
#[cfg(not(windows))]
pub const DEFAULT_EXIT_CONFIRMATIONS: u32 = 1;

/// Tunables for a [`crate::ProcessSession`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Leading component of every generated pipe name.
    pub pipe_name_prefix: String,
    /// Directory in which Unix FIFOs are created before being unlinked.
    /// Ignored on Windows.
    pub pipe_dir: Option<PathBuf>,
    /// Upper bound for a single wait inside `poll`.
    pub wait_budget_ms: u64,
    /// Number of exit observations required before exit is reported.
    pub exit_confirmations: u32,
    /// Forcefully terminate a still-running child when the session drops.
    pub kill_on_drop: bool,
    /// Unix: start the child in its own process group and signal the whole
    /// group on termination.
    pub new_process_group: bool,
    /// Linux: deliver SIGTERM to the child when this process dies.
    pub parent_death_signal: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pipe_name_prefix: DEFAULT_PIPE_NAME_PREFIX.to_string(),
            pipe_dir: None,
            wait_budget_ms: DEFAULT_WAIT_BUDGET_MS,
            exit_confirmations: DEFAULT_EXIT_CONFIRMATIONS,
            kill_on_drop: false,
            new_process_group: false,
            parent_death_signal: false,
        }
    }
}

impl SessionOptions {
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }

    pub(crate) fn required_confirmations(&self) -> u32 {
        self.exit_confirmations.max(1)
    }

    pub(crate) fn resolved_pipe_dir(&self) -> PathBuf {
        if let Some(dir) = &self.pipe_dir {
            return dir.clone();
        }
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_table_yields_defaults() -> anyhow::Result<()> {
        let options: SessionOptions = toml::from_str("")?;
        assert_eq!(options, SessionOptions::default());
        assert_eq!(options.wait_budget(), Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn partial_table_overrides_selected_fields() -> anyhow::Result<()> {
        let options: SessionOptions = toml::from_str(
            r#"
pipe_name_prefix = "demo"
wait_budget_ms = 25
exit_confirmations = 0
"#,
        )?;
        assert_eq!(options.pipe_name_prefix, "demo");
        assert_eq!(options.wait_budget(), Duration::from_millis(25));
        assert_eq!(options.required_confirmations(), 1);
        assert!(!options.kill_on_drop);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed = toml::from_str::<SessionOptions>("wait_budget = 10");
        assert!(parsed.is_err());
    }

    #[test]
    fn explicit_pipe_dir_wins() {
        let options = SessionOptions {
            pipe_dir: Some(PathBuf::from("/run/custom")),
            ..SessionOptions::default()
        };
        assert_eq!(options.resolved_pipe_dir(), PathBuf::from("/run/custom"));
    }
}
