/// Builds the command line handed to the session from trailing arguments.
///
/// A single argument is taken verbatim, so `pollproc -- "sh -c 'echo hi'"`
/// runs exactly that line. Several arguments are quoted individually so each
/// survives as one argv entry.
pub fn join_command_line(args: &[String]) -> anyhow::Result<String> {
    match args {
        [] => anyhow::bail!("no command line given"),
        [single] => Ok(single.clone()),
        _ => quote_args(args),
    }
}

#[cfg(unix)]
fn quote_args(args: &[String]) -> anyhow::Result<String> {
    shlex::try_join(args.iter().map(String::as_str))
        .map_err(|err| anyhow::anyhow!("cannot quote command line: {err}"))
}

#[cfg(windows)]
fn quote_args(args: &[String]) -> anyhow::Result<String> {
    Ok(args
        .iter()
        .map(|arg| quote_windows_arg(arg))
        .collect::<Vec<_>>()
        .join(" "))
}

/// Quotes one argument so that `CommandLineToArgvW` yields it unchanged.
#[cfg(windows)]
fn quote_windows_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| matches!(c, ' ' | '\t' | '\n' | '\r' | '"'));
    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.push_str(&"\\".repeat(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.push_str(&"\\".repeat(backslashes));
                backslashes = 0;
                quoted.push(ch);
            }
        }
    }
    quoted.push_str(&"\\".repeat(backslashes * 2));
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn single_argument_is_used_verbatim() -> anyhow::Result<()> {
        assert_eq!(
            join_command_line(&args(&["sh -c 'echo hi'"]))?,
            "sh -c 'echo hi'"
        );
        Ok(())
    }

    #[test]
    fn empty_argument_list_is_rejected() {
        assert!(join_command_line(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn separate_arguments_survive_splitting() -> anyhow::Result<()> {
        let original = args(&["sh", "-c", "echo \"a b\"; exit 3"]);
        let joined = join_command_line(&original)?;
        assert_eq!(shlex::split(&joined), Some(original));
        Ok(())
    }

    #[cfg(windows)]
    #[test]
    fn windows_arguments_with_spaces_and_quotes_are_escaped() -> anyhow::Result<()> {
        assert_eq!(
            join_command_line(&args(&["cmd", "/c", "echo \"a b\""]))?,
            r#"cmd /c "echo \"a b\"""#
        );
        Ok(())
    }
}
