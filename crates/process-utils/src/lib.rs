//! Helpers for building and stopping the external programs the render engine drives.
//!
//! Command lines are configured as plain strings (`"renderer --bundle {bundle}"`),
//! split into argv, expanded with per-invocation placeholder values and spawned
//! with consistent stdio and lifetime settings.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Split a configured command line into program and arguments.
///
/// Splits on whitespace; single or double quotes group a token that contains
/// spaces. Quotes are not nested and there is no escape character.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    parts.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if in_token {
        parts.push(current);
    }

    parts
}

/// Replace `{name}` placeholders in every argument.
///
/// Unknown placeholders are left untouched so a misconfigured command fails
/// visibly in the child's own error output.
pub fn expand_placeholders(args: &[String], values: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut expanded = arg.clone();
            for (name, value) in values {
                let needle = format!("{{{name}}}");
                if expanded.contains(&needle) {
                    expanded = expanded.replace(&needle, value);
                }
            }
            expanded
        })
        .collect()
}

/// Create a `std::process::Command` that never opens a console window on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    #[allow(unused_mut)]
    let mut cmd = std::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Create a `tokio::process::Command` for a managed child.
///
/// The child gets a null stdin and is killed when its handle is dropped, so an
/// abandoned render future can never leave an orphaned process behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::from(std_command(program));
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Build a managed command from an argv list (`argv[0]` is the program).
///
/// Returns `None` for an empty argv.
#[cfg(feature = "tokio")]
pub fn tokio_command_from_argv(argv: &[String]) -> Option<tokio::process::Command> {
    let (program, args) = argv.split_first()?;
    let mut cmd = tokio_command(program);
    cmd.args(args);
    Some(cmd)
}

/// Kill a child process and reap it, waiting at most `grace` for the exit.
///
/// Returns `true` when the process is known to have exited.
#[cfg(feature = "tokio")]
pub async fn terminate(child: &mut tokio::process::Child, grace: std::time::Duration) -> bool {
    if let Ok(Some(_)) = child.try_wait() {
        return true;
    }

    if child.start_kill().is_err() {
        // Already gone between try_wait and start_kill.
        return matches!(child.try_wait(), Ok(Some(_)));
    }

    matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_)))
}
