//! Subprocess execution with output capture, shaped for mocking: code that
//! shells out goes through the `double` module so tests can substitute
//! canned output for real commands.

use anyhow::{anyhow, Result};
use std::process::{Command, ExitStatus, Output, Stdio};

/// Fold an exit status and the stderr that came with it into a single
/// result. Whatever the process said on stderr becomes the error detail;
/// a silent failure still reports how the process ended.
pub fn check_exit(status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let detail = match stderr.trim() {
        "" => "(no stderr output)",
        said => said,
    };
    match status.code() {
        Some(code) => Err(anyhow!("exit status {}: {}", code, detail)),
        None => Err(anyhow!("killed by signal: {}", detail)),
    }
}

/// True when an executable with this name is reachable through PATH.
pub fn binary_in_path(name: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(name);
                candidate
                    .metadata()
                    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;

    /// Run a command to completion with both pipes captured, reporting
    /// spawn failures only; the caller inspects the exit status.
    pub fn capture(mut command: Command) -> std::io::Result<Output> {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.output()
    }

    /// Run a command and hand back its stdout; a nonzero exit becomes an
    /// error carrying the stderr text.
    pub fn capture_stdout(mut command: Command) -> Result<String> {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let output = command.output()?;
        check_exit(output.status, &String::from_utf8_lossy(&output.stderr))?;
        String::from_utf8(output.stdout).map_err(|_| anyhow!("command produced non-utf8 output"))
    }
}
