//! Command transports: run an argv locally or on a remote host over a
//! multiplexed ssh session.
//!
//! Endpoints build plain argv vectors (see `sys::btrfs`) and hand them to a
//! transport, which turns them into runnable commands. Cross-endpoint logic
//! never lives here.

pub mod ssh;

use ssh::SshSession;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("no credential available and no terminal to prompt on")]
    AuthUnavailable,
    #[error("remote binary missing: {0}")]
    RemoteBinaryMissing(String),
    #[error("transport protocol failure: {0}")]
    Protocol(String),
}

/// How a command acquires root on the executing side.
///
/// `NonInteractive` fails fast when a password would be needed. `Stdin`
/// feeds the cached secret on the command's stdin and is only usable for
/// control commands whose stdin carries nothing else. `Askpass` routes the
/// prompt through a helper script so the data channel stays free of
/// control bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    None,
    NonInteractive,
    Stdin,
    Askpass,
}

#[derive(Clone)]
pub enum Transport {
    Local,
    Ssh(Arc<SshSession>),
}

impl Transport {
    pub fn is_remote(&self) -> bool {
        matches!(self, Transport::Ssh(_))
    }

    /// Build a one-shot command for a short query operation.
    pub fn command(&self, argv: &[OsString], elevation: Elevation) -> Result<std::process::Command, TransportError> {
        match self {
            Transport::Local => Ok(local_command(argv, elevation)),
            Transport::Ssh(session) => session.command(argv, elevation),
        }
    }

    /// Build a command for a streaming operation (send/receive and the
    /// compressor stages). Identical argv handling, tokio process type.
    pub fn stream_command(
        &self,
        argv: &[OsString],
        elevation: Elevation,
    ) -> Result<tokio::process::Command, TransportError> {
        self.command(argv, elevation).map(tokio::process::Command::from)
    }

    /// Build a streaming command whose remote side is a shell pipeline,
    /// e.g. `zstd -d | btrfs receive <dir>`. Each stage is an argv; stages
    /// are quoted individually and joined with pipes. On the local
    /// transport the pipeline runs under `sh -c` the same way.
    pub fn stream_pipeline(
        &self,
        stages: &[Vec<OsString>],
        elevation: Elevation,
    ) -> Result<tokio::process::Command, TransportError> {
        let joined = stages
            .iter()
            .map(|argv| quote_argv(argv))
            .collect::<Vec<_>>()
            .join(" | ");
        let sh: Vec<OsString> = vec!["sh".into(), "-c".into(), joined.into()];
        match self {
            Transport::Local => {
                // Elevation inside a local pipeline would have to wrap each
                // stage; local runs are expected to already own the
                // privileges they need.
                Ok(tokio::process::Command::from(local_command(&sh, Elevation::None)))
            }
            Transport::Ssh(session) => session.command(&sh, elevation).map(tokio::process::Command::from),
        }
    }
}

fn local_command(argv: &[OsString], elevation: Elevation) -> std::process::Command {
    let argv = apply_local_elevation(argv, elevation);
    let mut command = std::process::Command::new(&argv[0]);
    command.args(&argv[1..]);
    command
}

fn apply_local_elevation(argv: &[OsString], elevation: Elevation) -> Vec<OsString> {
    match elevation {
        Elevation::None => argv.to_vec(),
        Elevation::NonInteractive => {
            let mut wrapped: Vec<OsString> = vec!["sudo".into(), "-n".into()];
            wrapped.extend(argv.iter().cloned());
            wrapped
        }
        // Stdin/Askpass elevation is an ssh concern; a local caller that
        // needs a password prompt has a terminal of its own.
        Elevation::Stdin | Elevation::Askpass => apply_local_elevation(argv, Elevation::NonInteractive),
    }
}

/// Quote a single shell word so a remote `sh` reads it verbatim.
pub fn shell_quote(word: &OsStr) -> String {
    let word = word.to_string_lossy();
    if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c)) {
        return word.into_owned();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

pub fn quote_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a failed ssh invocation to the transport failure taxonomy. OpenSSH
/// reserves exit status 255 for its own failures; anything else came from
/// the remote command.
pub fn classify_ssh_failure(exit_code: Option<i32>, stderr: &str) -> TransportError {
    let detail = stderr.trim().to_string();
    if exit_code != Some(255) {
        if detail.contains("command not found") || detail.contains("No such file or directory") {
            return TransportError::RemoteBinaryMissing(detail);
        }
        return TransportError::Protocol(detail);
    }
    let lowered = detail.to_lowercase();
    if lowered.contains("permission denied") || lowered.contains("authentication failed") {
        TransportError::AuthRejected(detail)
    } else if lowered.contains("could not resolve")
        || lowered.contains("connection refused")
        || lowered.contains("connection timed out")
        || lowered.contains("no route to host")
        || lowered.contains("network is unreachable")
        || lowered.contains("connection reset")
    {
        TransportError::Unreachable(detail)
    } else {
        TransportError::Protocol(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_stay_unquoted() {
        assert_eq!(shell_quote(OsStr::new("/mnt/backup/home-1")), "/mnt/backup/home-1");
        assert_eq!(shell_quote(OsStr::new("btrfs")), "btrfs");
    }

    #[test]
    fn special_words_get_single_quotes() {
        assert_eq!(shell_quote(OsStr::new("a b")), "'a b'");
        assert_eq!(shell_quote(OsStr::new("it's")), r"'it'\''s'");
        assert_eq!(shell_quote(OsStr::new("")), "''");
    }

    #[test]
    fn argv_quoting_joins_words() {
        let argv: Vec<OsString> = vec!["btrfs".into(), "receive".into(), "/mnt/my backups".into()];
        assert_eq!(quote_argv(&argv), "btrfs receive '/mnt/my backups'");
    }

    #[test]
    fn ssh_reserved_exit_classifies_by_stderr() {
        assert!(matches!(
            classify_ssh_failure(Some(255), "user@host: Permission denied (publickey,password)."),
            TransportError::AuthRejected(_)
        ));
        assert!(matches!(
            classify_ssh_failure(Some(255), "ssh: connect to host nas port 22: Connection refused"),
            TransportError::Unreachable(_)
        ));
        assert!(matches!(
            classify_ssh_failure(Some(255), "mux_client_request_session: session request failed"),
            TransportError::Protocol(_)
        ));
    }

    #[test]
    fn remote_command_exit_is_not_transport_failure_class() {
        assert!(matches!(
            classify_ssh_failure(Some(127), "sh: btrfs: command not found"),
            TransportError::RemoteBinaryMissing(_)
        ));
        assert!(matches!(
            classify_ssh_failure(Some(1), "ERROR: cannot find parent subvolume"),
            TransportError::Protocol(_)
        ));
    }
}
