//! Multiplexed ssh sessions.
//!
//! One authentication handshake per `(user, host, port, identity)` key is
//! amortised over every operation of a run: the first command establishes
//! an OpenSSH control master (`ControlMaster=auto`) and later commands ride
//! its channels. Sessions are reference counted through `Arc`; the control
//! master itself lingers for `persist_secs` after the last channel closes
//! and the drop of the last `Arc` asks it to exit early.

use super::{quote_argv, shell_quote, TransportError};
use crate::sys::process::double as process_double;
use once_cell::sync::Lazy;
use slog_scope::{debug, warn};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, Weak};

const REMOTE_STATE_DIR: &str = ".cache/snapship";
const REMOTE_SECRET_FILE: &str = ".cache/snapship/sudopw";
const REMOTE_ASKPASS_FILE: &str = ".cache/snapship/askpass";

pub const SUDO_PASSWORD_VAR: &str = "SNAPSHIP_SUDO_PASSWORD";
pub const SSH_PASSWORD_VAR: &str = "SNAPSHIP_SSH_PASSWORD";
pub const PASSWORDLESS_VAR: &str = "SNAPSHIP_PASSWORDLESS";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshOptions {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub password_auth: bool,
    pub sudo: bool,
    pub persist_secs: u64,
}

impl SshOptions {
    pub fn new(host: String) -> Self {
        Self {
            user: None,
            host,
            port: None,
            identity: None,
            password_auth: false,
            sudo: false,
            persist_secs: 60,
        }
    }

    fn session_key(&self) -> SessionKey {
        SessionKey {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            identity: self.identity.clone(),
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    user: Option<String>,
    host: String,
    port: Option<u16>,
    identity: Option<PathBuf>,
}

/// How the session ended up authenticating. Key-based is preferred and
/// attempted first; passphrase-protected keys fall back to a local prompt
/// (agent or tty); password auth is the last resort and needs sshpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Key,
    KeyWithPrompt,
    Password,
}

static SESSION_TABLE: Lazy<Mutex<HashMap<SessionKey, Weak<SshSession>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Borrow the shared session for options, establishing it on first use.
/// All destinations on the same host within one run end up on the same
/// control master.
pub fn acquire_session(options: SshOptions) -> Arc<SshSession> {
    let key = options.session_key();
    let mut table = SESSION_TABLE.lock().expect("session table is never poisoned");
    if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let session = Arc::new(SshSession::new(options));
    table.insert(key, Arc::downgrade(&session));
    session
}

pub struct SshSession {
    options: SshOptions,
    control_path: OsString,
    auth_mode: Mutex<Option<AuthMode>>,
    /// Elevation secret, write-once per session, wiped on teardown.
    secret: Mutex<Option<Vec<u8>>>,
    ssh_password: Mutex<Option<Vec<u8>>>,
    askpass_ready: Mutex<bool>,
}

impl SshSession {
    fn new(options: SshOptions) -> Self {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").unwrap_or_else(|| OsString::from("/tmp"));
        let mut control_path = runtime_dir;
        control_path.push("/snapship-%C");
        Self {
            options,
            control_path,
            auth_mode: Mutex::new(None),
            secret: Mutex::new(None),
            ssh_password: Mutex::new(None),
            askpass_ready: Mutex::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.options.host
    }

    pub fn sudo(&self) -> bool {
        self.options.sudo
    }

    /// Build a command that runs argv on the remote host. The remote side
    /// is always a `sh` word list, individually quoted here.
    pub fn command(
        &self,
        argv: &[OsString],
        elevation: super::Elevation,
    ) -> Result<std::process::Command, TransportError> {
        let auth_mode = self.established()?;
        let remote = self.remote_command_string(argv, elevation)?;
        Ok(self.raw_command(auth_mode, remote))
    }

    fn remote_command_string(&self, argv: &[OsString], elevation: super::Elevation) -> Result<String, TransportError> {
        let quoted = quote_argv(argv);
        Ok(match elevation {
            super::Elevation::None => quoted,
            super::Elevation::NonInteractive => format!("sudo -n {}", quoted),
            // Stdin-fed sudo is reserved for control commands; the caller
            // owns feeding the secret as the first stdin bytes. The prompt
            // is emptied so no control bytes precede command output.
            super::Elevation::Stdin => format!("sudo -S -p '' {}", quoted),
            super::Elevation::Askpass => {
                self.ensure_askpass()?;
                format!("SUDO_ASKPASS=\"$HOME\"/{} sudo -A {}", shell_quote(REMOTE_ASKPASS_FILE.as_ref()), quoted)
            }
        })
    }

    fn raw_command(&self, auth_mode: AuthMode, remote: String) -> std::process::Command {
        let mut command;
        match auth_mode {
            AuthMode::Password => {
                command = Command::new("sshpass");
                command.arg("-e");
                command.arg("ssh");
                if let Some(password) = self.ssh_password.lock().expect("not poisoned").as_ref() {
                    command.env("SSHPASS", String::from_utf8_lossy(password).into_owned());
                }
                command.arg("-o").arg("PreferredAuthentications=password");
            }
            AuthMode::Key => {
                command = Command::new("ssh");
                command.arg("-o").arg("BatchMode=yes");
            }
            AuthMode::KeyWithPrompt => {
                // No BatchMode: ssh may prompt locally for the key
                // passphrase. The remote side still gets no tty.
                command = Command::new("ssh");
            }
        }
        command
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg({
                let mut o = OsString::from("ControlPath=");
                o.push(&self.control_path);
                o
            })
            .arg("-o")
            .arg(format!("ControlPersist={}", self.options.persist_secs))
            // Never request a remote terminal: elevation password bytes and
            // stream data share stdin otherwise.
            .arg("-T");
        if let Some(port) = self.options.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.options.identity {
            command.arg("-i").arg(identity);
        }
        command.arg(self.options.destination());
        command.arg("--");
        command.arg(remote);
        command
    }

    /// Establish the control master once, detecting the auth family.
    fn established(&self) -> Result<AuthMode, TransportError> {
        let mut mode_guard = self.auth_mode.lock().expect("not poisoned");
        if let Some(mode) = *mode_guard {
            return Ok(mode);
        }

        let probe = |mode: AuthMode| -> Result<(), TransportError> {
            let mut command = self.raw_command(mode, String::from("true"));
            command.stdin(Stdio::null());
            let output = process_double::capture(command)
                .map_err(|e| TransportError::Protocol(format!("failed to spawn ssh: {}", e)))?;
            if output.status.success() {
                return Ok(());
            }
            Err(super::classify_ssh_failure(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        };

        let mode = match probe(AuthMode::Key) {
            Ok(()) => AuthMode::Key,
            Err(TransportError::AuthRejected(detail)) => {
                if self.options.password_auth {
                    let password = self.resolve_password(SSH_PASSWORD_VAR, "ssh password")?;
                    *self.ssh_password.lock().expect("not poisoned") = Some(password);
                    probe(AuthMode::Password).map(|()| AuthMode::Password)?
                } else if terminal_attached() {
                    debug!("key auth rejected in batch mode, retrying with local prompt allowed");
                    probe(AuthMode::KeyWithPrompt).map(|()| AuthMode::KeyWithPrompt)?
                } else {
                    return Err(TransportError::AuthRejected(detail));
                }
            }
            Err(other) => return Err(other),
        };

        debug!("ssh session established"; "host" => %self.options.host, "auth" => ?mode);
        *mode_guard = Some(mode);
        Ok(mode)
    }

    /// The elevation secret for this session: environment, then the
    /// session cache, then an interactive prompt when a terminal exists.
    pub fn elevation_secret(&self) -> Result<Vec<u8>, TransportError> {
        if std::env::var_os(PASSWORDLESS_VAR).is_some() {
            return Err(TransportError::AuthUnavailable);
        }
        let mut cached = self.secret.lock().expect("not poisoned");
        if let Some(secret) = cached.as_ref() {
            return Ok(secret.clone());
        }
        drop(cached);
        let secret = self.resolve_password(SUDO_PASSWORD_VAR, "sudo password")?;
        cached = self.secret.lock().expect("not poisoned");
        if cached.is_none() {
            *cached = Some(secret.clone());
        }
        Ok(secret)
    }

    fn resolve_password(&self, env_var: &str, prompt: &str) -> Result<Vec<u8>, TransportError> {
        if let Ok(value) = std::env::var(env_var) {
            return Ok(value.into_bytes());
        }
        if terminal_attached() {
            let value = rpassword::prompt_password(format!("{} for {}: ", prompt, self.options.destination()))
                .map_err(|e| TransportError::Protocol(format!("terminal prompt failed: {}", e)))?;
            return Ok(value.into_bytes());
        }
        Err(TransportError::AuthUnavailable)
    }

    /// Install the askpass helper and secret file on the remote host so
    /// elevated data-channel commands can use `sudo -A`. Runs at most once
    /// per session; the files live under the remote user's cache dir with
    /// owner-only permissions.
    fn ensure_askpass(&self) -> Result<(), TransportError> {
        let mut ready = self.askpass_ready.lock().expect("not poisoned");
        if *ready {
            return Ok(());
        }
        let secret = self.elevation_secret()?;
        let auth_mode = self.established()?;

        let install = format!(
            "umask 077 && mkdir -p \"$HOME\"/{dir} && cat > \"$HOME\"/{secret} && \
             printf '#!/bin/sh\\nexec cat \"$HOME\"/{secret}\\n' > \"$HOME\"/{askpass} && \
             chmod 700 \"$HOME\"/{askpass}",
            dir = shell_quote(REMOTE_STATE_DIR.as_ref()),
            secret = shell_quote(REMOTE_SECRET_FILE.as_ref()),
            askpass = shell_quote(REMOTE_ASKPASS_FILE.as_ref()),
        );
        let mut command = self.raw_command(auth_mode, install);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| TransportError::Protocol(format!("failed to spawn ssh: {}", e)))?;
        {
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            let mut payload = secret;
            payload.push(b'\n');
            let write_result = stdin.write_all(&payload);
            wipe(&mut payload);
            write_result.map_err(|e| TransportError::Protocol(format!("failed writing secret: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| TransportError::Protocol(format!("askpass install failed: {}", e)))?;
        if !output.status.success() {
            return Err(super::classify_ssh_failure(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        *ready = true;
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Some(mut secret) = self.secret.lock().expect("not poisoned").take() {
            wipe(&mut secret);
        }
        if let Some(mut password) = self.ssh_password.lock().expect("not poisoned").take() {
            wipe(&mut password);
        }

        // Nothing to tear down unless a control master was established.
        let established_mode = match *self.auth_mode.lock().expect("not poisoned") {
            Some(mode) => mode,
            None => return,
        };

        if *self.askpass_ready.lock().expect("not poisoned") {
            let cleanup = format!(
                "rm -f \"$HOME\"/{} \"$HOME\"/{}",
                shell_quote(REMOTE_SECRET_FILE.as_ref()),
                shell_quote(REMOTE_ASKPASS_FILE.as_ref())
            );
            let mut command = self.raw_command(established_mode, cleanup);
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            let _ = command.status();
        }

        let mut exit = Command::new("ssh");
        exit.arg("-o")
            .arg({
                let mut o = OsString::from("ControlPath=");
                o.push(&self.control_path);
                o
            })
            .arg("-O")
            .arg("exit")
            .arg(self.options.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if exit.status().is_err() {
            warn!("failed to signal ssh control master exit"; "host" => %self.options.host);
        }
    }
}

fn wipe(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = 0;
    }
}

fn terminal_attached() -> bool {
    nix::unistd::isatty(0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Elevation;

    fn test_session(options: SshOptions) -> SshSession {
        SshSession::new(options)
    }

    #[test]
    fn remote_string_plain() {
        let session = test_session(SshOptions::new(String::from("nas")));
        let argv: Vec<OsString> = vec!["btrfs".into(), "receive".into(), "/mnt/backup dir".into()];
        assert_eq!(
            session.remote_command_string(&argv, Elevation::None).unwrap(),
            "btrfs receive '/mnt/backup dir'"
        );
    }

    #[test]
    fn remote_string_noninteractive_sudo() {
        let session = test_session(SshOptions::new(String::from("nas")));
        let argv: Vec<OsString> = vec!["btrfs".into(), "subvolume".into(), "list".into(), "/mnt".into()];
        assert_eq!(
            session.remote_command_string(&argv, Elevation::NonInteractive).unwrap(),
            "sudo -n btrfs subvolume list /mnt"
        );
    }

    #[test]
    fn remote_string_stdin_sudo_empties_prompt() {
        let session = test_session(SshOptions::new(String::from("nas")));
        let argv: Vec<OsString> = vec!["true".into()];
        assert_eq!(
            session.remote_command_string(&argv, Elevation::Stdin).unwrap(),
            "sudo -S -p '' true"
        );
    }

    #[test]
    fn session_table_shares_by_key() {
        let mut options = SshOptions::new(String::from("shared-host.test"));
        options.user = Some(String::from("backup"));
        let a = acquire_session(options.clone());
        let b = acquire_session(options);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn destination_includes_user() {
        let mut options = SshOptions::new(String::from("nas"));
        options.user = Some(String::from("backup"));
        assert_eq!(options.destination(), "backup@nas");
        assert_eq!(SshOptions::new(String::from("nas")).destination(), "nas");
    }
}
