//! Endpoints: the uniform abstraction of "a place where snapshots live or
//! are going". Variants are a tagged enum, not a dispatch hierarchy; every
//! operation is endpoint-local. Cross-endpoint logic belongs to the
//! transfer pipeline.

use crate::model::{CompressKind, EncryptKind, TargetConfig};
use crate::sys::btrfs::{self, SnapshotReceiver, SnapshotSender, Subvolume, SubvolumeInfo};
#[mockall_double::double]
use crate::sys::fs::double as fs_double;
#[mockall_double::double]
use crate::sys::process::double as process_double;
use crate::transport::ssh::{acquire_session, SshOptions, PASSWORDLESS_VAR};
use crate::transport::{shell_quote, Elevation, Transport};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use slog_scope::debug;
use std::ffi::OsString;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ## Endpoint URLs ##################################################################################################

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Ssh,
    Raw,
    RawSsh,
}

impl Scheme {
    pub fn is_raw(self) -> bool {
        matches!(self, Scheme::Raw | Scheme::RawSsh)
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Scheme::Ssh | Scheme::RawSsh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: PathBuf,
}

impl FromStr for EndpointUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(Self {
                scheme: Scheme::File,
                user: None,
                host: None,
                port: None,
                path: PathBuf::from(s),
            });
        }

        let (scheme, rest) = if let Some(rest) = strip_prefix(s, "file://") {
            (Scheme::File, rest)
        } else if let Some(rest) = strip_prefix(s, "ssh://") {
            (Scheme::Ssh, rest)
        } else if let Some(rest) = strip_prefix(s, "raw+ssh://") {
            (Scheme::RawSsh, rest)
        } else if let Some(rest) = strip_prefix(s, "raw://") {
            (Scheme::Raw, rest)
        } else {
            bail!("'{}' is not a recognized endpoint URL", s);
        };

        if !scheme.is_remote() {
            if !rest.starts_with('/') {
                bail!("'{}' must use an absolute path", s);
            }
            return Ok(Self {
                scheme,
                user: None,
                host: None,
                port: None,
                path: PathBuf::from(rest),
            });
        }

        let slash = rest
            .find('/')
            .ok_or_else(|| anyhow!("'{}' is missing the destination path", s))?;
        let (authority, path) = rest.split_at(slash);
        // scp-style `host:/dir` keeps the colon in the authority
        let authority = authority.trim_end_matches(':');
        let (user, hostport) = match authority.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };
        let (host, port) = match hostport.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                Some(port.parse::<u16>().context(format!("invalid port in '{}'", s))?),
            ),
            None => (hostport.to_string(), None),
        };
        if host.is_empty() {
            bail!("'{}' is missing a host", s);
        }

        Ok(Self {
            scheme,
            user,
            host: Some(host),
            port,
            path: PathBuf::from(path),
        })
    }
}

impl Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::File => write!(f, "{}", self.path.display()),
            Scheme::Raw => write!(f, "raw://{}", self.path.display()),
            Scheme::Ssh | Scheme::RawSsh => {
                let prefix = if self.scheme == Scheme::Ssh { "ssh" } else { "raw+ssh" };
                write!(f, "{}://", prefix)?;
                if let Some(user) = &self.user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", self.host.as_deref().unwrap_or_default())?;
                if let Some(port) = self.port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", self.path.display())
            }
        }
    }
}

fn strip_prefix<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.starts_with(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

// ## Errors #########################################################################################################

#[derive(Error, Debug)]
#[error("path {path:?} on {host} is not a mount point")]
pub struct NotMountedError {
    pub path: PathBuf,
    pub host: String,
}

// ## Raw sidecars ###################################################################################################

/// Sidecar metadata written next to a raw stream file. Mandatory: restore
/// and retention read nothing else about a raw snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawSnapshotMeta {
    pub name: String,
    pub uuid: Uuid,
    pub received_uuid: Option<Uuid>,
    pub parent_uuid: Option<Uuid>,
    pub compression: CompressKind,
    pub encryption: EncryptKind,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl RawSnapshotMeta {
    pub fn stream_file_name(&self) -> String {
        let mut name = format!("{}.btrfs", self.name);
        if let Some(ext) = self.compression.extension() {
            name.push('.');
            name.push_str(ext);
        }
        if let Some(ext) = self.encryption.extension() {
            name.push('.');
            name.push_str(ext);
        }
        name
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.meta", self.name)
    }
}

// ## Endpoint variants ##############################################################################################

#[derive(Clone, Debug)]
pub enum Endpoint {
    Local(LocalEndpoint),
    Remote(RemoteEndpoint),
    Raw(RawFileEndpoint),
}

#[derive(Clone, Debug)]
pub struct LocalEndpoint {
    pub directory: PathBuf,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct RemoteEndpoint {
    pub directory: PathBuf,
    #[derivative(Debug = "ignore")]
    transport: Transport,
    host: String,
    sudo: bool,
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct RawFileEndpoint {
    pub directory: PathBuf,
    #[derivative(Debug = "ignore")]
    transport: Transport,
    host: Option<String>,
    sudo: bool,
    pub compression: CompressKind,
    pub encryption: EncryptKind,
    pub gpg_recipient: Option<String>,
}

impl Endpoint {
    /// A native local endpoint, used for source volumes and local targets.
    pub fn local(directory: PathBuf) -> Self {
        Endpoint::Local(LocalEndpoint { directory })
    }

    /// Build the endpoint a target config describes, borrowing a shared
    /// ssh session when the target is remote.
    pub fn from_target(target: &TargetConfig) -> Result<Self> {
        let url: EndpointUrl = target.path.parse()?;
        let transport = if let Some(host) = &url.host {
            let mut options = SshOptions::new(host.clone());
            options.user = url.user.clone();
            options.port = url.port.or(target.ssh_port);
            options.identity = target.ssh_key.clone();
            options.password_auth = target.ssh_password_auth;
            options.sudo = target.ssh_sudo;
            options.persist_secs = target.ssh_persist_secs;
            Transport::Ssh(acquire_session(options))
        } else {
            Transport::Local
        };

        Ok(match url.scheme {
            Scheme::File => Endpoint::Local(LocalEndpoint { directory: url.path }),
            Scheme::Ssh => Endpoint::Remote(RemoteEndpoint {
                directory: url.path,
                transport,
                host: url.host.clone().expect("ssh scheme always has a host"),
                sudo: target.ssh_sudo,
            }),
            Scheme::Raw | Scheme::RawSsh => Endpoint::Raw(RawFileEndpoint {
                directory: url.path,
                transport,
                host: url.host.clone(),
                sudo: target.ssh_sudo,
                compression: target.compress,
                encryption: target.encrypt,
                gpg_recipient: target.gpg_recipient.clone(),
            }),
        })
    }

    pub fn directory(&self) -> &Path {
        match self {
            Endpoint::Local(e) => &e.directory,
            Endpoint::Remote(e) => &e.directory,
            Endpoint::Raw(e) => &e.directory,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Endpoint::Local(_) => Transport::Local,
            Endpoint::Remote(e) => e.transport.clone(),
            Endpoint::Raw(e) => e.transport.clone(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Endpoint::Raw(_))
    }

    /// Human-readable location for journal subjects and error context.
    pub fn describe(&self) -> String {
        match self {
            Endpoint::Local(e) => e.directory.display().to_string(),
            Endpoint::Remote(e) => format!("ssh://{}{}", e.host, e.directory.display()),
            Endpoint::Raw(e) => match &e.host {
                Some(host) => format!("raw+ssh://{}{}", host, e.directory.display()),
                None => format!("raw://{}", e.directory.display()),
            },
        }
    }

    /// Elevation mode for commands at this endpoint. Data channels never
    /// use stdin-fed sudo; when a password may be needed the askpass
    /// helper keeps the channel clean.
    pub fn elevation(&self) -> Elevation {
        let sudo = match self {
            Endpoint::Local(_) => false,
            Endpoint::Remote(e) => e.sudo,
            Endpoint::Raw(e) => e.sudo,
        };
        if !sudo {
            Elevation::None
        } else if std::env::var_os(PASSWORDLESS_VAR).is_some() {
            Elevation::NonInteractive
        } else {
            Elevation::Askpass
        }
    }

    fn run_query(&self, argv: Vec<OsString>) -> Result<String> {
        let command = self.transport().command(&argv, self.elevation())?;
        process_double::capture_stdout(command)
    }

    // ## Enumeration ################################################################################################

    /// List the subvolumes below this endpoint's directory. Paths in the
    /// result are filesystem-root relative, as btrfs reports them; callers
    /// match on file names.
    pub fn list_subvolumes(&self) -> Result<Vec<Subvolume>> {
        let output = self
            .run_query(btrfs::subvolume_list_args(self.directory()))
            .with_context(|| format!("cannot enumerate snapshots at {}", self.describe()))?;
        Subvolume::parse_list(&output)
    }

    /// Parse every raw sidecar in this endpoint's directory.
    pub fn list_raw_metas(&self) -> Result<Vec<RawSnapshotMeta>> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        match &raw.transport {
            Transport::Local => {
                let mut metas = Vec::new();
                let entries = std::fs::read_dir(&raw.directory)
                    .with_context(|| format!("cannot enumerate snapshots at {}", self.describe()))?;
                for entry in entries {
                    let entry = entry?;
                    if entry.path().extension().map(|e| e == "meta").unwrap_or(false) {
                        let data = std::fs::read(entry.path())?;
                        match serde_json::from_slice::<RawSnapshotMeta>(&data) {
                            Ok(meta) => metas.push(meta),
                            Err(e) => debug!("skipping unparseable sidecar"; "file" => ?entry.path(), "error" => %e),
                        }
                    }
                }
                Ok(metas)
            }
            Transport::Ssh(_) => {
                let script = format!("cat {}/*.meta 2>/dev/null || true", shell_quote(raw.directory.as_os_str()));
                let argv: Vec<OsString> = vec!["sh".into(), "-c".into(), script.into()];
                let output = self
                    .run_query(argv)
                    .with_context(|| format!("cannot enumerate snapshots at {}", self.describe()))?;
                let mut metas = Vec::new();
                for item in serde_json::Deserializer::from_str(&output).into_iter::<RawSnapshotMeta>() {
                    match item {
                        Ok(meta) => metas.push(meta),
                        Err(e) => {
                            debug!("skipping unparseable sidecar data"; "endpoint" => self.describe(), "error" => %e)
                        }
                    }
                }
                Ok(metas)
            }
        }
    }

    // ## Queries ####################################################################################################

    pub fn subvolume_show(&self, path: &Path) -> Result<SubvolumeInfo> {
        let output = self
            .run_query(btrfs::subvolume_show_args(path))
            .with_context(|| format!("cannot show subvolume {:?} at {}", path, self.describe()))?;
        SubvolumeInfo::parse_show(&output)
    }

    /// Bytes available at this endpoint's directory, and the quota-limited
    /// free space when one applies (not reported by either backend today).
    pub fn free_bytes(&self) -> Result<(u64, Option<u64>)> {
        match self.transport() {
            Transport::Local => fs_double::filesystem_free_bytes(self.directory()).map(|free| (free, None)),
            Transport::Ssh(_) => {
                let argv: Vec<OsString> = vec![
                    "df".into(),
                    "-B1".into(),
                    "--output=avail".into(),
                    self.directory().into(),
                ];
                let output = self.run_query(argv)?;
                let free = output
                    .lines()
                    .last()
                    .map(str::trim)
                    .and_then(|l| l.parse::<u64>().ok())
                    .ok_or_else(|| anyhow!("unparseable df output: {}", output))?;
                Ok((free, None))
            }
        }
    }

    /// True when the endpoint directory sits on a filesystem that can
    /// receive native streams.
    pub fn on_compatible_filesystem(&self) -> Result<bool> {
        match self.transport() {
            Transport::Local => Ok(fs_double::mountentry_containing(self.directory())
                .map(|m| crate::sys::fs::receives_native_streams(&m))
                .unwrap_or(false)),
            Transport::Ssh(_) => {
                let argv: Vec<OsString> = vec!["stat".into(), "-f".into(), "-c".into(), "%T".into(), self.directory().into()];
                let fstype = self.run_query(argv)?;
                Ok(fstype.trim() == "btrfs")
            }
        }
    }

    // ## Mutations ##################################################################################################

    /// Create the endpoint directory if missing; idempotent.
    pub fn ensure_directory(&self) -> Result<()> {
        let argv: Vec<OsString> = vec!["mkdir".into(), "-p".into(), self.directory().into()];
        let command = self.transport().command(&argv, self.elevation())?;
        process_double::capture_stdout(command)
            .map(|_| ())
            .with_context(|| format!("cannot create directory at {}", self.describe()))
    }

    /// Fail unless the endpoint directory is a mount point. Guards against
    /// silently filling the root filesystem when an external drive is
    /// absent.
    pub fn require_mounted(&self) -> Result<()> {
        let mounted = match self.transport() {
            Transport::Local => fs_double::mountentry_at(self.directory()).is_some(),
            Transport::Ssh(_) => {
                let argv: Vec<OsString> = vec!["mountpoint".into(), "-q".into(), self.directory().into()];
                let command = self.transport().command(&argv, Elevation::None)?;
                let output = process_double::capture(command).context("mountpoint check failed to run")?;
                output.status.success()
            }
        };
        if mounted {
            Ok(())
        } else {
            Err(NotMountedError {
                path: self.directory().to_path_buf(),
                host: match self {
                    Endpoint::Remote(e) => e.host.clone(),
                    Endpoint::Raw(RawFileEndpoint { host: Some(h), .. }) => h.clone(),
                    _ => String::from("localhost"),
                },
            }
            .into())
        }
    }

    /// Take a read-only snapshot of source at dest_path. Atomic: when the
    /// command fails a leftover target is deleted before returning.
    pub fn create_snapshot(&self, source: &Path, dest_path: &Path) -> Result<SubvolumeInfo> {
        let created = self
            .run_query(btrfs::snapshot_args(source, dest_path))
            .with_context(|| format!("failed to create snapshot at {:?}", dest_path));
        if let Err(e) = created {
            if self.subvolume_show(dest_path).is_ok() {
                let _ = self.run_query(btrfs::delete_args(dest_path));
            }
            return Err(e);
        }
        self.subvolume_show(dest_path)
            .context("snapshot created but does not show as a subvolume")
    }

    /// Delete a subvolume; idempotent on "already gone". Read-only
    /// subvolumes are made writable first only when the caller says so.
    pub fn destroy_subvolume(&self, path: &Path, convert_rw: bool) -> Result<()> {
        if convert_rw {
            // Ignore failure: deletion of an already-writable subvolume
            // would fail the property set but still succeed below.
            let _ = self.run_query(btrfs::make_writable_args(path));
        }
        let command = self
            .transport()
            .command(&btrfs::delete_args(path), self.elevation())?;
        let output = process_double::capture(command).context("failed to run subvolume delete")?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such file or directory") || stderr.contains("Not a Btrfs subvolume") {
            debug!("destroy of missing subvolume ignored"; "path" => ?path);
            return Ok(());
        }
        Err(anyhow!("failed to delete subvolume {:?}: {}", path, stderr.trim()))
    }

    // ## Streams ####################################################################################################

    /// Open the replication byte source for a snapshot, incrementally
    /// against parent when given. `no_data` produces the metadata-only
    /// stream used for space estimation.
    pub fn open_send_stream(&self, snapshot: &Path, parent: Option<&Path>, no_data: bool) -> Result<SnapshotSender> {
        if self.is_raw() {
            bail!("raw endpoints store streams; use open_raw_read_stream for restore");
        }
        let argv = btrfs::send_args(snapshot, parent, no_data);
        let command = self.transport().stream_command(&argv, self.elevation())?;
        Ok(SnapshotSender::new(command))
    }

    /// Open the receive sink materializing a subvolume under this
    /// endpoint's directory. `decompress` names the compression applied on
    /// the wire, undone in front of the receiver on the same host.
    pub fn open_receive_stream(&self, decompress: CompressKind) -> Result<SnapshotReceiver> {
        if self.is_raw() {
            bail!("raw endpoints store streams; use open_raw_write_stream");
        }
        let receive = btrfs::receive_args(self.directory());
        let command = match (decompress.decompress_argv(), self.transport().is_remote()) {
            (Some(decomp), true) => {
                let decomp: Vec<OsString> = decomp.into_iter().map(OsString::from).collect();
                self.transport().stream_pipeline(&[decomp, receive], self.elevation())?
            }
            (Some(_), false) => {
                // A local native target gains nothing from a compression
                // round-trip; the stream is piped straight through.
                debug!("ignoring compression for local native target"; "target" => self.describe());
                self.transport().stream_command(&receive, self.elevation())?
            }
            (None, _) => self.transport().stream_command(&receive, self.elevation())?,
        };
        Ok(SnapshotReceiver::new(command))
    }

    /// Open the writer that stores an incoming (already compressed and
    /// encrypted) stream as a raw file.
    pub fn open_raw_write_stream(&self, meta: &RawSnapshotMeta) -> Result<SnapshotReceiverRaw> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        let file = raw.directory.join(meta.stream_file_name());
        let script = format!("cat > {q} && sync {q}", q = shell_quote(file.as_os_str()));
        let argv: Vec<OsString> = vec!["sh".into(), "-c".into(), script.into()];
        let command = self.transport().stream_command(&argv, self.elevation())?;
        Ok(SnapshotReceiverRaw::new(command, file))
    }

    /// Open the byte source replaying a stored raw stream as a native
    /// stream: the file contents with encryption and compression undone at
    /// the storing side.
    pub fn open_raw_read_stream(&self, meta: &RawSnapshotMeta) -> Result<SnapshotSender> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        let file = raw.directory.join(meta.stream_file_name());
        let mut stages: Vec<Vec<OsString>> = vec![vec!["cat".into(), file.into()]];
        if let Some(decrypt) = meta.encryption.decrypt_argv() {
            stages.push(decrypt.into_iter().map(OsString::from).collect());
        }
        if let Some(decomp) = meta.compression.decompress_argv() {
            stages.push(decomp.into_iter().map(OsString::from).collect());
        }
        let command = if stages.len() == 1 {
            self.transport().stream_command(&stages[0], Elevation::None)?
        } else {
            self.transport().stream_pipeline(&stages, Elevation::None)?
        };
        Ok(SnapshotSender::new(command))
    }

    /// Write and fsync a raw sidecar.
    pub fn write_raw_meta(&self, meta: &RawSnapshotMeta) -> Result<()> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        let path = raw.directory.join(meta.meta_file_name());
        let mut data = serde_json::to_vec(meta)?;
        data.push(b'\n');
        match &raw.transport {
            Transport::Local => {
                use std::io::Write;
                let mut file = std::fs::File::create(&path)?;
                file.write_all(&data)?;
                file.sync_all()?;
                Ok(())
            }
            Transport::Ssh(_) => {
                let script = format!("cat > {q} && sync {q}", q = shell_quote(path.as_os_str()));
                let argv: Vec<OsString> = vec!["sh".into(), "-c".into(), script.into()];
                let mut command = self.transport().command(&argv, self.elevation())?;
                command.stdin(std::process::Stdio::piped());
                command.stdout(std::process::Stdio::piped());
                command.stderr(std::process::Stdio::piped());
                let mut child = command.spawn().context("failed to spawn sidecar writer")?;
                {
                    use std::io::Write;
                    let stdin = child.stdin.as_mut().expect("stdin was piped");
                    stdin.write_all(&data)?;
                }
                let output = child.wait_with_output()?;
                crate::sys::process::check_exit(output.status, &String::from_utf8_lossy(&output.stderr))
                    .context("sidecar write failed on the storing side")
            }
        }
    }

    /// Size of a stored raw stream file, for post-transfer verification.
    pub fn raw_file_size(&self, meta: &RawSnapshotMeta) -> Result<u64> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        let file = raw.directory.join(meta.stream_file_name());
        let argv: Vec<OsString> = vec!["stat".into(), "-c".into(), "%s".into(), file.into()];
        let output = self.run_query(argv)?;
        output
            .trim()
            .parse::<u64>()
            .with_context(|| format!("unparseable stat output: {}", output))
    }

    /// Delete a stored raw stream and its sidecar; idempotent.
    pub fn destroy_raw(&self, meta: &RawSnapshotMeta) -> Result<()> {
        let raw = match self {
            Endpoint::Raw(e) => e,
            _ => bail!("{} is not a raw endpoint", self.describe()),
        };
        let stream = raw.directory.join(meta.stream_file_name());
        let sidecar = raw.directory.join(meta.meta_file_name());
        let argv: Vec<OsString> = vec!["rm".into(), "-f".into(), stream.into(), sidecar.into()];
        self.run_query(argv).map(|_| ()).context("failed to remove raw snapshot")
    }
}

/// Writer half of a raw-file transfer, mirroring the native receiver's
/// start/writer/wait surface so the pipeline treats both sinks alike.
pub struct SnapshotReceiverRaw {
    command: tokio::process::Command,
    file: PathBuf,
}

pub struct StartedSnapshotReceiverRaw {
    child: tokio::process::Child,
    pub file: PathBuf,
}

impl SnapshotReceiverRaw {
    fn new(mut command: tokio::process::Command, file: PathBuf) -> Self {
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::piped());
        Self { command, file }
    }

    pub fn start(mut self) -> Result<StartedSnapshotReceiverRaw> {
        self.command
            .spawn()
            .map(|child| StartedSnapshotReceiverRaw { child, file: self.file })
            .context("failed to spawn raw stream writer")
    }
}

impl StartedSnapshotReceiverRaw {
    pub fn writer(&mut self) -> impl tokio::io::AsyncWrite + Send + Unpin {
        self.child.stdin.take().expect("child did not have a handle to stdin")
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(mut self) -> Result<()> {
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "raw stream writer failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod url_tests {
    use super::*;

    #[test]
    fn bare_absolute_path_is_local() {
        let url: EndpointUrl = "/mnt/backup".parse().unwrap();
        assert_eq!(url.scheme, Scheme::File);
        assert_eq!(url.path, PathBuf::from("/mnt/backup"));
        assert_eq!(url.to_string(), "/mnt/backup");
    }

    #[test]
    fn file_scheme_is_local() {
        let url: EndpointUrl = "file:///mnt/backup".parse().unwrap();
        assert_eq!(url.scheme, Scheme::File);
        assert_eq!(url.path, PathBuf::from("/mnt/backup"));
    }

    #[test]
    fn ssh_scheme_with_all_parts() {
        let url: EndpointUrl = "ssh://backup@nas:2222/pool/backups".parse().unwrap();
        assert_eq!(url.scheme, Scheme::Ssh);
        assert_eq!(url.user.as_deref(), Some("backup"));
        assert_eq!(url.host.as_deref(), Some("nas"));
        assert_eq!(url.port, Some(2222));
        assert_eq!(url.path, PathBuf::from("/pool/backups"));
        assert_eq!(url.to_string(), "ssh://backup@nas:2222/pool/backups");
    }

    #[test]
    fn ssh_scheme_scp_style_colon() {
        let url: EndpointUrl = "ssh://backup@nas:/pool/backups".parse().unwrap();
        assert_eq!(url.host.as_deref(), Some("nas"));
        assert_eq!(url.port, None);
        assert_eq!(url.path, PathBuf::from("/pool/backups"));
    }

    #[test]
    fn raw_schemes() {
        let url: EndpointUrl = "raw:///mnt/usb/backups".parse().unwrap();
        assert_eq!(url.scheme, Scheme::Raw);
        assert!(url.scheme.is_raw());
        assert!(!url.scheme.is_remote());

        let url: EndpointUrl = "raw+ssh://nas/backups".parse().unwrap();
        assert_eq!(url.scheme, Scheme::RawSsh);
        assert!(url.scheme.is_raw());
        assert!(url.scheme.is_remote());
        assert_eq!(url.host.as_deref(), Some("nas"));
    }

    #[test]
    fn rejects_relative_and_garbage() {
        assert!("mnt/backup".parse::<EndpointUrl>().is_err());
        assert!("ftp://host/dir".parse::<EndpointUrl>().is_err());
        assert!("ssh://".parse::<EndpointUrl>().is_err());
        assert!("ssh://host".parse::<EndpointUrl>().is_err());
        assert!("ssh://host:notaport/dir".parse::<EndpointUrl>().is_err());
    }
}


#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use crate::tests::prelude::*;

    #[test]
    #[serial(fakecmd)]
    fn local_list_parses_btrfs_output() {
        const BTRFS_DATA: &str = indoc!(
            r#"
            ID 285 gen 48 cgen 48 parent 284 top level 284 parent_uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 received_uuid -                                    uuid 269b40d7-e072-954e-9138-04cbef62a13f path .snapship/home-20260101-000000"#
        );
        let ctx = process_double::capture_stdout_context();
        ctx.expect().returning(|_| Ok(BTRFS_DATA.to_string()));

        let endpoint = Endpoint::local(PathBuf::from("/home/.snapship"));
        let subvolumes = endpoint.list_subvolumes().unwrap();
        assert_eq!(subvolumes.len(), 1);
        assert_eq!(
            subvolumes[0].path.file_name().unwrap().to_string_lossy(),
            "home-20260101-000000"
        );
    }

    #[test]
    #[serial(fakecmd)]
    fn destroy_missing_subvolume_is_idempotent() {
        use std::os::unix::process::ExitStatusExt;
        let ctx = process_double::capture_context();
        ctx.expect().returning(|_| {
            Ok(std::process::Output {
                status: std::process::ExitStatus::from_raw(256),
                stdout: Vec::new(),
                stderr: b"ERROR: Could not statfs: No such file or directory".to_vec(),
            })
        });

        let endpoint = Endpoint::local(PathBuf::from("/mnt/backup"));
        endpoint
            .destroy_subvolume(Path::new("/mnt/backup/home-20260101-000000"), false)
            .unwrap();
    }

    #[test]
    #[serial(fakecmd)]
    fn free_bytes_local_uses_statvfs() {
        let fs_ctx = fs_double::filesystem_free_bytes_context();
        fs_ctx.expect().returning(|_| Ok(5 * 1024 * 1024 * 1024));

        let endpoint = Endpoint::local(PathBuf::from("/mnt/backup"));
        assert_eq!(endpoint.free_bytes().unwrap(), (5 * 1024 * 1024 * 1024, None));
    }

    #[test]
    #[serial(fakecmd)]
    fn require_mounted_fails_when_absent() {
        let fs_ctx = fs_double::mountentry_at_context();
        fs_ctx.expect().returning(|_| None);

        let endpoint = Endpoint::local(PathBuf::from("/mnt/absent"));
        let err = endpoint.require_mounted().unwrap_err();
        assert!(err.downcast_ref::<NotMountedError>().is_some());
    }
}
