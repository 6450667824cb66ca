//! Argv builders and output parsers for the btrfs CLI.
//!
//! Builders return plain argv vectors so the caller can route them through
//! any transport (local exec or a remote shell); parsers consume the
//! textual output wherever it ran.

use anyhow::{anyhow, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn argv<I, S>(parts: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(|p| p.into()).collect()
}

pub fn subvolume_show_args(path: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "subvolume".into(),
        "show".into(),
        "--raw".into(),
        path.into(),
    ])
}

pub fn subvolume_list_args(path: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "subvolume".into(),
        "list".into(),
        "-uqRo".into(),
        path.into(),
    ])
}

pub fn snapshot_args(source: &Path, dest: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "subvolume".into(),
        "snapshot".into(),
        "-r".into(),
        source.into(),
        dest.into(),
    ])
}

pub fn delete_args(path: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "subvolume".into(),
        "delete".into(),
        path.into(),
    ])
}

pub fn make_writable_args(path: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "property".into(),
        "set".into(),
        "-ts".into(),
        path.into(),
        "ro".into(),
        "false".into(),
    ])
}

pub fn send_args(path: &Path, parent: Option<&Path>, no_data: bool) -> Vec<OsString> {
    let mut args = vec![OsString::from("btrfs"), "send".into()];
    if no_data {
        args.push("--no-data".into());
    }
    if let Some(parent_path) = parent {
        args.push("-p".into());
        args.push(parent_path.into());
    }
    args.push(path.into());
    args
}

pub fn receive_args(into_dir: &Path) -> Vec<OsString> {
    argv(vec![
        OsString::from("btrfs"),
        "receive".into(),
        into_dir.into(),
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subvolume {
    pub uuid: Uuid,
    pub path: PathBuf,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubvolumeInfo {
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub readonly: bool,
    /// Subvolume creation time as btrfs reports it, when present. Used
    /// for foreign-managed snapshots whose names carry no timestamp.
    pub created_at: Option<chrono::NaiveDateTime>,
}

/// A uuid column in btrfs output: a dash when unset.
fn uuid_field(value: &str) -> Result<Option<Uuid>> {
    if value == "-" {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .with_context(|| format!("'{}' in btrfs output is not a uuid", value))
}

impl Subvolume {
    /// Parse `btrfs subvolume show --raw`: the bare subvolume path on the
    /// first line, then indented `Key: value` rows. Rows this crate does
    /// not care about (and the snapshot listing at the end) fall through.
    pub fn parse_show(output: &str) -> Result<Self> {
        let mut lines = output.lines();
        let path = lines
            .next()
            .map(str::trim)
            .filter(|first| !first.is_empty())
            .ok_or_else(|| anyhow!("btrfs subvolume show produced no output"))?;

        let mut uuid = None;
        let mut parent_uuid = None;
        let mut received_uuid = None;
        for line in lines {
            let (key, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => continue,
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "uuid" => uuid = uuid_field(value)?,
                "parent uuid" => parent_uuid = uuid_field(value)?,
                "received uuid" => received_uuid = uuid_field(value)?,
                _ => {}
            }
        }

        Ok(Self {
            uuid: uuid.ok_or_else(|| anyhow!("btrfs subvolume show output for {} carries no UUID", path))?,
            path: PathBuf::from(path),
            parent_uuid,
            received_uuid,
        })
    }

    /// Parse `btrfs subvolume list -uqRo`. Each row is label/value pairs
    /// ending in `path <rest of line>`; the path is taken verbatim (it may
    /// contain spaces), the uuid columns by label.
    pub fn parse_list(output: &str) -> Result<Vec<Self>> {
        const PATH_LABEL: &str = " path ";
        let mut subvolumes = Vec::new();
        for line in output.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let path_at = line
                .find(PATH_LABEL)
                .ok_or_else(|| anyhow!("btrfs subvolume list row has no path column: {}", line))?;
            let path = line[path_at + PATH_LABEL.len()..].trim();
            let head = &line[..path_at];

            let mut uuid = None;
            let mut parent_uuid = None;
            let mut received_uuid = None;
            let mut tokens = head.split_whitespace();
            while let Some(label) = tokens.next() {
                let slot = match label {
                    "uuid" => &mut uuid,
                    "parent_uuid" => &mut parent_uuid,
                    "received_uuid" => &mut received_uuid,
                    _ => continue,
                };
                let value = tokens
                    .next()
                    .ok_or_else(|| anyhow!("btrfs subvolume list column '{}' has no value: {}", label, line))?;
                *slot = uuid_field(value)?;
            }

            subvolumes.push(Self {
                uuid: uuid.ok_or_else(|| anyhow!("btrfs subvolume list row has no uuid column: {}", line))?,
                path: PathBuf::from(path),
                parent_uuid,
                received_uuid,
            });
        }
        Ok(subvolumes)
    }
}

impl SubvolumeInfo {
    /// Parse `btrfs subvolume show --raw` including the readonly flag and
    /// creation time.
    pub fn parse_show(output: &str) -> Result<Self> {
        let subvolume = Subvolume::parse_show(output)?;

        let mut readonly = false;
        let mut created_at = None;
        for line in output.lines().skip(1) {
            let (key, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => continue,
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "flags" => readonly = value.contains("readonly"),
                // "2026-01-01 04:14:17 +0000": the date and time, offset
                // dropped (foreign timestamps are treated as naive).
                "creation time" if value.len() >= 19 => {
                    created_at = chrono::NaiveDateTime::parse_from_str(&value[..19], "%Y-%m-%d %H:%M:%S").ok();
                }
                _ => {}
            }
        }

        Ok(Self {
            uuid: subvolume.uuid,
            parent_uuid: subvolume.parent_uuid,
            received_uuid: subvolume.received_uuid,
            readonly,
            created_at,
        })
    }
}

pub use operations::*;

mod operations {
    use crate::sys::process::check_exit;
    use anyhow::{anyhow, Context as AnyhowContext, Result};
    use std::process::Stdio;
    use tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
        process::{Child, Command},
        task::JoinHandle,
    };

    pub struct SnapshotSender {
        command: Command,
    }

    impl SnapshotSender {
        pub fn new(mut command: Command) -> Self {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            Self { command }
        }

        pub fn start(mut self) -> Result<StartedSnapshotSender> {
            self.command
                .spawn()
                .map(|mut process| {
                    let stderr_reader = spawn_stderr_reader(process.stderr.take().expect("only taken once"));
                    StartedSnapshotSender {
                        process,
                        stderr_reader,
                    }
                })
                .map_err(|e| anyhow!(e))
        }
    }

    pub struct StartedSnapshotSender {
        process: Child,
        stderr_reader: JoinHandle<String>,
    }

    impl StartedSnapshotSender {
        pub fn reader(&mut self) -> impl AsyncRead + Send + Unpin {
            self.process
                .stdout
                .take()
                .expect("child did not have a handle to stdout")
        }

        pub fn pid(&self) -> Option<u32> {
            self.process.id()
        }

        pub async fn wait(mut self) -> Result<()> {
            let status = self.process.wait().await?;
            let stderr = self.stderr_reader.await.expect("stderr task doesn't panic");
            check_exit(status, &stderr).context("btrfs send failed")
        }
    }

    pub struct SnapshotReceiver {
        command: Command,
    }

    impl SnapshotReceiver {
        pub fn new(mut command: Command) -> Self {
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            Self { command }
        }

        pub fn start(mut self) -> Result<StartedSnapshotReceiver> {
            self.command.spawn().map_err(|e| anyhow!(e)).map(|mut process| {
                let scan_stdout = spawn_output_scanner(process.stdout.take().expect("only taken once"));
                let scan_stderr = spawn_output_scanner(process.stderr.take().expect("only taken once"));
                StartedSnapshotReceiver {
                    process,
                    scan_stdout,
                    scan_stderr,
                }
            })
        }
    }

    /// btrfs receive announces the subvolume it materializes with an
    /// "At subvol <name>" or "At snapshot <name>" line on one of its
    /// output streams. Collect that name; everything else is kept as
    /// diagnostics.
    fn spawn_output_scanner(
        handle: impl AsyncRead + Unpin + Send + 'static,
    ) -> JoinHandle<Result<(Option<String>, String)>> {
        const ANNOUNCEMENTS: [&str; 2] = ["At subvol ", "At snapshot "];
        tokio::spawn(async move {
            let mut lines = BufReader::new(handle).lines();
            let mut name = None;
            let mut diagnostics = String::new();
            while let Some(line) = lines.next_line().await? {
                let announced = ANNOUNCEMENTS.iter().find_map(|prefix| line.strip_prefix(prefix));
                match announced {
                    Some(rest) if name.is_none() && !rest.trim().is_empty() => {
                        name = Some(rest.trim().to_string());
                    }
                    _ => {
                        diagnostics.push_str(&line);
                        diagnostics.push('\n');
                    }
                }
            }
            Ok((name, diagnostics))
        })
    }

    fn spawn_stderr_reader(handle: impl AsyncRead + Unpin + Send + 'static) -> JoinHandle<String> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(handle).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    }

    pub struct StartedSnapshotReceiver {
        process: Child,
        scan_stdout: JoinHandle<Result<(Option<String>, String)>>,
        scan_stderr: JoinHandle<Result<(Option<String>, String)>>,
    }

    pub struct ReceiveResult {
        /// Name of the subvolume the receiver materialized, as reported on
        /// its own output.
        pub incoming_name: String,
        pub diagnostics: String,
    }

    impl StartedSnapshotReceiver {
        pub fn writer(&mut self) -> impl AsyncWrite + Send + Unpin {
            self.process
                .stdin
                .take()
                .expect("child did not have a handle to stdin")
        }

        pub fn pid(&self) -> Option<u32> {
            self.process.id()
        }

        pub async fn wait(mut self) -> Result<ReceiveResult> {
            let status = self.process.wait().await?;
            let (stdout_name, stdout_rest) = self.scan_stdout.await.expect("scanner doesn't panic")?;
            let (stderr_name, stderr_rest) = self.scan_stderr.await.expect("scanner doesn't panic")?;
            let diagnostics = format!("{}{}", stdout_rest, stderr_rest);
            check_exit(status, &diagnostics).context("btrfs receive failed")?;
            let incoming_name = stdout_name
                .or(stderr_name)
                .context("btrfs receive never announced the incoming subvolume")?;
            Ok(ReceiveResult {
                incoming_name,
                diagnostics,
            })
        }
    }
}

#[cfg(test)]
mod subvolume_tests {
    use super::*;
    use crate::tests::prelude::*;

    #[test]
    fn subvolume_show_parses() {
        const BTRFS_DATA: &str = indoc!(
            r#"
            home
                Name: 			home
                UUID: 			0c61d287-c754-2944-a71e-ee6f0cbfb40e
                Parent UUID: 		-
                Received UUID: 		-
                Creation time: 		2026-01-01 04:14:17 +0000
                Subvolume ID: 		256
                Generation: 		587
                Gen at creation: 	6
                Parent ID: 		5
                Top level ID: 		5
                Flags: 			-
                Snapshot(s):
                            .snapship/home-20260101-000000"#
        );

        assert_eq!(
            Subvolume::parse_show(BTRFS_DATA).unwrap(),
            Subvolume {
                path: PathBuf::from("home"),
                uuid: Uuid::parse_str("0c61d287-c754-2944-a71e-ee6f0cbfb40e").unwrap(),
                parent_uuid: None,
                received_uuid: None,
            }
        );
    }

    #[test]
    fn subvolume_show_rejects_empty_and_uuidless_output() {
        assert!(Subvolume::parse_show("").is_err());
        assert!(Subvolume::parse_show("home\n    Name: home\n").is_err());
    }

    #[test]
    fn subvolume_show_readonly_and_creation_time() {
        const BTRFS_DATA: &str = indoc!(
            r#"
            .snapship/home-20260101-000000
                Name: 			home-20260101-000000
                UUID: 			269b40d7-e072-954e-9138-04cbef62a13f
                Parent UUID: 		0c61d287-c754-2944-a71e-ee6f0cbfb40e
                Received UUID: 		-
                Creation time: 		2026-01-01 04:14:17 +0000
                Subvolume ID: 		285
                Generation: 		590
                Gen at creation: 	590
                Parent ID: 		5
                Top level ID: 		5
                Flags: 			readonly
                Snapshot(s):"#
        );

        let info = SubvolumeInfo::parse_show(BTRFS_DATA).unwrap();
        assert!(info.readonly);
        assert_eq!(
            info.parent_uuid,
            Some(Uuid::parse_str("0c61d287-c754-2944-a71e-ee6f0cbfb40e").unwrap())
        );
        assert_eq!(info.received_uuid, None);
        assert_eq!(
            info.created_at,
            Some(chrono::NaiveDateTime::parse_from_str("2026-01-01 04:14:17", "%Y-%m-%d %H:%M:%S").unwrap())
        );
    }

    #[test]
    fn subvolume_list_parses() {
        const BTRFS_DATA: &str = indoc!(
            r#"
            ID 284 gen 50 cgen 47 parent 273 top level 273 parent_uuid -                                    received_uuid -                                    uuid 0cdd2cd3-8e63-4749-adb5-e63a1050b3ea path .snapship
            ID 285 gen 48 cgen 48 parent 284 top level 284 parent_uuid 8a7ae0b5-b28c-b240-8c07-0015431d58d8 received_uuid 45700e9d-9cba-f840-bf2b-b165b87623b7 uuid 269b40d7-e072-954e-9138-04cbef62a13f path .snapship/home-20260101-000000"#
        );

        assert_eq!(
            Subvolume::parse_list(BTRFS_DATA).unwrap(),
            vec![
                Subvolume {
                    path: PathBuf::from(".snapship"),
                    uuid: Uuid::parse_str("0cdd2cd3-8e63-4749-adb5-e63a1050b3ea").unwrap(),
                    parent_uuid: None,
                    received_uuid: None,
                },
                Subvolume {
                    path: PathBuf::from(".snapship/home-20260101-000000"),
                    uuid: Uuid::parse_str("269b40d7-e072-954e-9138-04cbef62a13f").unwrap(),
                    parent_uuid: Some(Uuid::parse_str("8a7ae0b5-b28c-b240-8c07-0015431d58d8").unwrap()),
                    received_uuid: Some(Uuid::parse_str("45700e9d-9cba-f840-bf2b-b165b87623b7").unwrap()),
                }
            ]
        );
    }

    #[test]
    fn subvolume_list_keeps_spaces_in_paths() {
        const BTRFS_DATA: &str = "ID 290 gen 50 cgen 50 parent 273 top level 273 parent_uuid -                                    received_uuid -                                    uuid 0cdd2cd3-8e63-4749-adb5-e63a1050b3ea path backups/my data";
        let parsed = Subvolume::parse_list(BTRFS_DATA).unwrap();
        assert_eq!(parsed[0].path, PathBuf::from("backups/my data"));
    }

    #[test]
    fn subvolume_list_empty_output_is_empty() {
        assert!(Subvolume::parse_list("").unwrap().is_empty());
        assert!(Subvolume::parse_list("\n").unwrap().is_empty());
    }

    #[test]
    fn send_args_with_parent() {
        let args = send_args(
            Path::new("/mnt/.snapship/home-20260101-010000"),
            Some(Path::new("/mnt/.snapship/home-20260101-000000")),
            false,
        );
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "btrfs",
                "send",
                "-p",
                "/mnt/.snapship/home-20260101-000000",
                "/mnt/.snapship/home-20260101-010000"
            ]
        );
    }

    #[test]
    fn send_args_no_data_estimate() {
        let args = send_args(Path::new("/mnt/.snapship/home-20260101-010000"), None, true);
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["btrfs", "send", "--no-data", "/mnt/.snapship/home-20260101-010000"]
        );
    }
}
