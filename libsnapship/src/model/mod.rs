//! The typed configuration tree the core consumes.
//!
//! Loading, schema validation and the interactive wizard live outside the
//! core; by the time a `Config` exists here it is structurally valid. The
//! types keep serde defaults so externally-produced documents can stay
//! minimal.

pub mod storage;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{Display as StrumDisplay, EnumString};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    #[serde(default = "default_true")]
    pub incremental: bool,
    /// Convert read-only snapshots to writable before deletion.
    #[serde(default)]
    pub convert_rw: bool,
    #[serde(default = "default_parallelism")]
    pub parallel_volumes: NonZeroUsize,
    #[serde(default = "default_parallelism")]
    pub parallel_targets: NonZeroUsize,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_transaction_log")]
    pub transaction_log: PathBuf,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    /// Consumed by the external notification dispatcher; carried opaquely.
    #[serde(default)]
    pub notifications: Option<serde_json::Value>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

impl Config {
    pub fn enabled_volumes(&self) -> impl Iterator<Item = &VolumeConfig> {
        self.volumes.iter().filter(|v| v.enabled)
    }

    /// The retention policy in force for a volume: its own override or the
    /// global policy.
    pub fn retention_for<'a>(&'a self, volume: &'a VolumeConfig) -> Option<&'a RetentionPolicy> {
        volume.retention.as_ref().or(self.retention.as_ref())
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".snapship")
}

fn default_timestamp_format() -> String {
    String::from("%Y%m%d-%H%M%S")
}

fn default_transaction_log() -> PathBuf {
    PathBuf::from("/var/log/snapship/transactions.log")
}

fn default_true() -> bool {
    true
}

fn default_parallelism() -> NonZeroUsize {
    NonZeroUsize::new(1).expect("one is nonzero")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub snapshot_prefix: Option<String>,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub source: VolumeSource,
}

impl VolumeConfig {
    /// The snapshot name prefix: configured, or derived from the last
    /// component of the volume path (`/home` → `home-`).
    pub fn prefix(&self) -> String {
        match &self.snapshot_prefix {
            Some(prefix) => prefix.clone(),
            None => {
                let stem = self
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| String::from("root"));
                format!("{}-", stem)
            }
        }
    }

    /// Where this volume's snapshots live: the per-volume override or the
    /// global directory, resolved against the volume path when relative.
    pub fn snapshot_dir(&self, global: &Config) -> PathBuf {
        let dir = self.snapshot_dir.as_ref().unwrap_or(&global.snapshot_dir);
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.path.join(dir)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VolumeSource {
    Native,
    /// Snapshots are created and pruned by a foreign snapshot manager;
    /// snapship only replicates the newest one and never mutates the set.
    ForeignSnapshotManager,
}

impl Default for VolumeSource {
    fn default() -> Self {
        VolumeSource::Native
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetConfig {
    /// Endpoint URL: a bare absolute path, `file:///path`,
    /// `ssh://[user@]host[:port]/path`, `raw:///path` or `raw+ssh://…`.
    pub path: String,
    #[serde(default)]
    pub ssh_sudo: bool,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub ssh_password_auth: bool,
    #[serde(default = "default_persist_secs")]
    pub ssh_persist_secs: u64,
    #[serde(default)]
    pub compress: CompressKind,
    #[serde(default)]
    pub rate_limit: Option<ByteRate>,
    #[serde(default)]
    pub require_mount: bool,
    #[serde(default)]
    pub encrypt: EncryptKind,
    #[serde(default)]
    pub gpg_recipient: Option<String>,
}

fn default_persist_secs() -> u64 {
    60
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompressKind {
    None,
    Gzip,
    Zstd,
    Lz4,
    Pigz,
    Lzop,
    Bzip2,
    Xz,
}

impl Default for CompressKind {
    fn default() -> Self {
        CompressKind::None
    }
}

impl CompressKind {
    pub fn tool(self) -> Option<&'static str> {
        match self {
            CompressKind::None => None,
            CompressKind::Gzip => Some("gzip"),
            CompressKind::Zstd => Some("zstd"),
            CompressKind::Lz4 => Some("lz4"),
            CompressKind::Pigz => Some("pigz"),
            CompressKind::Lzop => Some("lzop"),
            CompressKind::Bzip2 => Some("bzip2"),
            CompressKind::Xz => Some("xz"),
        }
    }

    pub fn compress_argv(self) -> Option<Vec<String>> {
        self.tool().map(|tool| vec![tool.to_string(), String::from("-c")])
    }

    pub fn decompress_argv(self) -> Option<Vec<String>> {
        self.tool()
            .map(|tool| vec![tool.to_string(), String::from("-d"), String::from("-c")])
    }

    /// File name extension raw-mode streams carry for this compression.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressKind::None => None,
            CompressKind::Gzip => Some("gz"),
            CompressKind::Zstd => Some("zst"),
            CompressKind::Lz4 => Some("lz4"),
            CompressKind::Pigz => Some("gz"),
            CompressKind::Lzop => Some("lzo"),
            CompressKind::Bzip2 => Some("bz2"),
            CompressKind::Xz => Some("xz"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EncryptKind {
    None,
    Gpg,
    Openssl,
}

impl Default for EncryptKind {
    fn default() -> Self {
        EncryptKind::None
    }
}

impl EncryptKind {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            EncryptKind::None => None,
            EncryptKind::Gpg => Some("gpg"),
            EncryptKind::Openssl => Some("enc"),
        }
    }

    /// The filter that encrypts a stream on its way to a raw file. Gpg
    /// needs a recipient; openssl reads its passphrase from the
    /// environment so no secret lands on a command line.
    pub fn encrypt_argv(self, gpg_recipient: Option<&str>) -> anyhow::Result<Option<Vec<String>>> {
        Ok(match self {
            EncryptKind::None => None,
            EncryptKind::Gpg => {
                let recipient = gpg_recipient
                    .ok_or_else(|| anyhow::anyhow!("gpg encryption requires a gpg_recipient"))?;
                Some(
                    ["gpg", "--batch", "--yes", "-e", "-r", recipient, "-o", "-"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                )
            }
            EncryptKind::Openssl => Some(
                [
                    "openssl",
                    "enc",
                    "-aes-256-cbc",
                    "-pbkdf2",
                    "-salt",
                    "-pass",
                    "env:SNAPSHIP_OPENSSL_PASSWORD",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
        })
    }

    pub fn decrypt_argv(self) -> Option<Vec<String>> {
        match self {
            EncryptKind::None => None,
            EncryptKind::Gpg => Some(
                ["gpg", "--batch", "--quiet", "-d"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            EncryptKind::Openssl => Some(
                [
                    "openssl",
                    "enc",
                    "-aes-256-cbc",
                    "-pbkdf2",
                    "-d",
                    "-pass",
                    "env:SNAPSHIP_OPENSSL_PASSWORD",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
        }
    }
}

/// A byte-per-second rate parsed from the `K/M/G` suffix form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRate(pub u64);

impl ByteRate {
    pub fn bytes_per_second(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteRate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, scale) = match s.chars().last() {
            None => return Err(anyhow::anyhow!("empty rate value")),
            Some('k') | Some('K') => (&s[..s.len() - 1], 1u64 << 10),
            Some('m') | Some('M') => (&s[..s.len() - 1], 1 << 20),
            Some('g') | Some('G') => (&s[..s.len() - 1], 1 << 30),
            Some(_) => (s, 1),
        };
        let count = digits
            .trim()
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("'{}' is not a rate like 500K, 2M or a plain integer", s))?;
        count
            .checked_mul(scale)
            .map(ByteRate)
            .ok_or_else(|| anyhow::anyhow!("'{}' overflows a 64bit byte rate", s))
    }
}

impl Display for ByteRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SCALES: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
        for (scale, suffix) in SCALES.iter() {
            if self.0 >= *scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RateVisitor;

        impl<'de> serde::de::Visitor<'de> for RateVisitor {
            type Value = ByteRate;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte rate like 500K, 2M or a plain integer")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ByteRate, E> {
                v.parse().map_err(serde::de::Error::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ByteRate, E> {
                Ok(ByteRate(v))
            }
        }

        deserializer.deserialize_any(RateVisitor)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Snapshots younger than this are always kept.
    #[serde(default, with = "humantime_serde")]
    pub min: Duration,
    #[serde(default)]
    pub hourly: u32,
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

impl RetentionPolicy {
    pub fn keeps_nothing(&self) -> bool {
        self.hourly == 0 && self.daily == 0 && self.weekly == 0 && self.monthly == 0 && self.yearly == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::prelude::*;

    #[test]
    fn config_minimal_document() {
        let config: Config = serde_json::from_str(indoc!(
            r#"
            {
                "volumes": [
                    { "path": "/home", "targets": [ { "path": "/mnt/backup" } ] }
                ]
            }"#
        ))
        .unwrap();

        assert_eq!(config.timestamp_format, "%Y%m%d-%H%M%S");
        assert!(config.incremental);
        assert_eq!(config.parallel_volumes.get(), 1);
        let volume = &config.volumes[0];
        assert!(volume.enabled);
        assert_eq!(volume.prefix(), "home-");
        assert_eq!(volume.snapshot_dir(&config), PathBuf::from("/home/.snapship"));
        assert_eq!(volume.source, VolumeSource::Native);
        assert_eq!(volume.targets[0].compress, CompressKind::None);
    }

    #[test]
    fn config_full_target_options() {
        let config: Config = serde_json::from_str(indoc!(
            r#"
            {
                "snapshot_dir": "/snapshots",
                "retention": { "min": "1d", "hourly": 24, "daily": 7 },
                "volumes": [
                    {
                        "path": "/srv/data",
                        "snapshot_prefix": "data-",
                        "targets": [
                            {
                                "path": "ssh://backup@nas:2222/pool/backups",
                                "ssh_sudo": true,
                                "compress": "zstd",
                                "rate_limit": "10M",
                                "require_mount": true
                            }
                        ]
                    }
                ]
            }"#
        ))
        .unwrap();

        let volume = &config.volumes[0];
        assert_eq!(volume.snapshot_dir(&config), PathBuf::from("/snapshots"));
        let target = &volume.targets[0];
        assert!(target.ssh_sudo);
        assert_eq!(target.compress, CompressKind::Zstd);
        assert_eq!(target.rate_limit, Some(ByteRate(10 * 1024 * 1024)));
        let retention = config.retention_for(volume).unwrap();
        assert_eq!(retention.min, Duration::from_secs(24 * 3600));
        assert_eq!(retention.hourly, 24);
        assert_eq!(retention.yearly, 0);
    }

    #[test]
    fn volume_retention_overrides_global() {
        let config: Config = serde_json::from_str(indoc!(
            r#"
            {
                "retention": { "hourly": 24 },
                "volumes": [
                    { "path": "/a" },
                    { "path": "/b", "retention": { "daily": 3 } }
                ]
            }"#
        ))
        .unwrap();

        assert_eq!(config.retention_for(&config.volumes[0]).unwrap().hourly, 24);
        assert_eq!(config.retention_for(&config.volumes[1]).unwrap().daily, 3);
        assert_eq!(config.retention_for(&config.volumes[1]).unwrap().hourly, 0);
    }

    #[test]
    fn byte_rate_display_round_trips() {
        for input in &["500K", "10M", "1G", "1536"] {
            let rate: ByteRate = input.parse().unwrap();
            assert_eq!(&rate.to_string(), input);
        }
    }

    #[test]
    fn byte_rate_scales_are_binary() {
        assert_eq!("8K".parse::<ByteRate>().unwrap(), ByteRate(8192));
        assert_eq!("2m".parse::<ByteRate>().unwrap(), ByteRate(2 * 1024 * 1024));
        assert_eq!("512".parse::<ByteRate>().unwrap(), ByteRate(512));
    }

    #[test]
    fn byte_rate_rejects_garbage() {
        assert!("".parse::<ByteRate>().is_err());
        assert!("fast".parse::<ByteRate>().is_err());
        assert!("12T".parse::<ByteRate>().is_err());
        assert!("99999999999G".parse::<ByteRate>().is_err());
    }

    #[test]
    fn compression_argv_forms() {
        assert_eq!(CompressKind::None.compress_argv(), None);
        assert_eq!(
            CompressKind::Zstd.compress_argv().unwrap(),
            vec!["zstd".to_string(), "-c".to_string()]
        );
        assert_eq!(
            CompressKind::Gzip.decompress_argv().unwrap(),
            vec!["gzip".to_string(), "-d".to_string(), "-c".to_string()]
        );
        assert_eq!(CompressKind::Pigz.extension(), Some("gz"));
    }
}
