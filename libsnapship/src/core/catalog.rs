//! The snapshot catalog: enumerate, name, create and destroy snapshots at
//! one endpoint.

use super::endpoint::Endpoint;
use super::{lock, Snapshot};
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use slog_scope::debug;
use std::path::Path;

/// Snapshot naming rules for one volume: `{prefix}{timestamp}` with a
/// configurable strftime format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNaming {
    pub prefix: String,
    pub timestamp_format: String,
}

impl SnapshotNaming {
    pub fn new(prefix: &str, timestamp_format: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            timestamp_format: timestamp_format.to_string(),
        }
    }

    pub fn compose(&self, at: NaiveDateTime) -> String {
        format!("{}{}", self.prefix, at.format(&self.timestamp_format))
    }

    /// Parse a snapshot name back to its timestamp. Accepts the monotonic
    /// `-N` suffix appended on same-second collisions. Names that do not
    /// match prefix and format are not ours: excluded from planning and
    /// retention, never deleted.
    pub fn parse(&self, name: &str) -> Option<NaiveDateTime> {
        if !name.starts_with(&self.prefix) {
            return None;
        }
        let stamp = &name[self.prefix.len()..];
        if let Ok(parsed) = NaiveDateTime::parse_from_str(stamp, &self.timestamp_format) {
            return Some(parsed);
        }
        // collision-suffixed form
        if let Some(dash) = stamp.rfind('-') {
            let (head, tail) = stamp.split_at(dash);
            if tail.len() > 1 && tail[1..].chars().all(|c| c.is_ascii_digit()) {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(head, &self.timestamp_format) {
                    return Some(parsed);
                }
            }
        }
        None
    }
}

/// Catalog over one endpoint.
pub struct SnapshotCatalog {
    endpoint: Endpoint,
    naming: SnapshotNaming,
    /// Convert read-only snapshots to writable before deletion.
    convert_rw: bool,
}

impl SnapshotCatalog {
    pub fn new(endpoint: Endpoint, naming: SnapshotNaming) -> Self {
        Self {
            endpoint,
            naming,
            convert_rw: false,
        }
    }

    pub fn with_convert_rw(mut self, convert_rw: bool) -> Self {
        self.convert_rw = convert_rw;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn naming(&self) -> &SnapshotNaming {
        &self.naming
    }

    /// All snapshots at the endpoint matching prefix and timestamp format,
    /// ascending by (timestamp, name).
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = if self.endpoint.is_raw() {
            self.endpoint
                .list_raw_metas()?
                .into_iter()
                .filter_map(|meta| match self.naming.parse(&meta.name) {
                    Some(timestamp) => Some(Snapshot {
                        path: self.endpoint.directory().join(meta.stream_file_name()),
                        name: meta.name,
                        timestamp,
                        uuid: meta.uuid,
                        parent_uuid: meta.parent_uuid,
                        received_uuid: meta.received_uuid,
                    }),
                    None => {
                        debug!("ignoring foreign raw file"; "name" => &meta.name);
                        None
                    }
                })
                .collect::<Vec<_>>()
        } else {
            self.endpoint
                .list_subvolumes()?
                .into_iter()
                .filter_map(|subvolume| {
                    let name = subvolume.path.file_name()?.to_string_lossy().into_owned();
                    match self.naming.parse(&name) {
                        Some(timestamp) => Some(Snapshot {
                            path: self.endpoint.directory().join(&name),
                            name,
                            timestamp,
                            uuid: subvolume.uuid,
                            parent_uuid: subvolume.parent_uuid,
                            received_uuid: subvolume.received_uuid,
                        }),
                        None => {
                            debug!("ignoring unrecognized snapshot name"; "name" => &name);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        };
        snapshots.sort_unstable_by_key(|s| s.sort_key());
        Ok(snapshots)
    }

    /// Snapshots of a foreign snapshot manager under the endpoint
    /// directory. Names carry no parseable timestamp; the subvolume
    /// creation time stands in. The catalog never creates or prunes these.
    pub fn list_foreign(&self) -> Result<Vec<Snapshot>> {
        if self.endpoint.is_raw() {
            bail!("foreign snapshot managers only apply to native endpoints");
        }
        let mut snapshots = Vec::new();
        for subvolume in self.endpoint.list_subvolumes()? {
            let name = match subvolume.path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let path = self.endpoint.directory().join(&name);
            let info = self
                .endpoint
                .subvolume_show(&path)
                .with_context(|| format!("cannot inspect foreign snapshot {:?}", path))?;
            let timestamp = match info.created_at {
                Some(created) => created,
                None => {
                    debug!("foreign snapshot without creation time skipped"; "name" => &name);
                    continue;
                }
            };
            snapshots.push(Snapshot {
                name,
                path,
                timestamp,
                uuid: info.uuid,
                parent_uuid: info.parent_uuid,
                received_uuid: info.received_uuid,
            });
        }
        snapshots.sort_unstable_by_key(|s| s.sort_key());
        Ok(snapshots)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.list()?.pop())
    }

    /// Pick the name for a snapshot taken at `now`, appending a monotonic
    /// `-N` suffix when the same-second name is already taken.
    pub fn next_name(&self, now: NaiveDateTime, existing: &[Snapshot]) -> String {
        let base = self.naming.compose(now);
        if !existing.iter().any(|s| s.name == base) {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !existing.iter().any(|s| s.name == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Take a read-only snapshot of the volume at `now`. Always read-only:
    /// the replication protocol requires it for send.
    pub fn create(&self, volume_path: &Path, now: NaiveDateTime) -> Result<Snapshot> {
        if self.endpoint.is_raw() {
            bail!("snapshots are created on native endpoints only");
        }
        let existing = self.list()?;
        let name = self.next_name(now, &existing);
        let timestamp = self
            .naming
            .parse(&name)
            .expect("a name this catalog composed always parses back");
        let dest_path = self.endpoint.directory().join(&name);
        let info = self.endpoint.create_snapshot(volume_path, &dest_path)?;
        Ok(Snapshot {
            name,
            path: dest_path,
            timestamp,
            uuid: info.uuid,
            parent_uuid: info.parent_uuid,
            received_uuid: info.received_uuid,
        })
    }

    /// Destroy a snapshot this catalog owns. Locked snapshots are left
    /// alone; deleting one mid-transfer would corrupt the stream.
    pub fn destroy(&self, snapshot: &Snapshot) -> Result<()> {
        if !self.endpoint.transport().is_remote() && lock::snapshot_locked(self.endpoint.directory(), &snapshot.name) {
            bail!("snapshot {} is locked by an in-flight session", snapshot.name);
        }
        if self.endpoint.is_raw() {
            let metas = self.endpoint.list_raw_metas()?;
            match metas.into_iter().find(|m| m.name == snapshot.name) {
                Some(meta) => self.endpoint.destroy_raw(&meta),
                None => Ok(()),
            }
        } else {
            self.endpoint.destroy_subvolume(&snapshot.path, self.convert_rw)
        }
    }
}

#[cfg(test)]
mod naming_tests {
    use super::*;
    use crate::core::testutil::parse_ts;

    fn naming() -> SnapshotNaming {
        SnapshotNaming::new("home-", "%Y%m%d-%H%M%S")
    }

    #[test]
    fn compose_and_parse_round_trip() {
        let at = parse_ts("2026-01-01T01:02:03");
        let name = naming().compose(at);
        assert_eq!(name, "home-20260101-010203");
        assert_eq!(naming().parse(&name), Some(at));
    }

    #[test]
    fn parse_accepts_collision_suffix() {
        let at = parse_ts("2026-01-01T01:02:03");
        assert_eq!(naming().parse("home-20260101-010203-1"), Some(at));
        assert_eq!(naming().parse("home-20260101-010203-17"), Some(at));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(naming().parse("root-20260101-010203"), None);
        assert_eq!(naming().parse("home-not-a-timestamp"), None);
        assert_eq!(naming().parse("home-20260101"), None);
        assert_eq!(naming().parse("manual-backup"), None);
    }

    #[test]
    fn custom_format_parses() {
        let naming = SnapshotNaming::new("data-", "%Y-%m-%dT%H-%M-%S");
        let at = parse_ts("2026-03-05T10:20:30");
        let name = naming.compose(at);
        assert_eq!(name, "data-2026-03-05T10-20-30");
        assert_eq!(naming.parse(&name), Some(at));
    }
}
