pub mod catalog;
pub mod endpoint;
pub mod journal;
pub mod lock;
pub mod pipeline;
pub mod planner;
pub mod restore;
pub mod retention;

use chrono::NaiveDateTime;
use std::fmt::{self, Display};
use std::path::PathBuf;
use uuid::Uuid;

/// A read-only point-in-time image of a subvolume as the catalog sees it
/// at one endpoint. Immutable after creation; destruction is the only
/// mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `{prefix}{timestamp}` within its endpoint.
    pub name: String,
    /// Absolute path at the endpoint.
    pub path: PathBuf,
    /// Parsed from the name with the configured timestamp format.
    pub timestamp: NaiveDateTime,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    /// Preserved through any number of re-transmissions, so two endpoints
    /// can agree "this is the same snapshot".
    pub received_uuid: Option<Uuid>,
}

impl Snapshot {
    /// The identity that survives send/receive. A snapshot that was itself
    /// received keeps its original identity; an original snapshot is
    /// identified by its own uuid.
    pub fn identity(&self) -> Uuid {
        self.received_uuid.unwrap_or(self.uuid)
    }

    /// Ordering key: timestamp, then full name. Stable across hosts so
    /// independent planners on the same inputs agree.
    pub fn sort_key(&self) -> (NaiveDateTime, String) {
        (self.timestamp, self.name.clone())
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolve a snapshot's parent within one endpoint's snapshot set. The
/// parent link may point at the parent's local uuid (source side) or at
/// the identity it carried over the wire (received side).
pub fn find_parent<'a>(snapshot: &Snapshot, all: &'a [Snapshot]) -> Option<&'a Snapshot> {
    let parent = snapshot.parent_uuid?;
    all.iter()
        .find(|s| s.uuid == parent || s.received_uuid == Some(parent))
}

/// Walk parent links from a snapshot toward its full-stream root,
/// returning ancestors nearest-first. Stops on a missing link (broken
/// chain) or after visiting every snapshot (cycle guard; the filesystem
/// does not produce cycles, corrupted metadata might).
pub fn ancestor_chain<'a>(snapshot: &'a Snapshot, all: &'a [Snapshot]) -> Vec<&'a Snapshot> {
    let mut chain = Vec::new();
    let mut current = snapshot;
    while let Some(parent) = find_parent(current, all) {
        if chain.iter().any(|c: &&Snapshot| c.uuid == parent.uuid) || chain.len() >= all.len() {
            break;
        }
        chain.push(parent);
        current = parent;
    }
    chain
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use chrono::NaiveDate;

    pub fn snapshot(name: &str, timestamp: &str) -> Snapshot {
        Snapshot {
            name: name.to_string(),
            path: PathBuf::from("/mnt/snaps").join(name),
            timestamp: parse_ts(timestamp),
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            received_uuid: None,
        }
    }

    pub fn parse_ts(timestamp: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    pub fn date(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd(y, m, d).and_hms(h, 0, 0)
    }
}
