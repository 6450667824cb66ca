//! The restore engine: the planner run in reverse. Given a destination-held
//! chain, reconstruct the ordered parent lineage and replay it into a local
//! endpoint.

use super::endpoint::Endpoint;
use super::lock::{self, LockError, LockKind};
use super::pipeline::{self, StreamShaping, TransferError, TransferRequest};
use super::{ancestor_chain, find_parent, Snapshot};
use chrono::NaiveDateTime;
use slog_scope::{info, warn};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreTarget {
    /// A specific snapshot by name.
    Named(String),
    /// The newest snapshot strictly older than the cut-off.
    LatestBefore(NaiveDateTime),
    Latest,
    All,
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("no snapshot matches restore target {0}")]
    SnapshotNotFound(String),
    #[error("chain broken at {0}: its parent is gone from the backup endpoint")]
    BrokenChain(String),
    #[error("restoring into the live volume path requires explicit confirmation")]
    InPlaceNotConfirmed,
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("replay of {name} failed")]
    Transfer {
        name: String,
        #[source]
        source: TransferError,
    },
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Destroy a colliding local snapshot and replay over it.
    pub overwrite: bool,
    /// The local endpoint is the volume's live path.
    pub in_place: bool,
    pub in_place_confirmed: bool,
    pub space_margin_percent: u64,
    pub force: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            in_place: false,
            in_place_confirmed: false,
            space_margin_percent: 10,
            force: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
}

/// Resolve the target spec against the backup listing.
pub fn resolve_targets<'a>(
    backup: &'a [Snapshot],
    target: &RestoreTarget,
) -> Result<Vec<&'a Snapshot>, RestoreError> {
    match target {
        RestoreTarget::Named(name) => backup
            .iter()
            .find(|s| &s.name == name)
            .map(|s| vec![s])
            .ok_or_else(|| RestoreError::SnapshotNotFound(name.clone())),
        RestoreTarget::Latest => backup
            .iter()
            .max_by_key(|s| s.sort_key())
            .map(|s| vec![s])
            .ok_or_else(|| RestoreError::SnapshotNotFound(String::from("latest"))),
        RestoreTarget::LatestBefore(cutoff) => backup
            .iter()
            .filter(|s| s.timestamp < *cutoff)
            .max_by_key(|s| s.sort_key())
            .map(|s| vec![s])
            .ok_or_else(|| RestoreError::SnapshotNotFound(format!("latest before {}", cutoff))),
        RestoreTarget::All => {
            if backup.is_empty() {
                Err(RestoreError::SnapshotNotFound(String::from("all")))
            } else {
                Ok(backup.iter().collect())
            }
        }
    }
}

/// Compute the dependency-ordered replay list: the union of every target's
/// parent chain, with prefixes already present locally dropped. The result
/// is ordered parents-first (parents are strictly older, so catalog order
/// is a topological order).
pub fn plan_restore(
    backup: &[Snapshot],
    local: &[Snapshot],
    target: &RestoreTarget,
) -> Result<Vec<Snapshot>, RestoreError> {
    let targets = resolve_targets(backup, target)?;
    let local_identities: HashSet<Uuid> = local.iter().map(|s| s.identity()).collect();

    let mut replay: Vec<Snapshot> = Vec::new();
    let mut planned: HashSet<Uuid> = HashSet::new();

    for t in targets {
        // ancestor_chain returns nearest-first; the full chain is root..t.
        let ancestors = ancestor_chain(t, backup);
        if let Some(root) = ancestors.last().copied().or(Some(t)) {
            if root.parent_uuid.is_some() && find_parent(root, backup).is_none() {
                // The walk stopped short of a full snapshot: a link is
                // gone from the backup endpoint.
                return Err(RestoreError::BrokenChain(root.name.clone()));
            }
        }
        let mut chain: Vec<&Snapshot> = ancestors.into_iter().rev().collect();
        chain.push(t);

        // Drop the prefix the local endpoint already holds.
        let present_prefix = chain
            .iter()
            .take_while(|s| local_identities.contains(&s.identity()))
            .count();
        for element in chain.into_iter().skip(present_prefix) {
            if planned.insert(element.uuid) {
                replay.push(element.clone());
            }
        }
    }

    replay.sort_by_key(|s| s.sort_key());
    Ok(replay)
}

/// Replay a restore plan into the local endpoint. Each step runs a
/// transfer pipeline in the reverse direction with the backup as source.
pub async fn execute_restore(
    backup: &Endpoint,
    local: &Endpoint,
    backup_snapshots: &[Snapshot],
    local_snapshots: &[Snapshot],
    target: &RestoreTarget,
    options: &RestoreOptions,
    session_id: Uuid,
    cancel: watch::Receiver<bool>,
) -> Result<RestoreSummary, RestoreError> {
    if options.in_place && !options.in_place_confirmed {
        return Err(RestoreError::InPlaceNotConfirmed);
    }

    // Restores take their own lock class so in-flight transfers cannot
    // starve them out of the per-snapshot transfer locks.
    let lock_key = format!("{}:{}", backup.describe(), local.describe());
    let _lock = lock::acquire(local.directory(), LockKind::Restore, &lock_key, session_id)?;

    let replay = plan_restore(backup_snapshots, local_snapshots, target)?;
    info!(
        "restore planned";
        "backup" => backup.describe(), "local" => local.describe(), "steps" => replay.len()
    );

    let mut local_identities: HashSet<Uuid> = local_snapshots.iter().map(|s| s.identity()).collect();
    let mut summary = RestoreSummary::default();

    for element in replay {
        if local_identities.contains(&element.identity()) {
            if !options.overwrite {
                info!("skipping restore step, already present"; "snapshot" => %element);
                summary.skipped.push(element.name.clone());
                continue;
            }
            // Overwrite: the colliding snapshot dies first, never
            // implicitly.
            let colliding = local.directory().join(&element.name);
            warn!("overwriting local snapshot"; "path" => ?colliding);
            if let Err(e) = local.destroy_subvolume(&colliding, false) {
                return Err(RestoreError::Transfer {
                    name: element.name.clone(),
                    source: TransferError::Precondition(format!("cannot clear collision: {:#}", e)),
                });
            }
            local_identities.remove(&element.identity());
        }

        let parent = find_parent(&element, backup_snapshots).cloned();
        let request = TransferRequest {
            source: backup.clone(),
            snapshot: element.clone(),
            parent,
            dest: local.clone(),
            shaping: StreamShaping::default(),
            require_mount: false,
            force: options.force,
            space_margin_percent: options.space_margin_percent,
            lock_dir: local.directory().to_path_buf(),
            session_id,
        };
        pipeline::run(request, cancel.clone())
            .await
            .map_err(|e| RestoreError::Transfer {
                name: element.name.clone(),
                source: e,
            })?;

        local_identities.insert(element.identity());
        summary.restored.push(element.name.clone());
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::snapshot;

    /// Backup chain A → B → C → D, linked by received identity the way a
    /// destination records it.
    fn backup_chain() -> Vec<Snapshot> {
        let names = [
            ("home-20260101-000000", "2026-01-01T00:00:00"),
            ("home-20260101-010000", "2026-01-01T01:00:00"),
            ("home-20260101-020000", "2026-01-01T02:00:00"),
            ("home-20260101-030000", "2026-01-01T03:00:00"),
        ];
        let mut chain: Vec<Snapshot> = Vec::new();
        for (name, ts) in names.iter() {
            let mut s = snapshot(name, ts);
            s.received_uuid = Some(Uuid::new_v4());
            if let Some(prev) = chain.last() {
                s.parent_uuid = prev.received_uuid;
            }
            chain.push(s);
        }
        chain
    }

    fn local_copy(of: &Snapshot) -> Snapshot {
        let mut copy = of.clone();
        copy.uuid = Uuid::new_v4();
        copy.received_uuid = Some(of.identity());
        copy.parent_uuid = None;
        copy
    }

    #[test]
    fn latest_restores_chain_minus_present_prefix() {
        let backup = backup_chain();
        let local = vec![local_copy(&backup[0])];

        let replay = plan_restore(&backup, &local, &RestoreTarget::Latest).unwrap();
        assert_eq!(
            replay.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["home-20260101-010000", "home-20260101-020000", "home-20260101-030000"]
        );
    }

    #[test]
    fn empty_local_replays_full_chain() {
        let backup = backup_chain();
        let replay = plan_restore(&backup, &[], &RestoreTarget::Latest).unwrap();
        assert_eq!(replay.len(), 4);
        assert_eq!(replay[0].name, "home-20260101-000000");
        assert_eq!(replay[3].name, "home-20260101-030000");
    }

    #[test]
    fn named_target_restores_its_chain_only() {
        let backup = backup_chain();
        let replay = plan_restore(
            &backup,
            &[],
            &RestoreTarget::Named(String::from("home-20260101-010000")),
        )
        .unwrap();
        assert_eq!(
            replay.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["home-20260101-000000", "home-20260101-010000"]
        );
    }

    #[test]
    fn latest_before_cutoff_excludes_the_boundary() {
        let backup = backup_chain();
        let cutoff = crate::core::testutil::parse_ts("2026-01-01T02:00:00");
        let replay = plan_restore(&backup, &[], &RestoreTarget::LatestBefore(cutoff)).unwrap();
        assert_eq!(replay.last().unwrap().name, "home-20260101-010000");
    }

    #[test]
    fn all_unions_chains_without_duplicates() {
        let backup = backup_chain();
        let replay = plan_restore(&backup, &[], &RestoreTarget::All).unwrap();
        assert_eq!(replay.len(), 4);
        let mut seen = HashSet::new();
        assert!(replay.iter().all(|s| seen.insert(s.uuid)));
    }

    #[test]
    fn replay_order_is_parents_first() {
        let backup = backup_chain();
        let replay = plan_restore(&backup, &[], &RestoreTarget::All).unwrap();
        for (i, element) in replay.iter().enumerate() {
            if let Some(parent_uuid) = element.parent_uuid {
                let parent_pos = replay
                    .iter()
                    .position(|s| s.received_uuid == Some(parent_uuid))
                    .expect("parent is in the replay");
                assert!(parent_pos < i);
            }
        }
    }

    #[test]
    fn missing_target_is_an_error() {
        let backup = backup_chain();
        let err = plan_restore(&backup, &[], &RestoreTarget::Named(String::from("nope"))).unwrap_err();
        assert!(matches!(err, RestoreError::SnapshotNotFound(_)));

        let err = plan_restore(&[], &[], &RestoreTarget::Latest).unwrap_err();
        assert!(matches!(err, RestoreError::SnapshotNotFound(_)));
    }

    #[test]
    fn broken_backup_chain_is_detected() {
        let mut backup = backup_chain();
        // Lose B out-of-band; C's parent link now dangles.
        backup.remove(1);
        let err = plan_restore(&backup, &[], &RestoreTarget::Latest).unwrap_err();
        assert!(matches!(err, RestoreError::BrokenChain(name) if name == "home-20260101-020000"));
    }
}
