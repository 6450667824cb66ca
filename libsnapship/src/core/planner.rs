//! The planner: decide which snapshot to send and which parent to send it
//! against for one (volume, destination) pair.
//!
//! Pure over catalog listings, so independent planners on the same inputs
//! agree byte-for-byte. Stability matters: ties on timestamp are broken by
//! full name.

use super::Snapshot;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    /// The snapshot to send.
    pub snapshot: Snapshot,
    /// Incremental parent, when the destination should already hold it.
    /// None means a full stream.
    pub parent: Option<Snapshot>,
}

/// Compute the next transfer for a destination, or None when it is caught
/// up. `source` must already be filtered to parseable names; both listings
/// are sorted ascending by the caller (catalog order).
pub fn plan(source: &[Snapshot], dest: &[Snapshot], incremental: bool) -> Option<TransferPlan> {
    let dest_received: HashSet<Uuid> = dest.iter().filter_map(|s| s.received_uuid).collect();

    // Source snapshots the destination already holds, matched on the
    // identity that survives send/receive.
    let common: Vec<&Snapshot> = source.iter().filter(|s| dest_received.contains(&s.identity())).collect();

    let to_send = source
        .iter()
        .filter(|s| !dest_received.contains(&s.identity()))
        .max_by_key(|s| s.sort_key())?
        .clone();

    let parent = if incremental {
        common
            .iter()
            .filter(|s| s.sort_key() < to_send.sort_key())
            .max_by_key(|s| s.sort_key())
            .map(|s| (*s).clone())
    } else {
        None
    };

    Some(TransferPlan {
        snapshot: to_send,
        parent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::snapshot;

    fn received(source: &Snapshot) -> Snapshot {
        let mut copy = snapshot(&source.name, "2026-01-01T00:00:00");
        copy.timestamp = source.timestamp;
        copy.received_uuid = Some(source.uuid);
        copy
    }

    #[test]
    fn empty_destination_gets_latest_full() {
        let source = vec![
            snapshot("home-20260101-000000", "2026-01-01T00:00:00"),
            snapshot("home-20260101-010000", "2026-01-01T01:00:00"),
        ];
        let plan = plan(&source, &[], true).unwrap();
        assert_eq!(plan.snapshot.name, "home-20260101-010000");
        assert_eq!(plan.parent, None);
    }

    #[test]
    fn caught_up_destination_plans_nothing() {
        let source = vec![
            snapshot("home-20260101-000000", "2026-01-01T00:00:00"),
            snapshot("home-20260101-010000", "2026-01-01T01:00:00"),
        ];
        let dest = vec![received(&source[0]), received(&source[1])];
        assert_eq!(plan(&source, &dest, true), None);
    }

    #[test]
    fn incremental_elects_most_recent_common_ancestor() {
        let source = vec![
            snapshot("home-20260101-000000", "2026-01-01T00:00:00"),
            snapshot("home-20260101-010000", "2026-01-01T01:00:00"),
            snapshot("home-20260101-020000", "2026-01-01T02:00:00"),
        ];
        let dest = vec![received(&source[0]), received(&source[1])];
        let plan = plan(&source, &dest, true).unwrap();
        assert_eq!(plan.snapshot.name, "home-20260101-020000");
        assert_eq!(plan.parent.as_ref().unwrap().name, "home-20260101-010000");
    }

    #[test]
    fn incremental_disabled_forces_full() {
        let source = vec![
            snapshot("home-20260101-000000", "2026-01-01T00:00:00"),
            snapshot("home-20260101-010000", "2026-01-01T01:00:00"),
        ];
        let dest = vec![received(&source[0])];
        let plan = plan(&source, &dest, false).unwrap();
        assert_eq!(plan.snapshot.name, "home-20260101-010000");
        assert_eq!(plan.parent, None);
    }

    #[test]
    fn retransmitted_snapshots_match_by_carried_identity() {
        // A restored source snapshot keeps its original identity in
        // received_uuid; the destination that holds the original must be
        // seen as caught up.
        let mut original = snapshot("home-20260101-000000", "2026-01-01T00:00:00");
        let identity = uuid::Uuid::new_v4();
        original.received_uuid = Some(identity);
        let mut dest_copy = snapshot("home-20260101-000000", "2026-01-01T00:00:00");
        dest_copy.received_uuid = Some(identity);

        assert_eq!(plan(&[original], &[dest_copy], true), None);
    }

    #[test]
    fn plan_is_idempotent_over_unchanged_inputs() {
        let source = vec![
            snapshot("home-20260101-000000", "2026-01-01T00:00:00"),
            snapshot("home-20260101-010000", "2026-01-01T01:00:00"),
            snapshot("home-20260101-020000", "2026-01-01T02:00:00"),
        ];
        let dest = vec![received(&source[0])];
        let first = plan(&source, &dest, true);
        let second = plan(&source, &dest, true);
        assert_eq!(first, second);
    }

    #[test]
    fn equal_timestamps_break_ties_by_name() {
        // Same-second snapshots with collision suffixes order
        // lexicographically by full name, so the suffixed one is "latest".
        let a = snapshot("home-20260101-000000", "2026-01-01T00:00:00");
        let b = snapshot("home-20260101-000000-1", "2026-01-01T00:00:00");
        let source = vec![a.clone(), b.clone()];

        let plan_result = plan(&source, &[], true).unwrap();
        assert_eq!(plan_result.snapshot.name, "home-20260101-000000-1");

        let dest = vec![received(&a)];
        let plan_result = plan(&source, &dest, true).unwrap();
        assert_eq!(plan_result.snapshot.name, "home-20260101-000000-1");
        assert_eq!(plan_result.parent.as_ref().unwrap().name, "home-20260101-000000");
    }

    #[test]
    fn destination_holding_unrelated_snapshots_still_gets_full() {
        let source = vec![snapshot("home-20260101-010000", "2026-01-01T01:00:00")];
        // Destination has receives from some other volume.
        let unrelated = received(&snapshot("other-20251231-000000", "2025-12-31T00:00:00"));
        let plan = plan(&source, &[unrelated], true).unwrap();
        assert_eq!(plan.snapshot.name, "home-20260101-010000");
        assert_eq!(plan.parent, None);
    }
}
