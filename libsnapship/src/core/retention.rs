//! The retention evaluator: map time buckets to kept and pruned sets.
//!
//! Buckets are calendar intervals (hour, day, ISO week, month, year) in
//! the caller's timezone. Within each of the most recent `k` non-empty
//! intervals of a bucket class the earliest snapshot is the keeper;
//! earliest preserves parent chains, which grow forward in time. A
//! minimum-age floor protects young snapshots outright, and chain
//! protection extends keep to every ancestor a keeper depends on.

use super::{find_parent, Snapshot};
use crate::model::RetentionPolicy;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug)]
pub struct RetentionEvaluation {
    pub keep: Vec<Snapshot>,
    pub prune: Vec<Snapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Bucket {
    fn count(self, policy: &RetentionPolicy) -> u32 {
        match self {
            Bucket::Hourly => policy.hourly,
            Bucket::Daily => policy.daily,
            Bucket::Weekly => policy.weekly,
            Bucket::Monthly => policy.monthly,
            Bucket::Yearly => policy.yearly,
        }
    }

    /// The interval start containing a timestamp; identifies the interval
    /// and orders intervals chronologically.
    fn interval_start(self, at: NaiveDateTime) -> NaiveDateTime {
        match self {
            Bucket::Hourly => at.date().and_hms(at.hour(), 0, 0),
            Bucket::Daily => at.date().and_hms(0, 0, 0),
            Bucket::Weekly => {
                let days_into_week = at.weekday().num_days_from_monday() as i64;
                (at.date() - chrono::Duration::days(days_into_week)).and_hms(0, 0, 0)
            }
            Bucket::Monthly => NaiveDate::from_ymd(at.year(), at.month(), 1).and_hms(0, 0, 0),
            Bucket::Yearly => NaiveDate::from_ymd(at.year(), 1, 1).and_hms(0, 0, 0),
        }
    }

    const ALL: [Bucket; 5] = [
        Bucket::Hourly,
        Bucket::Daily,
        Bucket::Weekly,
        Bucket::Monthly,
        Bucket::Yearly,
    ];
}

/// Evaluate retention over one endpoint's snapshots. Bucket boundaries
/// follow `now`'s timezone (system-local in production). Destinations run
/// with `chain_protection` forced on: evicting a keeper's ancestor would
/// break future incremental transfers.
pub fn evaluate_retention<Tz: TimeZone>(
    now: DateTime<Tz>,
    mut snapshots: Vec<Snapshot>,
    policy: &RetentionPolicy,
    chain_protection: bool,
) -> RetentionEvaluation {
    snapshots.sort_unstable_by_key(|s| s.sort_key());
    let tz = now.timezone();
    let min_age = chrono::Duration::from_std(policy.min).unwrap_or_else(|_| chrono::Duration::max_value());

    let mut kept: HashSet<Uuid> = HashSet::new();

    for snapshot in &snapshots {
        let age = now.clone() - localize(&tz, snapshot.timestamp);
        if age < min_age {
            kept.insert(snapshot.uuid);
        }
    }

    for bucket in Bucket::ALL.iter() {
        let count = bucket.count(policy) as usize;
        if count == 0 {
            continue;
        }
        // Group eligible snapshots by interval; BTreeMap orders intervals
        // so the most recent `count` are the last entries.
        let mut intervals: BTreeMap<NaiveDateTime, &Snapshot> = BTreeMap::new();
        for snapshot in &snapshots {
            let age = now.clone() - localize(&tz, snapshot.timestamp);
            if age < min_age {
                continue;
            }
            let start = bucket.interval_start(snapshot.timestamp);
            // Ascending iteration: the first snapshot seen per interval is
            // the earliest; keep it.
            intervals.entry(start).or_insert(snapshot);
        }
        for (_, keeper) in intervals.iter().rev().take(count) {
            kept.insert(keeper.uuid);
        }
    }

    if chain_protection {
        let mut frontier: Vec<Uuid> = kept.iter().copied().collect();
        while let Some(uuid) = frontier.pop() {
            let snapshot = match snapshots.iter().find(|s| s.uuid == uuid) {
                Some(s) => s,
                None => continue,
            };
            if let Some(parent) = find_parent(snapshot, &snapshots) {
                if kept.insert(parent.uuid) {
                    frontier.push(parent.uuid);
                }
            }
        }
    }

    let (keep, prune): (Vec<Snapshot>, Vec<Snapshot>) =
        snapshots.into_iter().partition(|s| kept.contains(&s.uuid));
    RetentionEvaluation { keep, prune }
}

fn localize<Tz: TimeZone>(tz: &Tz, at: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&at)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&at))
}
