//! The orchestrator: drive snapshot → transfer → prune per volume with
//! bounded parallelism, structured retry, and journaling.

use anyhow::Result;
use chrono::Local;
use libsnapship::core::catalog::{SnapshotCatalog, SnapshotNaming};
use libsnapship::core::endpoint::Endpoint;
use libsnapship::core::journal::{Journal, JournalAction, JournalEntry, JournalStatus};
use libsnapship::core::lock::{self, LockKind};
use libsnapship::core::pipeline::{self, StreamShaping, TransferError, TransferOutcome, TransferRequest};
use libsnapship::core::retention::evaluate_retention;
use libsnapship::core::{planner, Snapshot};
use libsnapship::model::{Config, TargetConfig, VolumeConfig, VolumeSource};
use slog::{debug, error, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

/// Structured retry: applied here, never buried in the transport. Only
/// transient classes (network, contended locks) are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(
            self.initial_backoff.saturating_mul(factor),
            self.max_backoff,
        )
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub volumes_processed: usize,
    pub failed_targets: usize,
    pub failed_volumes: usize,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.failed_targets > 0 || self.failed_volumes > 0 {
            1
        } else {
            0
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    journal: Arc<Journal>,
    retry: RetryPolicy,
    log: Logger,
}

impl Orchestrator {
    pub fn new(config: Config, journal: Journal, log: Logger) -> Self {
        Self {
            config: Arc::new(config),
            journal: Arc::new(journal),
            retry: RetryPolicy::default(),
            log,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One full run over every enabled volume. Volume work is gated by the
    /// configured semaphore widths; a cancel signal aborts remaining work
    /// after in-flight pipelines drain.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> Result<RunReport> {
        let volume_gate = Arc::new(Semaphore::new(self.config.parallel_volumes.get()));
        let mut workers = Vec::new();

        for volume in self.config.enabled_volumes().cloned().collect::<Vec<_>>() {
            let gate = Arc::clone(&volume_gate);
            let config = Arc::clone(&self.config);
            let journal = Arc::clone(&self.journal);
            let retry = self.retry;
            let cancel = cancel.clone();
            let log = self.log.new(o!("volume" => volume.path.display().to_string()));
            workers.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.expect("volume gate is never closed");
                if *cancel.borrow() {
                    return VolumeResult::aborted();
                }
                process_volume(&config, &journal, retry, &volume, cancel, &log).await
            }));
        }

        let mut report = RunReport::default();
        for worker in workers {
            let result = worker.await.expect("volume workers don't panic");
            report.volumes_processed += 1;
            report.failed_targets += result.failed_targets;
            if result.volume_failed {
                report.failed_volumes += 1;
            }
        }

        if *cancel.borrow() {
            warn!(self.log, "run cancelled; remaining work was abandoned");
        }
        info!(
            self.log, "run complete";
            "volumes" => report.volumes_processed,
            "failed_targets" => report.failed_targets,
            "failed_volumes" => report.failed_volumes
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct VolumeResult {
    failed_targets: usize,
    volume_failed: bool,
}

impl VolumeResult {
    fn aborted() -> Self {
        Self {
            failed_targets: 0,
            volume_failed: true,
        }
    }
}

async fn process_volume(
    config: &Config,
    journal: &Arc<Journal>,
    retry: RetryPolicy,
    volume: &VolumeConfig,
    cancel: watch::Receiver<bool>,
    log: &Logger,
) -> VolumeResult {
    let correlation_id = Uuid::new_v4();
    let volume_name = volume.path.display().to_string();
    let snapshot_dir = volume.snapshot_dir(config);
    let naming = SnapshotNaming::new(&volume.prefix(), &config.timestamp_format);
    let source_endpoint = Endpoint::local(snapshot_dir.clone());
    let catalog = SnapshotCatalog::new(source_endpoint.clone(), naming.clone()).with_convert_rw(config.convert_rw);

    if let Err(e) = source_endpoint.ensure_directory() {
        error!(log, "cannot prepare snapshot directory"; "error" => %e);
        return VolumeResult::aborted();
    }

    // Per-volume exclusion across processes; stale locks from crashed
    // runs are broken inside acquire.
    let _volume_lock = match lock::acquire(&snapshot_dir, LockKind::Volume, &volume_name, correlation_id) {
        Ok(guard) => guard,
        Err(e) => {
            error!(log, "volume is locked"; "error" => %e);
            let _ = journal.append(
                JournalEntry::new(JournalAction::Snapshot, JournalStatus::Failed, &volume_name, correlation_id)
                    .error("lock-held", &e.to_string()),
            );
            return VolumeResult::aborted();
        }
    };

    // Snapshot-before-transfer is strict within a volume.
    let source_snapshots = match take_snapshot(volume, &catalog, journal, &volume_name, correlation_id, log) {
        Ok(snapshots) => snapshots,
        Err(_) => return VolumeResult::aborted(),
    };

    // Fan out to destinations; failures stay per-target.
    let target_gate = Arc::new(Semaphore::new(config.parallel_targets.get()));
    let mut target_workers = Vec::new();
    for target in volume.targets.clone() {
        let gate = Arc::clone(&target_gate);
        let journal = Arc::clone(journal);
        let cancel = cancel.clone();
        let log = log.new(o!("target" => target.path.clone()));
        let source_snapshots = source_snapshots.clone();
        let snapshot_dir = snapshot_dir.clone();
        let naming = naming.clone();
        let volume_name = volume_name.clone();
        let incremental = config.incremental;
        target_workers.push(tokio::spawn(async move {
            let _permit = gate.acquire().await.expect("target gate is never closed");
            if *cancel.borrow() {
                return 1usize;
            }
            match process_target(
                &journal,
                retry,
                &target,
                &naming,
                &source_snapshots,
                &snapshot_dir,
                &volume_name,
                incremental,
                correlation_id,
                cancel,
                &log,
            )
            .await
            {
                Ok(()) => 0,
                Err(()) => 1,
            }
        }));
    }
    let mut failed_targets = 0;
    for worker in target_workers {
        failed_targets += worker.await.expect("target workers don't panic");
    }

    // Transfers strictly precede pruning.
    prune_volume(config, journal, volume, &catalog, &naming, &volume_name, correlation_id, log);

    VolumeResult {
        failed_targets,
        volume_failed: false,
    }
}

fn take_snapshot(
    volume: &VolumeConfig,
    catalog: &SnapshotCatalog,
    journal: &Arc<Journal>,
    volume_name: &str,
    correlation_id: Uuid,
    log: &Logger,
) -> Result<Vec<Snapshot>, ()> {
    match volume.source {
        VolumeSource::Native => match catalog.create(&volume.path, Local::now().naive_local()) {
            Ok(created) => {
                info!(log, "snapshot created"; "name" => &created.name);
                let _ = journal.append(JournalEntry::new(
                    JournalAction::Snapshot,
                    JournalStatus::Completed,
                    volume_name,
                    correlation_id,
                ));
            }
            Err(e) => {
                error!(log, "snapshot failed"; "error" => format!("{:#}", e));
                let _ = journal.append(
                    JournalEntry::new(JournalAction::Snapshot, JournalStatus::Failed, volume_name, correlation_id)
                        .error("snapshot", &format!("{:#}", e)),
                );
                return Err(());
            }
        },
        VolumeSource::ForeignSnapshotManager => {
            debug!(log, "foreign-managed volume, replicating existing snapshots only");
        }
    }

    let listed = match volume.source {
        VolumeSource::Native => catalog.list(),
        VolumeSource::ForeignSnapshotManager => catalog.list_foreign(),
    };
    listed.map_err(|e| {
        error!(log, "cannot enumerate source snapshots"; "error" => format!("{:#}", e));
        let _ = journal.append(
            JournalEntry::new(JournalAction::Snapshot, JournalStatus::Failed, volume_name, correlation_id)
                .error("enumeration", &format!("{:#}", e)),
        );
    })
}

#[allow(clippy::too_many_arguments)]
async fn process_target(
    journal: &Journal,
    retry: RetryPolicy,
    target: &TargetConfig,
    naming: &SnapshotNaming,
    source_snapshots: &[Snapshot],
    snapshot_dir: &std::path::Path,
    volume_name: &str,
    incremental: bool,
    correlation_id: Uuid,
    mut cancel: watch::Receiver<bool>,
    log: &Logger,
) -> Result<(), ()> {
    let journal_failure = |kind: &str, detail: &str| {
        let _ = journal.append(
            JournalEntry::new(JournalAction::Transfer, JournalStatus::Failed, volume_name, correlation_id)
                .destination(&target.path)
                .error(kind, detail),
        );
    };

    let dest_endpoint = match Endpoint::from_target(target) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(log, "invalid target"; "error" => format!("{:#}", e));
            journal_failure("precondition", &format!("{:#}", e));
            return Err(());
        }
    };
    let dest_catalog = SnapshotCatalog::new(dest_endpoint.clone(), naming.clone());

    let dest_snapshots = match dest_catalog.list() {
        Ok(snapshots) => snapshots,
        Err(e) => {
            error!(log, "cannot enumerate destination"; "error" => format!("{:#}", e));
            journal_failure("enumeration", &format!("{:#}", e));
            return Err(());
        }
    };

    let plan = match planner::plan(source_snapshots, &dest_snapshots, incremental) {
        Some(plan) => plan,
        None => {
            debug!(log, "destination is caught up");
            return Ok(());
        }
    };
    info!(
        log, "transfer planned";
        "snapshot" => &plan.snapshot.name,
        "parent" => plan.parent.as_ref().map(|p| p.name.clone()).unwrap_or_else(|| String::from("none"))
    );

    let mut attempt = 0u32;
    loop {
        let request = TransferRequest {
            source: Endpoint::local(snapshot_dir.to_path_buf()),
            snapshot: plan.snapshot.clone(),
            parent: plan.parent.clone(),
            dest: dest_endpoint.clone(),
            shaping: StreamShaping {
                compress: target.compress,
                rate_limit: target.rate_limit,
            },
            require_mount: target.require_mount,
            force: false,
            space_margin_percent: 10,
            lock_dir: snapshot_dir.to_path_buf(),
            session_id: correlation_id,
        };

        match pipeline::run(request, cancel.clone()).await {
            Ok(outcome) => {
                journal_transfer_outcome(journal, volume_name, &target.path, &outcome, correlation_id);
                return Ok(());
            }
            Err(e) => {
                attempt += 1;
                if e.retryable() && attempt < retry.max_attempts && !*cancel.borrow() {
                    let backoff = retry.backoff_for(attempt - 1);
                    warn!(
                        log, "transfer failed, backing off";
                        "error" => %e, "attempt" => attempt,
                        "backoff" => %humantime::format_duration(backoff)
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = cancelled(&mut cancel) => {
                            journal_failure(TransferError::Cancelled.kind(), "cancelled during backoff");
                            return Err(());
                        }
                    }
                }
                error!(log, "transfer failed"; "error" => %e, "attempts" => attempt);
                journal_failure(e.kind(), &e.to_string());
                return Err(());
            }
        }
    }
}

fn journal_transfer_outcome(
    journal: &Journal,
    volume_name: &str,
    target_path: &str,
    outcome: &TransferOutcome,
    correlation_id: Uuid,
) {
    // A parent lost at the destination downgrades to a full stream and is
    // recorded as partial with the reason attached.
    let status = if outcome.downgraded_to_full {
        JournalStatus::Partial
    } else {
        JournalStatus::Completed
    };
    let mut entry = JournalEntry::new(JournalAction::Transfer, status, volume_name, correlation_id)
        .destination(target_path)
        .bytes(outcome.bytes_transferred)
        .duration_ms(outcome.duration.as_millis() as u64);
    if outcome.downgraded_to_full {
        entry = entry.error("parent-missing", "parent absent at destination; sent full stream");
    }
    let _ = journal.append(entry);
}

#[allow(clippy::too_many_arguments)]
fn prune_volume(
    config: &Config,
    journal: &Arc<Journal>,
    volume: &VolumeConfig,
    catalog: &SnapshotCatalog,
    naming: &SnapshotNaming,
    volume_name: &str,
    correlation_id: Uuid,
    log: &Logger,
) {
    let policy = match config.retention_for(volume) {
        Some(policy) => policy.clone(),
        None => return,
    };
    if volume.source == VolumeSource::ForeignSnapshotManager {
        debug!(log, "foreign-managed volume is never pruned");
        return;
    }

    // Destinations first: their chains must stay receivable, so chain
    // protection is forced on.
    for target in &volume.targets {
        let endpoint = match Endpoint::from_target(target) {
            Ok(endpoint) => endpoint,
            Err(_) => continue,
        };
        let dest_catalog = SnapshotCatalog::new(endpoint, naming.clone());
        match dest_catalog.list() {
            Ok(snapshots) => {
                let evaluation = evaluate_retention(Local::now(), snapshots, &policy, true);
                let mut destroyed = 0usize;
                let mut failed = 0usize;
                for snapshot in &evaluation.prune {
                    match dest_catalog.destroy(snapshot) {
                        Ok(()) => destroyed += 1,
                        Err(e) => {
                            warn!(log, "prune failed"; "snapshot" => %snapshot, "error" => format!("{:#}", e));
                            failed += 1;
                        }
                    }
                }
                info!(log, "destination pruned"; "target" => &target.path, "pruned" => destroyed, "kept" => evaluation.keep.len());
                let status = if failed == 0 { JournalStatus::Completed } else { JournalStatus::Partial };
                let _ = journal.append(
                    JournalEntry::new(JournalAction::Prune, status, volume_name, correlation_id)
                        .destination(&target.path),
                );
            }
            Err(e) => {
                warn!(log, "cannot enumerate destination for prune"; "error" => format!("{:#}", e));
                let _ = journal.append(
                    JournalEntry::new(JournalAction::Prune, JournalStatus::Failed, volume_name, correlation_id)
                        .destination(&target.path)
                        .error("enumeration", &format!("{:#}", e)),
                );
            }
        }
    }

    // Source snapshots.
    match catalog.list() {
        Ok(snapshots) => {
            let evaluation = evaluate_retention(Local::now(), snapshots, &policy, true);
            let mut failed = 0usize;
            for snapshot in &evaluation.prune {
                if let Err(e) = catalog.destroy(snapshot) {
                    warn!(log, "prune failed"; "snapshot" => %snapshot, "error" => format!("{:#}", e));
                    failed += 1;
                }
            }
            info!(log, "source pruned"; "pruned" => evaluation.prune.len() - failed, "kept" => evaluation.keep.len());
            let status = if failed == 0 { JournalStatus::Completed } else { JournalStatus::Partial };
            let _ = journal.append(JournalEntry::new(JournalAction::Prune, status, volume_name, correlation_id));
        }
        Err(e) => {
            warn!(log, "cannot enumerate source for prune"; "error" => format!("{:#}", e));
            let _ = journal.append(
                JournalEntry::new(JournalAction::Prune, JournalStatus::Failed, volume_name, correlation_id)
                    .error("enumeration", &format!("{:#}", e)),
            );
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures_util::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(3));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(6));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(12));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(24));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(30));
    }

    #[test]
    fn downgraded_transfer_journals_partial_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let journal = Journal::open(&path).unwrap();

        let outcome = TransferOutcome {
            state: libsnapship::core::pipeline::TransferState::Released,
            bytes_transferred: 4096,
            duration: Duration::from_millis(1500),
            downgraded_to_full: true,
        };
        journal_transfer_outcome(&journal, "/home", "ssh://nas/pool", &outcome, Uuid::new_v4());

        let entries = libsnapship::core::journal::tail(&path, 1).unwrap();
        assert_eq!(entries[0].status, JournalStatus::Partial);
        assert_eq!(entries[0].error_kind.as_deref(), Some("parent-missing"));
        assert_eq!(entries[0].bytes_transferred, Some(4096));
        assert_eq!(entries[0].destination.as_deref(), Some("ssh://nas/pool"));
    }

    #[test]
    fn completed_transfer_journals_completed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");
        let journal = Journal::open(&path).unwrap();

        let outcome = TransferOutcome {
            state: libsnapship::core::pipeline::TransferState::Released,
            bytes_transferred: 10,
            duration: Duration::from_millis(20),
            downgraded_to_full: false,
        };
        journal_transfer_outcome(&journal, "/home", "/mnt/backup", &outcome, Uuid::new_v4());

        let entries = libsnapship::core::journal::tail(&path, 1).unwrap();
        assert_eq!(entries[0].status, JournalStatus::Completed);
        assert_eq!(entries[0].error_kind, None);
    }

    #[test]
    fn exit_code_reflects_failures() {
        let mut report = RunReport::default();
        assert_eq!(report.exit_code(), 0);
        report.failed_targets = 1;
        assert_eq!(report.exit_code(), 1);
        let report = RunReport {
            volumes_processed: 2,
            failed_targets: 0,
            failed_volumes: 1,
        };
        assert_eq!(report.exit_code(), 1);
    }
}
