//! The transfer pipeline: compose send → (compression) → (rate limit) →
//! (transport) → receive with failure propagation and cleanup.
//!
//! One-shot: retry policy belongs to the orchestrator. The pipeline owns
//! every child process it starts and guarantees reaping on all exit paths,
//! escalating SIGTERM → SIGKILL after a bounded drain window.

use super::endpoint::{Endpoint, RawSnapshotMeta, StartedSnapshotReceiverRaw};
use super::lock::{self, LockError, LockKind};
use super::Snapshot;
use crate::model::{ByteRate, CompressKind};
use crate::sys::btrfs::{StartedSnapshotReceiver, StartedSnapshotSender};
use crate::sys::process::binary_in_path;
use crate::transport::{Transport, TransportError};
use bytes::BytesMut;
use chrono::Utc;
use slog_scope::{debug, info, warn};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

const DRAIN_WINDOW: Duration = Duration::from_secs(5);
const MIN_SPACE_MARGIN: u64 = 100 * 1024 * 1024;
const PUMP_BUFFER: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transient transport failure: {0}")]
    NetworkTransient(String),
    #[error("no credential available and no terminal to prompt on")]
    AuthUnavailable,
    #[error("insufficient space at destination: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("parent snapshot not found: {0}")]
    ParentMissing(String),
    #[error("stream verification failed: {0}")]
    CorruptStream(String),
    #[error("remote binary missing: {0}")]
    RemoteBinaryMissing(String),
    #[error("compressor '{0}' not available on the sending side")]
    CompressorUnavailable(CompressKind),
    #[error("transfer lock held by pid {pid} on {host}")]
    LockHeld { pid: i32, host: String, stale: bool },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl TransferError {
    /// Stable kind labels for the journal.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::NetworkTransient(_) => "network-transient",
            TransferError::AuthUnavailable => "auth-unavailable",
            TransferError::InsufficientSpace { .. } => "insufficient-space",
            TransferError::ParentMissing(_) => "parent-missing",
            TransferError::CorruptStream(_) => "corrupt-stream",
            TransferError::RemoteBinaryMissing(_) => "remote-binary-missing",
            TransferError::CompressorUnavailable(_) => "compressor-unavailable",
            TransferError::LockHeld { .. } => "lock-held",
            TransferError::Cancelled => "cancelled",
            TransferError::Precondition(_) => "precondition",
        }
    }

    /// Whether the orchestrator's retry policy applies.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TransferError::NetworkTransient(_) | TransferError::LockHeld { .. }
        )
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(d) => TransferError::NetworkTransient(d),
            TransportError::AuthRejected(d) => TransferError::Precondition(format!("authentication rejected: {}", d)),
            TransportError::AuthUnavailable => TransferError::AuthUnavailable,
            TransportError::RemoteBinaryMissing(d) => TransferError::RemoteBinaryMissing(d),
            TransportError::Protocol(d) => TransferError::NetworkTransient(d),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamShaping {
    pub compress: CompressKind,
    pub rate_limit: Option<ByteRate>,
}

/// Everything one transfer needs. `lock_dir` is the volume's snapshot
/// directory, where session locks live.
pub struct TransferRequest {
    pub source: Endpoint,
    pub snapshot: Snapshot,
    pub parent: Option<Snapshot>,
    pub dest: Endpoint,
    pub shaping: StreamShaping,
    pub require_mount: bool,
    pub force: bool,
    pub space_margin_percent: u64,
    pub lock_dir: PathBuf,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Planned,
    Locked,
    Prechecked,
    Streaming,
    Verified,
    Released,
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// True when the configured parent was absent at the destination and
    /// the plan degraded to a full stream (journaled as partial with
    /// reason parent-missing).
    pub downgraded_to_full: bool,
}

/// Make a fresh cancel token pair. Every in-flight pipeline observing the
/// receiver transitions to `Failed(Cancelled)` within the drain window.
pub fn cancel_token() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub async fn run(request: TransferRequest, cancel: watch::Receiver<bool>) -> Result<TransferOutcome, TransferError> {
    let started = tokio::time::Instant::now();
    let mut state = TransferState::Planned;
    debug!("transfer session"; "state" => ?state, "snapshot" => %request.snapshot, "dest" => request.dest.describe());

    // ## Step 1: pre-flight ## ... destination readiness and space
    request
        .dest
        .ensure_directory()
        .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
    if request.require_mount {
        request
            .dest
            .require_mounted()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
    }
    if !request.dest.is_raw() {
        let compatible = request
            .dest
            .on_compatible_filesystem()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
        if !compatible {
            return Err(TransferError::Precondition(format!(
                "destination {} is not on a btrfs filesystem",
                request.dest.describe()
            )));
        }
    }
    if let Some(tool) = request.shaping.compress.tool() {
        if !binary_in_path(tool) {
            return Err(TransferError::CompressorUnavailable(request.shaping.compress));
        }
    }

    let estimate = estimate_stream_bytes(&request).await?;
    let (available, _quota) = request
        .dest
        .free_bytes()
        .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
    let required = required_bytes(estimate, request.space_margin_percent);
    if required > available {
        if request.force {
            warn!(
                "proceeding below space margin on --force";
                "required" => required, "available" => available
            );
        } else {
            return Err(TransferError::InsufficientSpace { required, available });
        }
    }

    // ## Step 2: lock ## ... keyed on (destination, snapshot name)
    let lock_key = format!("{}:{}", request.dest.describe(), request.snapshot.name);
    let _lock = lock::acquire(&request.lock_dir, LockKind::Transfer, &lock_key, request.session_id).map_err(
        |e| match e {
            LockError::Held { owner } => TransferError::LockHeld {
                pid: owner.pid,
                host: owner.host,
                stale: false,
            },
            other => TransferError::Precondition(format!("{:#}", anyhow::Error::from(other))),
        },
    )?;
    state = TransferState::Locked;
    debug!("transfer session"; "state" => ?state, "snapshot" => %request.snapshot);

    // ## Step 3: chain match ## ... downgrade to full when the parent is gone
    let mut parent = request.parent.clone();
    let mut downgraded = false;
    if let Some(p) = &parent {
        if !destination_holds(&request.dest, p.identity())? {
            warn!(
                "parent missing at destination, downgrading to full stream";
                "parent" => %p, "dest" => request.dest.describe()
            );
            parent = None;
            downgraded = true;
        }
    }
    state = TransferState::Prechecked;
    debug!("transfer session"; "state" => ?state, "snapshot" => %request.snapshot);

    // ## Steps 4+5: assemble and execute ##
    state = TransferState::Streaming;
    debug!("transfer session"; "state" => ?state, "snapshot" => %request.snapshot);
    let streamed = run_streaming(&request, parent.as_ref(), cancel).await;
    let (bytes, incoming_name) = match streamed {
        Ok(result) => result,
        Err(e) => {
            cleanup_partial(&request, &e);
            return Err(e);
        }
    };

    // ## Step 6: post-verify ##
    if let Err(e) = verify(&request, bytes, incoming_name.as_deref()) {
        cleanup_partial(&request, &e);
        return Err(e);
    }
    state = TransferState::Verified;
    debug!("transfer session"; "state" => ?state, "snapshot" => %request.snapshot);

    // ## Step 7 ## ... journal entry is the caller's; lock releases on drop
    let outcome = TransferOutcome {
        state: TransferState::Released,
        bytes_transferred: bytes,
        duration: started.elapsed(),
        downgraded_to_full: downgraded,
    };
    info!(
        "transfer complete";
        "snapshot" => %request.snapshot,
        "dest" => request.dest.describe(),
        "bytes" => outcome.bytes_transferred,
        "full" => outcome.downgraded_to_full || request.parent.is_none()
    );
    Ok(outcome)
}

/// required = estimate + max(estimate × margin%, 100 MiB)
pub fn required_bytes(estimate: u64, margin_percent: u64) -> u64 {
    let margin = std::cmp::max(estimate.saturating_mul(margin_percent) / 100, MIN_SPACE_MARGIN);
    estimate.saturating_add(margin)
}

fn destination_holds(dest: &Endpoint, identity: Uuid) -> Result<bool, TransferError> {
    let held = if dest.is_raw() {
        dest.list_raw_metas()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
            .iter()
            .any(|m| m.received_uuid == Some(identity))
    } else {
        dest.list_subvolumes()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
            .iter()
            .any(|s| s.received_uuid == Some(identity))
    };
    Ok(held)
}

/// Size the stream without moving data. Native sources run a
/// `send --no-data` dry run and count its bytes; raw sources already know
/// their stored size.
async fn estimate_stream_bytes(request: &TransferRequest) -> Result<u64, TransferError> {
    if request.source.is_raw() {
        return raw_meta_for(&request.source, &request.snapshot).map(|m| m.bytes);
    }
    let parent_path = request.parent.as_ref().map(|p| p.path.as_path());
    let sender = request
        .source
        .open_send_stream(&request.snapshot.path, parent_path, true)
        .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
    let mut started = sender
        .start()
        .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?;
    let mut reader = started.reader();
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total: u64 = 0;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::NetworkTransient(format!("estimate stream failed: {}", e)))?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }
    started
        .wait()
        .await
        .map_err(|e| TransferError::Precondition(format!("estimate send failed: {:#}", e)))?;
    Ok(total)
}

fn raw_meta_for(endpoint: &Endpoint, snapshot: &Snapshot) -> Result<RawSnapshotMeta, TransferError> {
    endpoint
        .list_raw_metas()
        .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
        .into_iter()
        .find(|m| m.name == snapshot.name)
        .ok_or_else(|| TransferError::CorruptStream(format!("sidecar missing for {}", snapshot.name)))
}

enum SinkStage {
    Native(StartedSnapshotReceiver),
    Raw(StartedSnapshotReceiverRaw, RawSnapshotMeta),
}

/// Run the byte flow. Returns bytes delivered into the sink and, for
/// native sinks, the subvolume name the receiver reported.
async fn run_streaming(
    request: &TransferRequest,
    parent: Option<&Snapshot>,
    cancel: watch::Receiver<bool>,
) -> Result<(u64, Option<String>), TransferError> {
    let parent_path = parent.map(|p| p.path.as_path());

    // Source stage.
    let mut sender = if request.source.is_raw() {
        let meta = raw_meta_for(&request.source, &request.snapshot)?;
        request
            .source
            .open_raw_read_stream(&meta)
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
            .start()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
    } else {
        request
            .source
            .open_send_stream(&request.snapshot.path, parent_path, false)
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
            .start()
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
    };

    // Originating-side filter stages: compression always, encryption for
    // raw sinks. Native local sinks skip compression (nothing crosses a
    // wire); native remote sinks decompress in front of the remote
    // receiver instead.
    let mut filter_argvs: Vec<Vec<OsString>> = Vec::new();
    let to_native_local = !request.dest.is_raw() && !request.dest.transport().is_remote();
    if !to_native_local {
        if let Some(argv) = request.shaping.compress.compress_argv() {
            filter_argvs.push(argv.into_iter().map(OsString::from).collect());
        }
    }
    let mut raw_meta = None;
    if let Endpoint::Raw(raw) = &request.dest {
        if let Some(argv) = raw
            .encryption
            .encrypt_argv(raw.gpg_recipient.as_deref())
            .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
        {
            filter_argvs.push(argv.into_iter().map(OsString::from).collect());
        }
        raw_meta = Some(RawSnapshotMeta {
            name: request.snapshot.name.clone(),
            uuid: request.snapshot.uuid,
            received_uuid: Some(request.snapshot.identity()),
            parent_uuid: parent.map(|p| p.identity()),
            compression: raw.compression,
            encryption: raw.encryption,
            bytes: 0,
            created_at: Utc::now(),
        });
    }

    let mut filters = Vec::new();
    for argv in &filter_argvs {
        let mut command = Transport::Local.stream_command(argv, crate::transport::Elevation::None)?;
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = command
            .spawn()
            .map_err(|e| TransferError::Precondition(format!("failed to spawn filter: {}", e)))?;
        filters.push(child);
    }

    // Sink stage.
    let mut sink = match &request.dest {
        Endpoint::Raw(_) => {
            let meta = raw_meta.clone().expect("raw sink always has a meta");
            SinkStage::Raw(
                request
                    .dest
                    .open_raw_write_stream(&meta)
                    .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
                    .start()
                    .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?,
                meta,
            )
        }
        _ => SinkStage::Native(
            request
                .dest
                .open_receive_stream(request.shaping.compress)
                .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?
                .start()
                .map_err(|e| TransferError::Precondition(format!("{:#}", e)))?,
        ),
    };

    // Wire the hops and pump concurrently.
    let mut pumps = Vec::new();
    let mut next_reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(sender.reader());
    for child in filters.iter_mut() {
        let stdin = child.stdin.take().expect("filter stdin was piped");
        let stdout = child.stdout.take().expect("filter stdout was piped");
        let hop_writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        pumps.push(tokio::spawn(pump(next_reader, hop_writer, None, cancel.clone())));
        next_reader = Box::new(stdout);
    }
    let limiter = request.shaping.rate_limit.map(TokenBucket::new);
    let sink_writer: Box<dyn AsyncWrite + Send + Unpin> = match &mut sink {
        SinkStage::Native(receiver) => Box::new(receiver.writer()),
        SinkStage::Raw(writer, _) => Box::new(writer.writer()),
    };
    pumps.push(tokio::spawn(pump(next_reader, sink_writer, limiter, cancel.clone())));

    let pump_results = futures_util::future::join_all(pumps).await;
    let mut bytes_into_sink = 0;
    let mut pump_error: Option<TransferError> = None;
    let last = pump_results.len() - 1;
    for (i, joined) in pump_results.into_iter().enumerate() {
        match joined.expect("pump tasks don't panic") {
            Ok(bytes) => {
                if i == last {
                    bytes_into_sink = bytes;
                }
            }
            Err(PumpError::Cancelled) => pump_error = Some(TransferError::Cancelled),
            Err(PumpError::Io(e)) => {
                if pump_error.is_none() {
                    pump_error = Some(TransferError::NetworkTransient(format!("stream pump failed: {}", e)));
                }
            }
        }
    }

    if let Some(error) = pump_error {
        drain_failed_stages(sender, filters, sink).await;
        return Err(error);
    }

    // Barrier join: all stages must exit cleanly; any nonzero exit is a
    // failure with its stderr attached.
    let sender_result = timeout(DRAIN_WINDOW, sender.wait()).await;
    let mut stage_failure: Option<String> = None;
    match sender_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => stage_failure = Some(format!("{:#}", e)),
        Err(_) => stage_failure = Some(String::from("send stage did not exit within drain window")),
    }
    for mut child in filters {
        match timeout(DRAIN_WINDOW, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => {
                let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
                stage_failure.get_or_insert(format!("filter stage failed: {}", detail));
            }
            Ok(Err(e)) => {
                stage_failure.get_or_insert(format!("filter stage wait failed: {}", e));
            }
            Err(_) => {
                stage_failure.get_or_insert(String::from("filter stage did not exit within drain window"));
            }
        }
    }

    let incoming_name = match sink {
        SinkStage::Native(receiver) => match timeout(DRAIN_WINDOW, receiver.wait()).await {
            Ok(Ok(result)) => Some(result.incoming_name),
            Ok(Err(e)) => {
                stage_failure.get_or_insert(format!("{:#}", e));
                None
            }
            Err(_) => {
                stage_failure.get_or_insert(String::from("receive stage did not exit within drain window"));
                None
            }
        },
        SinkStage::Raw(writer, meta) => {
            match timeout(DRAIN_WINDOW, writer.wait()).await {
                Ok(Ok(())) => {
                    let mut meta = meta;
                    meta.bytes = bytes_into_sink;
                    request
                        .dest
                        .write_raw_meta(&meta)
                        .map_err(|e| TransferError::CorruptStream(format!("sidecar write failed: {:#}", e)))?;
                }
                Ok(Err(e)) => {
                    stage_failure.get_or_insert(format!("{:#}", e));
                }
                Err(_) => {
                    stage_failure.get_or_insert(String::from("raw writer did not exit within drain window"));
                }
            }
            None
        }
    };

    match stage_failure {
        Some(detail) => Err(TransferError::NetworkTransient(detail)),
        None => Ok((bytes_into_sink, incoming_name)),
    }
}

/// Post-transfer verification. Native: the materialized subvolume's
/// received_uuid must equal the identity that was sent (the protocol's
/// invariant). Raw: stored size must match what the sink consumed.
fn verify(request: &TransferRequest, bytes: u64, incoming_name: Option<&str>) -> Result<(), TransferError> {
    if request.dest.is_raw() {
        let meta = raw_meta_for(&request.dest, &request.snapshot)?;
        let stored = request
            .dest
            .raw_file_size(&meta)
            .map_err(|e| TransferError::CorruptStream(format!("{:#}", e)))?;
        if stored != bytes {
            return Err(TransferError::CorruptStream(format!(
                "raw file holds {} bytes, {} were written",
                stored, bytes
            )));
        }
        return Ok(());
    }

    let name = incoming_name.unwrap_or(&request.snapshot.name);
    let materialized = request.dest.directory().join(name);
    let info = request
        .dest
        .subvolume_show(&materialized)
        .map_err(|e| TransferError::CorruptStream(format!("received subvolume missing: {:#}", e)))?;
    if info.received_uuid != Some(request.snapshot.identity()) {
        return Err(TransferError::CorruptStream(format!(
            "received_uuid mismatch for {}: expected {}, found {}",
            name,
            request.snapshot.identity(),
            info.received_uuid.map(|u| u.to_string()).unwrap_or_else(|| String::from("none"))
        )));
    }
    Ok(())
}

/// Best-effort removal of a partially received snapshot after a failure.
/// The protocol leaves the partial under the incoming name; native deletes
/// go through the endpoint, raw partials are unlinked with the sidecar.
fn cleanup_partial(request: &TransferRequest, error: &TransferError) {
    debug!("cleaning up after failed transfer"; "error" => %error, "snapshot" => %request.snapshot);
    if request.dest.is_raw() {
        // The sidecar is written after a successful stream, so a failed
        // transfer may leave only the stream file; reconstruct its name
        // from what would have been written.
        if let Endpoint::Raw(raw) = &request.dest {
            let meta = RawSnapshotMeta {
                name: request.snapshot.name.clone(),
                uuid: request.snapshot.uuid,
                received_uuid: Some(request.snapshot.identity()),
                parent_uuid: None,
                compression: raw.compression,
                encryption: raw.encryption,
                bytes: 0,
                created_at: Utc::now(),
            };
            if let Err(e) = request.dest.destroy_raw(&meta) {
                warn!("failed to remove partial raw stream"; "error" => %e);
            }
        }
        return;
    }
    let partial = request.dest.directory().join(&request.snapshot.name);
    if request.dest.subvolume_show(&partial).is_ok() {
        if let Err(e) = request.dest.destroy_subvolume(&partial, false) {
            warn!("failed to remove partial receive"; "path" => ?partial, "error" => %e);
        }
    }
}

/// SIGTERM the stages of a failed pipeline, give them the drain window,
/// then SIGKILL whatever is left.
async fn drain_failed_stages(sender: StartedSnapshotSender, filters: Vec<tokio::process::Child>, sink: SinkStage) {
    terminate(sender.pid());
    for child in &filters {
        terminate(child.id());
    }
    let (sink_pid, sink_wait): (Option<u32>, _) = match sink {
        SinkStage::Native(receiver) => {
            let pid = receiver.pid();
            terminate(pid);
            (pid, tokio::spawn(async move {
                let _ = receiver.wait().await;
            }))
        }
        SinkStage::Raw(writer, _) => {
            let pid = writer.pid();
            terminate(pid);
            (pid, tokio::spawn(async move {
                let _ = writer.wait().await;
            }))
        }
    };

    let sender_pid = sender.pid();
    let sender_wait = tokio::spawn(async move {
        let _ = sender.wait().await;
    });
    let filter_waits: Vec<_> = filters
        .into_iter()
        .map(|mut child| {
            tokio::spawn(async move {
                let _ = child.wait().await;
            })
        })
        .collect();

    let all = async {
        let _ = sender_wait.await;
        let _ = sink_wait.await;
        for wait in filter_waits {
            let _ = wait.await;
        }
    };
    if timeout(DRAIN_WINDOW, all).await.is_err() {
        warn!("stages outlived the drain window, escalating to SIGKILL");
        kill_hard(sender_pid);
        kill_hard(sink_pid);
    }
}

fn terminate(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
}

fn kill_hard(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
    }
}

// ## Byte pumping ###################################################################################################

#[derive(Debug)]
enum PumpError {
    Cancelled,
    Io(std::io::Error),
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can never arrive.
            futures_util::future::pending::<()>().await;
        }
    }
}

/// Move bytes from reader to writer until EOF, optionally rate limited.
/// The writer is shut down on completion so downstream stages observe
/// end-of-stream.
async fn pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut limiter: Option<TokenBucket>,
    mut cancel: watch::Receiver<bool>,
) -> Result<u64, PumpError> {
    let mut buf = BytesMut::with_capacity(PUMP_BUFFER);
    let mut total: u64 = 0;
    loop {
        let n = tokio::select! {
            _ = wait_cancelled(&mut cancel) => return Err(PumpError::Cancelled),
            read = reader.read_buf(&mut buf) => read.map_err(PumpError::Io)?,
        };
        if n == 0 {
            break;
        }
        if let Some(bucket) = limiter.as_mut() {
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => return Err(PumpError::Cancelled),
                _ = bucket.acquire(n as u64) => {}
            }
        }
        writer.write_all(&buf).await.map_err(PumpError::Io)?;
        total += n as u64;
        buf.clear();
    }
    writer.shutdown().await.map_err(PumpError::Io)?;
    Ok(total)
}

/// Wall-time token bucket with one second of burst capacity.
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: tokio::time::Instant,
}

impl TokenBucket {
    fn new(rate: ByteRate) -> Self {
        let rate = rate.bytes_per_second() as f64;
        Self {
            rate,
            tokens: rate,
            last: tokio::time::Instant::now(),
        }
    }

    async fn acquire(&mut self, n: u64) {
        let now = tokio::time::Instant::now();
        self.tokens = (self.tokens + self.rate * (now - self.last).as_secs_f64()).min(self.rate);
        self.last = now;
        let needed = n as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            return;
        }
        let deficit = needed - self.tokens;
        self.tokens = 0.0;
        tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        self.last = tokio::time::Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_margin_uses_percent_with_floor() {
        let gib = 1024 * 1024 * 1024u64;
        let mib = 1024 * 1024u64;

        // 900 MiB at 10%: the 100 MiB floor beats 90 MiB, total 1000 MiB,
        // which fits in 1 GiB.
        assert_eq!(required_bytes(900 * mib, 10), 1000 * mib);
        assert!(required_bytes(900 * mib, 10) <= gib);

        // Same estimate at 15%: 135 MiB margin, total 1035 MiB, over 1 GiB.
        assert_eq!(required_bytes(900 * mib, 15), 1035 * mib);
        assert!(required_bytes(900 * mib, 15) > gib);

        // Tiny streams still clear the floor.
        assert_eq!(required_bytes(0, 10), 100 * mib);
    }

    #[test]
    fn error_kinds_are_stable_labels() {
        assert_eq!(TransferError::Cancelled.kind(), "cancelled");
        assert_eq!(
            TransferError::InsufficientSpace { required: 1, available: 0 }.kind(),
            "insufficient-space"
        );
        assert_eq!(TransferError::CompressorUnavailable(CompressKind::Zstd).kind(), "compressor-unavailable");
    }

    #[test]
    fn retryable_classes_match_policy() {
        assert!(TransferError::NetworkTransient(String::new()).retryable());
        assert!(TransferError::LockHeld {
            pid: 1,
            host: String::from("h"),
            stale: false
        }
        .retryable());
        assert!(!TransferError::Cancelled.retryable());
        assert!(!TransferError::AuthUnavailable.retryable());
        assert!(!TransferError::InsufficientSpace { required: 1, available: 0 }.retryable());
    }

    #[test]
    fn transport_errors_map_to_transfer_kinds() {
        let e: TransferError = TransportError::Unreachable(String::from("down")).into();
        assert!(matches!(e, TransferError::NetworkTransient(_)));
        let e: TransferError = TransportError::AuthUnavailable.into();
        assert!(matches!(e, TransferError::AuthUnavailable));
        let e: TransferError = TransportError::RemoteBinaryMissing(String::from("btrfs")).into();
        assert!(matches!(e, TransferError::RemoteBinaryMissing(_)));
    }

    #[tokio::test]
    async fn pump_moves_bytes_and_counts() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(client);
        let (_tx, rx) = cancel_token();

        let handle = tokio::spawn(pump(Box::new(reader), Box::new(tokio::io::sink()), None, rx.clone()));
        server.write_all(b"0123456789").await.unwrap();
        drop(server);
        drop(writer);
        let total = handle.await.unwrap().unwrap();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn pump_observes_cancellation() {
        let (client, _server) = tokio::io::duplex(1024);
        let (reader, _writer) = tokio::io::split(client);
        let (tx, rx) = cancel_token();

        let handle = tokio::spawn(pump(Box::new(reader), Box::new(tokio::io::sink()), None, rx));
        tx.send(true).unwrap();
        match handle.await.unwrap() {
            Err(PumpError::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    fn raw_endpoint(dir: &std::path::Path) -> Endpoint {
        let target: crate::model::TargetConfig =
            serde_json::from_str(&format!(r#"{{"path":"raw://{}"}}"#, dir.display())).unwrap();
        Endpoint::from_target(&target).unwrap()
    }

    #[tokio::test]
    async fn raw_to_raw_streaming_moves_stream_and_sidecar() {
        let source_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let payload = b"btrfs-send-stream-bytes";

        let stored = RawSnapshotMeta {
            name: String::from("home-20260101-000000"),
            uuid: Uuid::new_v4(),
            received_uuid: None,
            parent_uuid: None,
            compression: CompressKind::None,
            encryption: crate::model::EncryptKind::None,
            bytes: payload.len() as u64,
            created_at: Utc::now(),
        };
        std::fs::write(source_dir.path().join(stored.stream_file_name()), payload).unwrap();
        std::fs::write(
            source_dir.path().join(stored.meta_file_name()),
            serde_json::to_vec(&stored).unwrap(),
        )
        .unwrap();

        let mut snapshot = crate::core::testutil::snapshot("home-20260101-000000", "2026-01-01T00:00:00");
        snapshot.uuid = stored.uuid;

        let request = TransferRequest {
            source: raw_endpoint(source_dir.path()),
            snapshot,
            parent: None,
            dest: raw_endpoint(dest_dir.path()),
            shaping: StreamShaping::default(),
            require_mount: false,
            force: false,
            space_margin_percent: 10,
            lock_dir: dest_dir.path().to_path_buf(),
            session_id: Uuid::new_v4(),
        };
        let (_tx, rx) = cancel_token();

        let (bytes, incoming_name) = run_streaming(&request, None, rx).await.unwrap();
        assert_eq!(bytes, payload.len() as u64);
        assert!(incoming_name.is_none());

        let copied = std::fs::read(dest_dir.path().join("home-20260101-000000.btrfs")).unwrap();
        assert_eq!(copied, payload);
        let sidecar: RawSnapshotMeta =
            serde_json::from_slice(&std::fs::read(dest_dir.path().join("home-20260101-000000.meta")).unwrap())
                .unwrap();
        assert_eq!(sidecar.bytes, payload.len() as u64);
        assert_eq!(sidecar.received_uuid, Some(stored.uuid));
    }

    #[tokio::test]
    async fn token_bucket_paces_beyond_burst() {
        tokio::time::pause();
        let mut bucket = TokenBucket::new(ByteRate(1000));
        let start = tokio::time::Instant::now();

        // First 1000 bytes ride the burst capacity.
        bucket.acquire(1000).await;
        assert_eq!(start.elapsed(), Duration::from_secs(0));

        // The next 500 must wait half a second.
        bucket.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(499));
        assert!(start.elapsed() <= Duration::from_millis(600));
    }
}
