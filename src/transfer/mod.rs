//! Strategy-selecting transfer engine.
//!
//! A transfer is a batch of source paths copied (or moved) from one
//! [`Volume`] to a directory on another. Exactly one strategy is selected
//! per transfer before any bytes move; each running transfer is owned by
//! its own thread and observed through a [`TransferHandle`] carrying the
//! cancel flag and chunk-granular progress.

mod chunked;
mod staged;
mod strategy;
mod streaming;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::volume::{CopyScanResult, Volume, VolumeError};

pub use chunked::{MountInspector, PlatformMounts, StaticMounts};
pub use strategy::TransferStrategy;

/// Errors reported by the transfer engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum TransferError {
    /// No strategy fits this endpoint combination.
    NotSupported,
    NotFound { path: String },
    /// A device endpoint dropped off mid-transfer. Bytes moved so far are
    /// preserved in the handle's progress.
    Disconnected { detail: String },
    ExclusiveAccess { owner_hint: Option<String> },
    Timeout { detail: String },
    /// Destination lacks the space the pre-flight scan requires.
    StorageFull,
    /// Cancelled by the caller; `files_processed` files completed before
    /// the flag was honored.
    Cancelled { files_processed: u64 },
    Protocol { detail: String },
    Io { message: String },
    /// Some files in the batch transferred, some failed. The batch only
    /// stops early on disconnect or cancellation.
    PartialBatchFailure {
        succeeded: Vec<String>,
        failed: Vec<BatchFailure>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub path: String,
    pub error: Box<TransferError>,
}

impl TransferError {
    pub fn user_message(&self) -> String {
        match self {
            TransferError::NotSupported => {
                "These two locations cannot exchange files directly.".to_string()
            }
            TransferError::NotFound { path } => format!("\"{}\" no longer exists.", path),
            TransferError::Disconnected { .. } => {
                "The device was disconnected during the transfer.".to_string()
            }
            TransferError::ExclusiveAccess {
                owner_hint: Some(owner),
            } => format!(
                "Another application ({}) is using this device. Close it and try again.",
                owner
            ),
            TransferError::ExclusiveAccess { owner_hint: None } => {
                "Another application is using this device. Close it and try again.".to_string()
            }
            TransferError::Timeout { .. } => "The device stopped responding.".to_string(),
            TransferError::StorageFull => {
                "There is not enough free space at the destination.".to_string()
            }
            TransferError::Cancelled { .. } => "The transfer was cancelled.".to_string(),
            TransferError::Protocol { .. } | TransferError::Io { .. } => {
                "The transfer failed.".to_string()
            }
            TransferError::PartialBatchFailure { failed, .. } => {
                format!("{} file(s) could not be transferred.", failed.len())
            }
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::NotSupported => write!(f, "no transfer strategy supports this pair"),
            TransferError::NotFound { path } => write!(f, "not found: {}", path),
            TransferError::Disconnected { detail } => write!(f, "disconnected: {}", detail),
            TransferError::ExclusiveAccess {
                owner_hint: Some(owner),
            } => write!(f, "device held by {}", owner),
            TransferError::ExclusiveAccess { owner_hint: None } => {
                write!(f, "device held by another process")
            }
            TransferError::Timeout { detail } => write!(f, "timed out: {}", detail),
            TransferError::StorageFull => write!(f, "not enough free space at destination"),
            TransferError::Cancelled { files_processed } => {
                write!(f, "cancelled after {} file(s)", files_processed)
            }
            TransferError::Protocol { detail } => write!(f, "protocol error: {}", detail),
            TransferError::Io { message } => write!(f, "I/O error: {}", message),
            TransferError::PartialBatchFailure { succeeded, failed } => write!(
                f,
                "{} file(s) transferred, {} failed",
                succeeded.len(),
                failed.len()
            ),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<VolumeError> for TransferError {
    fn from(e: VolumeError) -> Self {
        match e {
            VolumeError::NotFound { path } => TransferError::NotFound { path },
            VolumeError::NotSupported => TransferError::NotSupported,
            VolumeError::Disconnected { detail } => TransferError::Disconnected { detail },
            VolumeError::ExclusiveAccess { owner_hint } => {
                TransferError::ExclusiveAccess { owner_hint }
            }
            VolumeError::Timeout { detail } => TransferError::Timeout { detail },
            VolumeError::Cancelled => TransferError::Cancelled { files_processed: 0 },
            VolumeError::StorageFull => TransferError::StorageFull,
            VolumeError::Protocol { detail } => TransferError::Protocol { detail },
            VolumeError::PermissionDenied { path } => TransferError::Io {
                message: format!("permission denied: {}", path),
            },
            VolumeError::AlreadyExists { path } => TransferError::Io {
                message: format!("already exists: {}", path),
            },
            VolumeError::Io { message } => TransferError::Io { message },
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io {
            message: e.to_string(),
        }
    }
}

/// Chunk-granular progress of one transfer.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub files_done: u64,
    pub files_total: u64,
}

/// State shared between a running transfer thread and its handle.
pub(crate) struct TransferShared {
    cancelled: AtomicBool,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    files_done: AtomicU64,
    files_total: AtomicU64,
}

impl TransferShared {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            files_done: AtomicU64::new(0),
            files_total: AtomicU64::new(0),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::SeqCst);
    }

    fn set_totals(&self, bytes: u64, files: u64) {
        self.bytes_total.store(bytes, Ordering::SeqCst);
        self.files_total.store(files, Ordering::SeqCst);
    }

    fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::SeqCst);
    }

    fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::SeqCst)
    }

    pub(crate) fn progress(&self) -> TransferProgress {
        TransferProgress {
            bytes_done: self.bytes_done.load(Ordering::SeqCst),
            bytes_total: self.bytes_total.load(Ordering::SeqCst),
            files_done: self.files_done.load(Ordering::SeqCst),
            files_total: self.files_total.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Delete the source after a successful copy. Same-volume moves
    /// collapse into a single rename.
    pub move_source: bool,
}

pub struct TransferRequest {
    pub source: Arc<dyn Volume>,
    pub source_paths: Vec<PathBuf>,
    pub dest: Arc<dyn Volume>,
    /// Directory on the destination that receives the entries.
    pub dest_dir: PathBuf,
    pub options: TransferOptions,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub strategy: TransferStrategy,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

/// Observer and controller of one running transfer.
pub struct TransferHandle {
    id: Uuid,
    shared: Arc<TransferShared>,
    thread: Option<JoinHandle<Result<TransferSummary, TransferError>>>,
}

impl TransferHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cancellation. Takes effect at the next chunk boundary or
    /// file boundary, whichever comes first.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn progress(&self) -> TransferProgress {
        self.shared.progress()
    }

    /// Blocks until the transfer finishes and returns its outcome.
    pub fn wait(mut self) -> Result<TransferSummary, TransferError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(TransferError::Io {
                    message: "transfer thread terminated abnormally".to_string(),
                })
            }),
            None => Err(TransferError::Io {
                message: "transfer already waited on".to_string(),
            }),
        }
    }
}

pub struct TransferEngine {
    config: TransferConfig,
    mounts: Arc<dyn MountInspector>,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            mounts: Arc::new(PlatformMounts),
        }
    }

    /// Substitutes the network-mount predicate, mainly for tests.
    pub fn with_mount_inspector(mut self, mounts: Arc<dyn MountInspector>) -> Self {
        self.mounts = mounts;
        self
    }

    /// The strategy a transfer between these two volumes would use.
    pub fn select_strategy(
        &self,
        source: &dyn Volume,
        dest: &dyn Volume,
    ) -> Result<TransferStrategy, TransferError> {
        strategy::select(source, dest, self.mounts.as_ref())
    }

    /// Starts a transfer on its own thread and returns the handle.
    pub fn submit_transfer(&self, request: TransferRequest) -> TransferHandle {
        let id = Uuid::new_v4();
        let shared = Arc::new(TransferShared::new());
        let thread_shared = Arc::clone(&shared);
        let config = self.config.clone();
        let mounts = Arc::clone(&self.mounts);

        info!(
            "Transfer {}: {} item(s) from {} to {}",
            id,
            request.source_paths.len(),
            request.source.name(),
            request.dest.name()
        );

        let thread = std::thread::Builder::new()
            .name(format!("transfer-{}", id))
            .spawn(move || run_batch(request, config, mounts, thread_shared))
            .unwrap_or_else(|e| {
                // Spawn failure is reported through a completed handle.
                let message = e.to_string();
                std::thread::spawn(move || Err(TransferError::Io { message }))
            });

        TransferHandle {
            id,
            shared,
            thread: Some(thread),
        }
    }
}

struct BatchCtx<'a> {
    source: &'a dyn Volume,
    dest: &'a dyn Volume,
    strategy: TransferStrategy,
    chunk_size: usize,
    shared: &'a Arc<TransferShared>,
    succeeded: Vec<String>,
    failed: Vec<BatchFailure>,
}

fn run_batch(
    request: TransferRequest,
    config: TransferConfig,
    mounts: Arc<dyn MountInspector>,
    shared: Arc<TransferShared>,
) -> Result<TransferSummary, TransferError> {
    let TransferRequest {
        source,
        source_paths,
        dest,
        dest_dir,
        options,
    } = request;

    let same_volume_move = options.move_source && Arc::ptr_eq(&source, &dest);
    let strategy = if same_volume_move {
        TransferStrategy::SameVolumeMove
    } else {
        strategy::select(source.as_ref(), dest.as_ref(), mounts.as_ref())?
    };
    debug!("Selected strategy: {}", strategy);

    // Pre-flight: totals for progress and the destination space check,
    // fixed before any byte moves. A path that cannot be scanned fails on
    // its own and drops out of the totals; the rest of the batch proceeds.
    let mut scans: Vec<(PathBuf, CopyScanResult)> = Vec::with_capacity(source_paths.len());
    let mut scan_failures: Vec<BatchFailure> = Vec::new();
    let mut bytes_total = 0u64;
    let mut files_total = 0u64;
    for path in &source_paths {
        match source.scan_for_copy(path) {
            Ok(scan) => {
                bytes_total += scan.total_bytes;
                files_total += scan.file_count as u64;
                scans.push((path.clone(), scan));
            }
            Err(e @ VolumeError::Disconnected { .. }) => return Err(e.into()),
            Err(e) => scan_failures.push(BatchFailure {
                path: path.to_string_lossy().to_string(),
                error: Box::new(e.into()),
            }),
        }
    }
    shared.set_totals(bytes_total, files_total);

    if !same_volume_move {
        match dest.space_info() {
            Ok(space) if space.available_bytes < bytes_total => {
                return Err(TransferError::StorageFull)
            }
            _ => {}
        }
        if !dest.exists(&dest_dir) {
            match dest.create_folder(&dest_dir) {
                Ok(()) | Err(VolumeError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    if same_volume_move {
        return run_move_fast_path(dest.as_ref(), &scans, &dest_dir, &shared, scan_failures);
    }

    let mut ctx = BatchCtx {
        source: source.as_ref(),
        dest: dest.as_ref(),
        strategy,
        chunk_size: config.chunk_size,
        shared: &shared,
        succeeded: Vec::new(),
        failed: scan_failures,
    };

    for (path, _) in &scans {
        if shared.is_cancelled() {
            return Err(TransferError::Cancelled {
                files_processed: shared.files_done(),
            });
        }
        let name = match path.file_name() {
            Some(name) => name.to_owned(),
            None => {
                ctx.failed.push(BatchFailure {
                    path: path.to_string_lossy().to_string(),
                    error: Box::new(TransferError::NotFound {
                        path: path.to_string_lossy().to_string(),
                    }),
                });
                continue;
            }
        };
        let dst_path = dest_dir.join(&name);
        let failures_before = ctx.failed.len();
        match copy_entry(&mut ctx, path, &dst_path) {
            Ok(()) => {
                if options.move_source && ctx.failed.len() == failures_before {
                    if let Err(e) = source.delete(path) {
                        warn!("Copied but could not delete source {:?}: {}", path, e);
                        ctx.failed.push(BatchFailure {
                            path: path.to_string_lossy().to_string(),
                            error: Box::new(e.into()),
                        });
                    }
                }
            }
            Err(TransferError::Cancelled { .. }) => {
                return Err(TransferError::Cancelled {
                    files_processed: shared.files_done(),
                });
            }
            Err(e @ TransferError::Disconnected { .. }) => {
                warn!("Transfer aborted, device gone: {}", e);
                return Err(e);
            }
            Err(e) => {
                ctx.failed.push(BatchFailure {
                    path: path.to_string_lossy().to_string(),
                    error: Box::new(e),
                });
            }
        }
    }

    if !ctx.failed.is_empty() {
        return Err(TransferError::PartialBatchFailure {
            succeeded: ctx.succeeded,
            failed: ctx.failed,
        });
    }

    Ok(TransferSummary {
        strategy,
        files_transferred: shared.files_done(),
        bytes_transferred: shared.progress().bytes_done,
    })
}

fn run_move_fast_path(
    dest: &dyn Volume,
    scans: &[(PathBuf, CopyScanResult)],
    dest_dir: &Path,
    shared: &Arc<TransferShared>,
    mut failed: Vec<BatchFailure>,
) -> Result<TransferSummary, TransferError> {
    let mut succeeded = Vec::new();
    for (path, scan) in scans {
        if shared.is_cancelled() {
            return Err(TransferError::Cancelled {
                files_processed: shared.files_done(),
            });
        }
        match dest.move_entry(path, dest_dir) {
            Ok(()) => {
                shared.add_bytes(scan.total_bytes);
                for _ in 0..scan.file_count {
                    shared.file_done();
                }
                succeeded.push(path.to_string_lossy().to_string());
            }
            Err(e) => failed.push(BatchFailure {
                path: path.to_string_lossy().to_string(),
                error: Box::new(e.into()),
            }),
        }
    }
    if !failed.is_empty() {
        return Err(TransferError::PartialBatchFailure { succeeded, failed });
    }
    Ok(TransferSummary {
        strategy: TransferStrategy::SameVolumeMove,
        files_transferred: shared.files_done(),
        bytes_transferred: shared.progress().bytes_done,
    })
}

/// Copies one entry (file, or directory recursively). Per-file errors are
/// recorded in the context and do not stop the walk; cancellation and
/// disconnects propagate.
fn copy_entry(
    ctx: &mut BatchCtx<'_>,
    src_path: &Path,
    dst_path: &Path,
) -> Result<(), TransferError> {
    let entry = ctx.source.stat(src_path)?;
    if entry.is_directory {
        match ctx.dest.create_folder(dst_path) {
            Ok(()) | Err(VolumeError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        for child in ctx.source.list(src_path)? {
            if ctx.shared.is_cancelled() {
                return Err(TransferError::Cancelled { files_processed: 0 });
            }
            copy_entry(ctx, &src_path.join(&child.name), &dst_path.join(&child.name))?;
        }
        return Ok(());
    }

    match copy_file(ctx, src_path, dst_path) {
        Ok(()) => {
            ctx.shared.file_done();
            ctx.succeeded.push(src_path.to_string_lossy().to_string());
            Ok(())
        }
        Err(e @ TransferError::Cancelled { .. }) => Err(e),
        Err(e @ TransferError::Disconnected { .. }) => Err(e),
        Err(e) => {
            ctx.failed.push(BatchFailure {
                path: src_path.to_string_lossy().to_string(),
                error: Box::new(e),
            });
            Ok(())
        }
    }
}

fn copy_file(ctx: &mut BatchCtx<'_>, src_path: &Path, dst_path: &Path) -> Result<(), TransferError> {
    match ctx.strategy {
        TransferStrategy::PlainCopy => {
            let src_abs = strategy::absolute_local(ctx.source, src_path)
                .ok_or(TransferError::NotSupported)?;
            let dst_abs = strategy::absolute_local(ctx.dest, dst_path)
                .ok_or(TransferError::NotSupported)?;
            let copied = chunked::plain_copy(&src_abs, &dst_abs)?;
            ctx.shared.add_bytes(copied);
            Ok(())
        }
        TransferStrategy::ChunkedCopy => {
            let src_abs = strategy::absolute_local(ctx.source, src_path)
                .ok_or(TransferError::NotSupported)?;
            let dst_abs = strategy::absolute_local(ctx.dest, dst_path)
                .ok_or(TransferError::NotSupported)?;
            chunked::chunked_copy(&src_abs, &dst_abs, ctx.chunk_size, ctx.shared)?;
            Ok(())
        }
        TransferStrategy::DirectStreaming => {
            streaming::streaming_copy(ctx.source, src_path, ctx.dest, dst_path, ctx.shared)?;
            Ok(())
        }
        TransferStrategy::Staged => {
            staged::staged_copy(ctx.source, src_path, ctx.dest, dst_path, ctx.shared)?;
            Ok(())
        }
        // Handled before the per-entry walk.
        TransferStrategy::SameVolumeMove => Err(TransferError::NotSupported),
    }
}
