//! Transfer strategy selection.
//!
//! Exactly one strategy is chosen per transfer, before any bytes move, in
//! a fixed priority order. An unattainable combination fails with
//! `NotSupported` up front.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::chunked::MountInspector;
use super::TransferError;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStrategy {
    /// Both endpoints local, no network mount involved: direct copy with
    /// full metadata preservation.
    PlainCopy,
    /// At least one endpoint on a network-protocol mount: fixed chunks
    /// with per-chunk cancellation and progress.
    ChunkedCopy,
    /// Both endpoints stream and live in distinct serialization domains:
    /// ordered chunk relay with bounded look-ahead, no intermediate file.
    DirectStreaming,
    /// One side cannot stream: stage the whole file through a local
    /// temporary path.
    Staged,
    /// Same-volume move resolved by a single rename, no byte movement.
    SameVolumeMove,
}

impl std::fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStrategy::PlainCopy => "plain copy",
            TransferStrategy::ChunkedCopy => "chunked copy",
            TransferStrategy::DirectStreaming => "direct streaming",
            TransferStrategy::Staged => "staged",
            TransferStrategy::SameVolumeMove => "same-volume move",
        };
        write!(f, "{}", name)
    }
}

/// Picks the strategy for copying between two volumes.
pub(crate) fn select(
    source: &dyn Volume,
    dest: &dyn Volume,
    mounts: &dyn MountInspector,
) -> Result<TransferStrategy, TransferError> {
    let src_local = source.local_path();
    let dst_local = dest.local_path();

    if let (Some(src_root), Some(dst_root)) = (&src_local, &dst_local) {
        let network = source.is_network_mount()
            || dest.is_network_mount()
            || mounts.is_network_mount(src_root)
            || mounts.is_network_mount(dst_root);
        return Ok(if network {
            TransferStrategy::ChunkedCopy
        } else {
            TransferStrategy::PlainCopy
        });
    }

    if src_local.is_none() && dst_local.is_none() {
        if source.supports_streaming() && dest.supports_streaming() {
            match (source.streaming_domain(), dest.streaming_domain()) {
                // One serialized command queue cannot serve both ends of
                // a relay; same-domain pairs go through a staged file.
                (Some(a), Some(b)) if a != b => return Ok(TransferStrategy::DirectStreaming),
                _ => {}
            }
        }
        return Ok(TransferStrategy::Staged);
    }

    // One side local, the other a backend volume that moves whole files
    // through a local path.
    Ok(TransferStrategy::Staged)
}

/// Absolute filesystem path of `path` on a locally addressable volume.
pub(crate) fn absolute_local(volume: &dyn Volume, path: &Path) -> Option<PathBuf> {
    let root = volume.local_path()?;
    Some(root.join(path.strip_prefix("/").unwrap_or(path)))
}
