//! Direct streaming relay between two backend volumes.
//!
//! The source's ordered chunk stream is handed straight to the
//! destination's streaming import. Look-ahead is bounded by the backends
//! themselves (device uploads apply backpressure through their bounded
//! chunk channel), so memory stays fixed regardless of file size. The
//! relay only intercepts chunks to check cancellation and bump progress.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use super::{TransferError, TransferShared};
use crate::volume::{Volume, VolumeError, VolumeReadStream};

pub(crate) fn streaming_copy(
    source: &dyn Volume,
    src_path: &Path,
    dest: &dyn Volume,
    dst_path: &Path,
    shared: &Arc<TransferShared>,
) -> Result<u64, TransferError> {
    let stream = source.export_streaming(src_path)?;
    let total_size = stream.total_size();
    debug!(
        "Streaming {:?} ({} bytes) from {} to {}",
        src_path,
        total_size,
        source.name(),
        dest.name()
    );

    let relay = RelayStream {
        inner: stream,
        shared: Arc::clone(shared),
    };
    match dest.import_streaming(dst_path, total_size, Box::new(relay)) {
        Ok(written) => Ok(written),
        Err(VolumeError::Cancelled) => {
            let _ = dest.delete(dst_path);
            Err(TransferError::Cancelled { files_processed: 0 })
        }
        Err(e) => {
            let _ = dest.delete(dst_path);
            Err(e.into())
        }
    }
}

/// Pass-through stream that checks the cancel flag at every chunk
/// boundary and accounts progress for chunks handed downstream.
struct RelayStream {
    inner: Box<dyn VolumeReadStream>,
    shared: Arc<TransferShared>,
}

impl VolumeReadStream for RelayStream {
    fn next_chunk(&mut self) -> Option<Result<Bytes, VolumeError>> {
        if self.shared.is_cancelled() {
            return Some(Err(VolumeError::Cancelled));
        }
        let chunk = self.inner.next_chunk();
        if let Some(Ok(chunk)) = &chunk {
            self.shared.add_bytes(chunk.len() as u64);
        }
        chunk
    }

    fn total_size(&self) -> u64 {
        self.inner.total_size()
    }

    fn bytes_read(&self) -> u64 {
        self.inner.bytes_read()
    }
}
