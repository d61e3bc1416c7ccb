//! Staged transfer through a local temporary file.
//!
//! Used when one endpoint moves whole files only. The source is exported
//! into a per-transfer staging directory, then imported into the
//! destination. The staging directory is removed on success and on
//! failure alike.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use super::{TransferError, TransferShared};
use crate::volume::Volume;

pub(crate) fn staged_copy(
    source: &dyn Volume,
    src_path: &Path,
    dest: &dyn Volume,
    dst_path: &Path,
    shared: &Arc<TransferShared>,
) -> Result<u64, TransferError> {
    let name = src_path
        .file_name()
        .ok_or_else(|| TransferError::NotFound {
            path: src_path.to_string_lossy().to_string(),
        })?;

    let stage_dir = std::env::temp_dir().join(format!("portage-stage-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&stage_dir)?;
    let _cleanup = StageDirGuard(stage_dir.clone());
    let temp_path = stage_dir.join(name);

    debug!(
        "Staging {:?} from {} through {:?}",
        src_path,
        source.name(),
        temp_path
    );
    source.export_to_local(src_path, &temp_path)?;

    if shared.is_cancelled() {
        return Err(TransferError::Cancelled { files_processed: 0 });
    }

    match dest.import_from_local(&temp_path, dst_path) {
        Ok(written) => {
            shared.add_bytes(written);
            Ok(written)
        }
        Err(e) => {
            // Do not leave a half-imported destination behind.
            let _ = dest.delete(dst_path);
            Err(e.into())
        }
    }
}

/// Removes the staging directory when the transfer leaves scope, however
/// it ended.
struct StageDirGuard(PathBuf);

impl Drop for StageDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove staging directory {:?}: {}", self.0, e);
            }
        }
    }
}
