//! End-to-end transfer engine scenarios over volume fakes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use bytes::Bytes;

use portage::transfer::{StaticMounts, TransferStrategy};
use portage::volume::{
    CopyScanResult, FileEntry, Volume, VolumeError, VolumeReadStream,
};
use portage::{
    InMemoryVolume, LocalVolume, TransferConfig, TransferEngine, TransferError, TransferOptions,
    TransferRequest,
};

fn engine() -> TransferEngine {
    TransferEngine::new(TransferConfig::default())
        .with_mount_inspector(Arc::new(StaticMounts(false)))
}

#[test]
fn staged_transfer_to_non_streaming_backend() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0xABu8; 10 * 1024 * 1024];
    std::fs::write(dir.path().join("photo.jpg"), &payload).unwrap();

    let local = Arc::new(LocalVolume::new("local", dir.path()));
    let device = Arc::new(InMemoryVolume::new("device"));
    device.create_folder(Path::new("/DCIM")).unwrap();

    let engine = engine();
    assert_eq!(
        engine
            .select_strategy(local.as_ref(), device.as_ref())
            .unwrap(),
        TransferStrategy::Staged
    );

    let handle = engine.submit_transfer(TransferRequest {
        source: Arc::clone(&local) as Arc<dyn Volume>,
        source_paths: vec![PathBuf::from("/photo.jpg")],
        dest: Arc::clone(&device) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/DCIM"),
        options: TransferOptions::default(),
    });
    let summary = handle.wait().unwrap();

    assert_eq!(summary.strategy, TransferStrategy::Staged);
    assert_eq!(summary.bytes_transferred, payload.len() as u64);
    assert_eq!(
        device.stat(Path::new("/DCIM/photo.jpg")).unwrap().size,
        Some(payload.len() as u64)
    );
    assert!(!staged_file_left_behind("photo.jpg"));
}

#[test]
fn direct_streaming_stays_bounded_on_a_huge_file() {
    // 3 GiB simulated source; nothing is materialized on either side.
    const SIZE: u64 = 3 * 1024 * 1024 * 1024;
    const CHUNK: usize = 4 * 1024 * 1024;

    let source = Arc::new(SyntheticSource {
        size: SIZE,
        chunk: CHUNK,
        pause: Mutex::new(None),
    });
    let sink = Arc::new(CountingSink::new("sink-domain"));

    let engine = engine();
    assert_eq!(
        engine
            .select_strategy(source.as_ref(), sink.as_ref())
            .unwrap(),
        TransferStrategy::DirectStreaming
    );

    let handle = engine.submit_transfer(TransferRequest {
        source: Arc::clone(&source) as Arc<dyn Volume>,
        source_paths: vec![PathBuf::from("/huge.bin")],
        dest: Arc::clone(&sink) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/"),
        options: TransferOptions::default(),
    });
    let summary = handle.wait().unwrap();

    assert_eq!(summary.strategy, TransferStrategy::DirectStreaming);
    assert_eq!(summary.bytes_transferred, SIZE);
    assert_eq!(sink.bytes_received.load(Ordering::SeqCst), SIZE);
    // The relay hands chunks through one at a time; the sink never sees
    // more than one chunk buffered.
    assert!(sink.peak_buffered.load(Ordering::SeqCst) <= CHUNK as u64);
    assert!(!staged_file_left_behind("huge.bin"));
}

#[test]
fn streaming_progress_totals_match_size_at_selection() {
    const SIZE: u64 = 50 * 1024 * 1024;
    const CHUNK: usize = 1024 * 1024;

    // Pause the stream mid-file so the totals can be observed while the
    // transfer is demonstrably in flight.
    let (paused_tx, paused_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let source = Arc::new(SyntheticSource {
        size: SIZE,
        chunk: CHUNK,
        pause: Mutex::new(Some(PausePoint {
            chunk_index: 2,
            notify: paused_tx,
            resume: Mutex::new(resume_rx),
        })),
    });
    let sink = Arc::new(CountingSink::new("sink-domain"));

    let handle = engine().submit_transfer(TransferRequest {
        source: Arc::clone(&source) as Arc<dyn Volume>,
        source_paths: vec![PathBuf::from("/f.bin")],
        dest: Arc::clone(&sink) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/"),
        options: TransferOptions::default(),
    });

    paused_rx.recv().unwrap();
    // bytes_total was fixed at selection time and equals the source size.
    assert_eq!(handle.progress().bytes_total, SIZE);
    resume_tx.send(()).unwrap();

    let summary = handle.wait().unwrap();
    assert_eq!(summary.bytes_transferred, SIZE);
    assert_eq!(sink.bytes_received.load(Ordering::SeqCst), SIZE);
}

#[test]
fn cancellation_freezes_progress_and_removes_partial_destination() {
    const CHUNK: usize = 1024 * 1024;
    const PAUSE_AT: u64 = 4;

    let (paused_tx, paused_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel();
    let source = Arc::new(SyntheticSource {
        size: 32 * CHUNK as u64,
        chunk: CHUNK,
        pause: Mutex::new(Some(PausePoint {
            chunk_index: PAUSE_AT,
            notify: paused_tx,
            resume: Mutex::new(resume_rx),
        })),
    });
    let sink = Arc::new(CountingSink::new("sink-domain"));

    let handle = engine().submit_transfer(TransferRequest {
        source: Arc::clone(&source) as Arc<dyn Volume>,
        source_paths: vec![PathBuf::from("/f.bin"), PathBuf::from("/g.bin")],
        dest: Arc::clone(&sink) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/"),
        options: TransferOptions::default(),
    });

    // Wait for the stream to reach the pause point, cancel, then let it
    // continue into the cancellation check.
    paused_rx.recv().unwrap();
    handle.cancel();
    resume_tx.send(()).unwrap();

    let result = handle.wait();
    assert!(matches!(result, Err(TransferError::Cancelled { .. })));

    // The chunk in flight when the flag was raised still lands; nothing
    // is written after it.
    let received = sink.bytes_received.load(Ordering::SeqCst);
    assert_eq!(received, (PAUSE_AT + 1) * CHUNK as u64);
    assert!(sink.deleted.load(Ordering::SeqCst));
    // The second file never started.
    assert_eq!(sink.files_started.load(Ordering::SeqCst), 1);
}

#[test]
fn disconnect_mid_batch_aborts_remainder_and_keeps_progress() {
    const SIZE: u64 = 20_000;

    let source = Arc::new(UnpluggableSource {
        size: SIZE,
        dies_at: PathBuf::from("/b.bin"),
    });
    let sink = Arc::new(CountingSink::new("sink-domain"));

    let handle = engine().submit_transfer(TransferRequest {
        source: Arc::clone(&source) as Arc<dyn Volume>,
        source_paths: vec![
            PathBuf::from("/a.bin"),
            PathBuf::from("/b.bin"),
            PathBuf::from("/c.bin"),
        ],
        dest: Arc::clone(&sink) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/"),
        options: TransferOptions::default(),
    });

    // The first file lands in full before the device drops off.
    while handle.progress().files_done < 1 {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    let progress = handle.progress();

    let result = handle.wait();
    assert!(matches!(result, Err(TransferError::Disconnected { .. })));
    // Bytes moved before the disconnect stay reported.
    assert_eq!(progress.bytes_done, SIZE);
    assert_eq!(progress.files_done, 1);
    assert_eq!(sink.bytes_received.load(Ordering::SeqCst), SIZE);
    // The third file was never attempted.
    assert_eq!(sink.files_started.load(Ordering::SeqCst), 1);
}

#[test]
fn exclusive_access_surfaces_without_hanging() {
    let source = Arc::new(HeldDevice);
    let sink = Arc::new(CountingSink::new("sink-domain"));

    let handle = engine().submit_transfer(TransferRequest {
        source: Arc::clone(&source) as Arc<dyn Volume>,
        source_paths: vec![PathBuf::from("/f.bin")],
        dest: Arc::clone(&sink) as Arc<dyn Volume>,
        dest_dir: PathBuf::from("/"),
        options: TransferOptions::default(),
    });
    match handle.wait() {
        Err(TransferError::PartialBatchFailure { failed, .. }) => {
            assert!(matches!(
                &*failed[0].error,
                TransferError::ExclusiveAccess { owner_hint: None }
            ));
        }
        other => panic!("expected exclusive-access failure, got {:?}", other.is_ok()),
    }
}

/// Streaming source that synthesizes `size` bytes without holding them.
struct SyntheticSource {
    size: u64,
    chunk: usize,
    pause: Mutex<Option<PausePoint>>,
}

struct PausePoint {
    chunk_index: u64,
    notify: mpsc::Sender<()>,
    resume: Mutex<mpsc::Receiver<()>>,
}

impl Volume for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn root(&self) -> &Path {
        Path::new("/")
    }

    fn list(&self, _path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        Ok(Vec::new())
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        Ok(FileEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_string_lossy().to_string(),
            is_directory: false,
            size: Some(self.size),
            modified: None,
        })
    }

    fn scan_for_copy(&self, _path: &Path) -> Result<CopyScanResult, VolumeError> {
        Ok(CopyScanResult {
            file_count: 1,
            dir_count: 0,
            total_bytes: self.size,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_domain(&self) -> Option<String> {
        Some("synthetic-domain".to_string())
    }

    fn export_streaming(&self, _source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        let pause = self.pause.lock().unwrap().take();
        Ok(Box::new(SyntheticStream {
            size: self.size,
            chunk: self.chunk,
            produced: 0,
            chunks_out: 0,
            pause,
        }))
    }
}

struct SyntheticStream {
    size: u64,
    chunk: usize,
    produced: u64,
    chunks_out: u64,
    pause: Option<PausePoint>,
}

impl VolumeReadStream for SyntheticStream {
    fn next_chunk(&mut self) -> Option<Result<Bytes, VolumeError>> {
        if self.produced >= self.size {
            return None;
        }
        if let Some(pause) = &self.pause {
            if self.chunks_out == pause.chunk_index {
                pause.notify.send(()).ok();
                pause.resume.lock().unwrap().recv().ok();
            }
        }
        let len = (self.size - self.produced).min(self.chunk as u64) as usize;
        self.produced += len as u64;
        self.chunks_out += 1;
        Some(Ok(Bytes::from(vec![0u8; len])))
    }

    fn total_size(&self) -> u64 {
        self.size
    }

    fn bytes_read(&self) -> u64 {
        self.produced
    }
}

/// Streaming destination that discards bytes but accounts for them,
/// tracking the largest buffer it ever held.
struct CountingSink {
    domain: String,
    bytes_received: AtomicU64,
    peak_buffered: AtomicU64,
    files_started: AtomicU64,
    deleted: AtomicBool,
}

impl CountingSink {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            bytes_received: AtomicU64::new(0),
            peak_buffered: AtomicU64::new(0),
            files_started: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }
}

impl Volume for CountingSink {
    fn name(&self) -> &str {
        "counting-sink"
    }

    fn root(&self) -> &Path {
        Path::new("/")
    }

    fn list(&self, _path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        Ok(Vec::new())
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        if path == Path::new("/") {
            Ok(FileEntry {
                name: "/".to_string(),
                path: "/".to_string(),
                is_directory: true,
                size: None,
                modified: None,
            })
        } else {
            Err(VolumeError::NotFound {
                path: path.to_string_lossy().to_string(),
            })
        }
    }

    fn delete(&self, _path: &Path) -> Result<(), VolumeError> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_domain(&self) -> Option<String> {
        Some(self.domain.clone())
    }

    fn import_streaming(
        &self,
        _dest: &Path,
        total_size: u64,
        mut stream: Box<dyn VolumeReadStream>,
    ) -> Result<u64, VolumeError> {
        self.files_started.fetch_add(1, Ordering::SeqCst);
        let mut received = 0u64;
        while let Some(chunk) = stream.next_chunk() {
            let chunk = chunk?;
            self.peak_buffered
                .fetch_max(chunk.len() as u64, Ordering::SeqCst);
            received += chunk.len() as u64;
            self.bytes_received
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
        if received != total_size {
            return Err(VolumeError::Protocol {
                detail: format!("expected {} bytes, received {}", total_size, received),
            });
        }
        Ok(received)
    }
}

/// Streaming source whose device unplugs the moment one particular file
/// is opened for export.
struct UnpluggableSource {
    size: u64,
    dies_at: PathBuf,
}

impl Volume for UnpluggableSource {
    fn name(&self) -> &str {
        "unpluggable"
    }

    fn root(&self) -> &Path {
        Path::new("/")
    }

    fn list(&self, _path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        Ok(Vec::new())
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        Ok(FileEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_string_lossy().to_string(),
            is_directory: false,
            size: Some(self.size),
            modified: None,
        })
    }

    fn scan_for_copy(&self, _path: &Path) -> Result<CopyScanResult, VolumeError> {
        Ok(CopyScanResult {
            file_count: 1,
            dir_count: 0,
            total_bytes: self.size,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_domain(&self) -> Option<String> {
        Some("unpluggable-domain".to_string())
    }

    fn export_streaming(&self, source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        if source == self.dies_at {
            return Err(VolumeError::Disconnected {
                detail: "device unplugged".to_string(),
            });
        }
        Ok(Box::new(SyntheticStream {
            size: self.size,
            chunk: 4096,
            produced: 0,
            chunks_out: 0,
            pause: None,
        }))
    }
}

/// Device volume held by another process: every transfer hook fails with
/// exclusive-access contention.
struct HeldDevice;

impl Volume for HeldDevice {
    fn name(&self) -> &str {
        "held-device"
    }

    fn root(&self) -> &Path {
        Path::new("/")
    }

    fn list(&self, _path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        Err(VolumeError::ExclusiveAccess { owner_hint: None })
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        Ok(FileEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_string_lossy().to_string(),
            is_directory: false,
            size: Some(1),
            modified: None,
        })
    }

    fn scan_for_copy(&self, _path: &Path) -> Result<CopyScanResult, VolumeError> {
        Ok(CopyScanResult {
            file_count: 1,
            dir_count: 0,
            total_bytes: 1,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_domain(&self) -> Option<String> {
        Some("held-domain".to_string())
    }

    fn export_streaming(&self, _source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        Err(VolumeError::ExclusiveAccess { owner_hint: None })
    }
}

/// Whether any staging directory still holds a file by this name.
fn staged_file_left_behind(name: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("portage-stage-")
        })
        .any(|e| e.path().join(name).exists())
}
