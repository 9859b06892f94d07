//! Scratch-file lifecycle for incoming photos.
//!
//! Every file written by [`TempFileManager::save`] ends in exactly one of two
//! dispositions: it is promoted into the identity store, or it gets a single
//! pending deletion in the manager's delayed queue. The queue is drained by
//! one reaper task started alongside the manager.

use crate::common::time::{self, Timestamp};
use crate::common::{FaceGateError, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SUBMISSION_PREFIX: &str = "photo";
const ENROLLED_PREFIX: &str = "user";
const MAX_NAME_ATTEMPTS: usize = 16;

/// A submission persisted to the scratch directory.
#[derive(Debug, Clone)]
pub struct SavedImage {
    pub path: PathBuf,
    pub file_name: String,
    pub received_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct PendingDeletion {
    pub path: PathBuf,
    pub fire_at: Instant,
    pub delay: Duration,
}

type PendingMap = Arc<Mutex<HashMap<PathBuf, PendingDeletion>>>;

pub struct TempFileManager {
    temp_dir: PathBuf,
    pending: PendingMap,
    queue_tx: mpsc::UnboundedSender<PendingDeletion>,
    promote_lock: tokio::sync::Mutex<()>,
}

impl TempFileManager {
    /// Create the scratch directory and start the deletion reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(temp_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir)?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_reaper(queue_rx, Arc::clone(&pending)));

        tracing::debug!("Temp file manager started in {}", temp_dir.display());

        Ok(Arc::new(Self {
            temp_dir,
            pending,
            queue_tx,
            promote_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Write `bytes` to a new, uniquely named file in the scratch directory.
    pub async fn save(&self, bytes: &[u8]) -> Result<SavedImage> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let received_at = time::now();
            let file_name = format!("{}_{}.jpg", SUBMISSION_PREFIX, time::precise_stamp(&received_at));
            let path = self.temp_dir.join(&file_name);

            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = write_all(&mut file, bytes).await {
                drop(file);
                // Nothing else references a half-written file yet
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e.into());
            }

            return Ok(SavedImage { path, file_name, received_at });
        }

        Err(FaceGateError::Storage(format!(
            "Could not allocate a unique file name in {}", self.temp_dir.display()
        )))
    }

    /// Queue a one-shot deletion of `path` after `delay`.
    ///
    /// A path can carry at most one pending deletion; scheduling it twice is an
    /// error. Failures when the deletion fires are logged, never returned.
    pub fn schedule_delete(&self, path: &Path, delay: Duration) -> Result<()> {
        let entry = PendingDeletion {
            path: path.to_path_buf(),
            fire_at: Instant::now() + delay,
            delay,
        };

        let mut pending = lock(&self.pending);
        if pending.contains_key(path) {
            return Err(FaceGateError::Storage(format!(
                "Deletion already scheduled for {}", path.display()
            )));
        }

        self.queue_tx.send(entry.clone()).map_err(|_| {
            FaceGateError::Storage("Deletion reaper is not running".to_string())
        })?;
        pending.insert(entry.path.clone(), entry);

        tracing::debug!("Scheduled deletion of {} in {:?}", path.display(), delay);
        Ok(())
    }

    /// Move `path` into `destination_dir` under an enrollment name derived
    /// from `received_at`.
    ///
    /// When that name is taken a fresh microsecond timestamp is used instead,
    /// so an existing identity is never overwritten.
    pub async fn promote(&self, path: &Path, destination_dir: &Path, received_at: &Timestamp) -> Result<PathBuf> {
        let _guard = self.promote_lock.lock().await;

        if self.is_pending(path) {
            return Err(FaceGateError::Storage(format!(
                "{} is scheduled for deletion and cannot be promoted", path.display()
            )));
        }

        tokio::fs::create_dir_all(destination_dir).await?;

        let mut destination = destination_dir.join(format!(
            "{}_{}.jpg", ENROLLED_PREFIX, time::second_stamp(received_at)
        ));
        let mut attempts = 0;
        while tokio::fs::try_exists(&destination).await? {
            attempts += 1;
            if attempts > MAX_NAME_ATTEMPTS {
                return Err(FaceGateError::Storage(format!(
                    "Could not allocate a unique identity name in {}", destination_dir.display()
                )));
            }
            destination = destination_dir.join(format!(
                "{}_{}.jpg", ENROLLED_PREFIX, time::precise_stamp(&time::now())
            ));
        }

        tokio::fs::rename(path, &destination).await?;
        Ok(destination)
    }

    /// Snapshot of the delayed queue, soonest first.
    pub fn pending_deletions(&self) -> Vec<PendingDeletion> {
        let mut entries: Vec<PendingDeletion> = lock(&self.pending).values().cloned().collect();
        entries.sort_by_key(|e| e.fire_at);
        entries
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        lock(&self.pending).contains_key(path)
    }
}

async fn write_all(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PendingDeletion>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_reaper(mut queue_rx: mpsc::UnboundedReceiver<PendingDeletion>, pending: PendingMap) {
    let mut queue: BinaryHeap<Reverse<(Instant, PathBuf)>> = BinaryHeap::new();

    loop {
        // The sleep future is built even when the branch is disabled
        let deadline = queue
            .peek()
            .map(|Reverse((at, _))| *at)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            entry = queue_rx.recv() => match entry {
                Some(entry) => queue.push(Reverse((entry.fire_at, entry.path))),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if !queue.is_empty() => {
                fire_due(&mut queue, &pending);
            }
        }
    }

    // Manager dropped: honour what is already queued, then exit
    while let Some(Reverse((at, _))) = queue.peek() {
        tokio::time::sleep_until(*at).await;
        fire_due(&mut queue, &pending);
    }
    tracing::debug!("Deletion reaper stopped");
}

fn fire_due(queue: &mut BinaryHeap<Reverse<(Instant, PathBuf)>>, pending: &PendingMap) {
    let now = Instant::now();
    while let Some(Reverse((at, _))) = queue.peek() {
        if *at > now {
            break;
        }
        let Some(Reverse((_, path))) = queue.pop() else { break };
        let entry = lock(pending).remove(&path);
        let delay = entry.map(|e| e.delay).unwrap_or_default();
        delete_file(&path, delay);
    }
}

fn delete_file(path: &Path, delay: Duration) {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("Cleaned up temporary file after {}s: {}", delay.as_secs(), name);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!("Temporary file already gone: {}", name);
        }
        Err(e) => {
            tracing::warn!("Error deleting file {}: {}", name, e);
        }
    }
}
