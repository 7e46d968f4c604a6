//! Checkpoint persistence and progress watermarks.
//!
//! Workers finish records out of order. [`ProgressTracker`] folds those
//! completions into a contiguous low watermark: every offset below
//! `next_offset` is terminal. [`CheckpointManager`] writes that watermark to
//! disk with an atomic temp-file-and-rename so a crash never leaves a torn
//! checkpoint behind.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rowcast_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// On-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted run progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version.
    pub version: u32,
    /// Description of the input this checkpoint belongs to.
    pub source: String,
    /// Low watermark: every record below this offset is terminal.
    pub next_offset: u64,
    /// Terminal records across all runs on this input.
    pub records_completed: u64,
    /// Wall-clock time of the write.
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint file; checkpointing is off when unset.
    pub path: Option<PathBuf>,
    /// Terminal records between periodic writes.
    pub interval: u64,
    /// Write attempts before giving up.
    pub write_attempts: u32,
    /// Base delay between write attempts; grows linearly.
    pub retry_delay: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval: 1_000,
            write_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    last_written: Option<u64>,
}

/// Single-writer checkpoint store for one input.
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    source: String,
    write_attempts: u32,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
    writer: Mutex<WriterState>,
}

impl CheckpointManager {
    /// Creates a manager for `path`, tied to the input named `source`.
    pub fn new(
        path: impl Into<PathBuf>,
        source: impl Into<String>,
        config: &CheckpointConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            write_attempts: config.write_attempts.max(1),
            retry_delay: config.retry_delay,
            clock,
            writer: Mutex::new(WriterState::default()),
        }
    }

    /// Location of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpoint left by a previous run.
    ///
    /// Returns `Ok(None)` when no checkpoint exists.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointRead` if the file is unreadable or malformed, and
    /// `CheckpointMismatch` if it was written for a different input.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint found, starting from the beginning");
                return Ok(None);
            },
            Err(e) => return Err(DeliveryError::checkpoint_read(&self.path, e.to_string())),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| DeliveryError::checkpoint_read(&self.path, e.to_string()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(DeliveryError::checkpoint_read(
                &self.path,
                format!("unsupported checkpoint version {}", checkpoint.version),
            ));
        }

        if checkpoint.source != self.source {
            return Err(DeliveryError::CheckpointMismatch {
                expected: self.source.clone(),
                found: checkpoint.source,
            });
        }

        self.writer.lock().await.last_written = Some(checkpoint.next_offset);

        info!(
            path = %self.path.display(),
            next_offset = checkpoint.next_offset,
            records_completed = checkpoint.records_completed,
            "resuming from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Persists progress up to `next_offset`.
    ///
    /// Writes are serialized; a watermark behind the last one written is
    /// skipped so the checkpoint never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointWrite` once every write attempt has failed.
    #[allow(clippy::significant_drop_tightening)] // Writer lock spans the whole write
    pub async fn record(&self, next_offset: u64, records_completed: u64) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        if writer.last_written.is_some_and(|last| next_offset < last) {
            return Ok(false);
        }

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            source: self.source.clone(),
            next_offset,
            records_completed,
            updated_at: DateTime::<Utc>::from(self.clock.now_system()),
        };
        let content = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| DeliveryError::checkpoint_write(&self.path, e.to_string()))?;

        let mut attempt = 1;
        loop {
            match atomic_write(&self.path, &content).await {
                Ok(()) => break,
                Err(e) if attempt < self.write_attempts => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "checkpoint write failed, retrying"
                    );
                    self.clock.sleep(self.retry_delay.saturating_mul(attempt)).await;
                    attempt += 1;
                },
                Err(e) => {
                    error!(
                        path = %self.path.display(),
                        attempts = attempt,
                        error = %e,
                        "checkpoint write failed, halting run"
                    );
                    return Err(DeliveryError::checkpoint_write(&self.path, e.to_string()));
                },
            }
        }

        writer.last_written = Some(next_offset);
        debug!(next_offset, records_completed, "checkpoint written");
        Ok(true)
    }

    /// Removes the checkpoint after a run that finished without interruption.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointWrite` if an existing file cannot be removed.
    pub async fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "run complete, checkpoint cleared");
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(DeliveryError::checkpoint_write(&self.path, e.to_string())),
        }
        writer.last_written = None;
        Ok(())
    }
}

/// Writes `content` to a temp file beside `path`, then renames it over `path`.
async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().and_then(|name| name.to_str()).unwrap_or("checkpoint");
    let tmp_path = parent.join(format!(".{file_name}.tmp.{}", Uuid::new_v4()));

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Folds out-of-order terminal completions into a contiguous watermark.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    next_offset: u64,
    ahead: BTreeSet<u64>,
    records_completed: u64,
    records_settled: u64,
}

impl ProgressTracker {
    /// Starts at `next_offset` with `records_completed` carried over from a
    /// previous run.
    pub fn new(next_offset: u64, records_completed: u64) -> Self {
        Self {
            next_offset,
            ahead: BTreeSet::new(),
            records_completed,
            records_settled: records_completed,
        }
    }

    /// Marks `offset` terminal. Returns `true` if the watermark moved.
    pub fn complete(&mut self, offset: u64) -> bool {
        if offset < self.next_offset || !self.ahead.insert(offset) {
            return false;
        }
        self.records_completed += 1;

        let before = self.next_offset;
        while self.ahead.remove(&self.next_offset) {
            self.next_offset += 1;
            self.records_settled += 1;
        }
        self.next_offset != before
    }

    /// Lowest offset not yet known to be terminal.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Terminal records, including those carried over.
    pub fn records_completed(&self) -> u64 {
        self.records_completed
    }

    /// Terminal records below the watermark, including those carried over.
    ///
    /// This is the count a checkpoint persists: records above the watermark
    /// are processed again on resume and would otherwise be counted twice.
    pub fn records_settled(&self) -> u64 {
        self.records_settled
    }

    /// Terminal records sitting above a gap.
    pub fn pending_above_watermark(&self) -> usize {
        self.ahead.len()
    }
}
