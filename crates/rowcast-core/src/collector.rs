//! Sinks for permanently failed records.
//!
//! The engine hands every terminal failure to a [`FailureCollector`] before
//! the record is counted as done, so a checkpoint never covers a failure that
//! was not persisted.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{info, warn};

use crate::{
    error::{CoreError, Result},
    models::FailedRecord,
};

/// Column appended to every failed row.
pub const FAILURE_REASON_COLUMN: &str = "failure_reason";

/// Receives permanently failed records for durable storage.
pub trait FailureCollector: Send + Sync {
    /// Persists one failed record.
    fn collect(&self, failure: &FailedRecord) -> Result<()>;

    /// Flushes buffered output.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory collector; the default when no failure file is configured.
#[derive(Debug, Default)]
pub struct MemoryFailureCollector {
    failures: Mutex<Vec<FailedRecord>>,
}

impl MemoryFailureCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything collected so far.
    pub fn failures(&self) -> Vec<FailedRecord> {
        self.failures.lock().map(|guard| guard.clone()).unwrap_or_default()
    }
}

impl FailureCollector for MemoryFailureCollector {
    fn collect(&self, failure: &FailedRecord) -> Result<()> {
        self.failures
            .lock()
            .map_err(|_| CoreError::collector("failure list lock poisoned"))?
            .push(failure.clone());
        Ok(())
    }
}

struct CsvSink {
    writer: csv::Writer<File>,
    header: Option<Vec<String>>,
}

/// Appends failed rows to a CSV file for manual replay.
///
/// A new file takes its header from the first failed record plus a
/// `failure_reason` column. An existing file keeps its header, so a resumed
/// run adds to the rows of the interrupted one. Rows are buffered until
/// [`FailureCollector::flush`].
pub struct CsvFailureFile {
    path: PathBuf,
    sink: Mutex<CsvSink>,
}

impl CsvFailureFile {
    /// Opens the failure file for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or a CSV error if
    /// an existing file has an unreadable header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = existing_header(&path)?;
        if let Some(columns) = &header {
            info!(path = %path.display(), columns = columns.len(), "appending to existing failure file");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new().from_writer(file);
        Ok(Self { path, sink: Mutex::new(CsvSink { writer, header }) })
    }

    /// Location of the failure file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FailureCollector for CsvFailureFile {
    fn collect(&self, failure: &FailedRecord) -> Result<()> {
        let mut sink =
            self.sink.lock().map_err(|_| CoreError::collector("failure file lock poisoned"))?;

        if sink.header.is_none() {
            let columns: Vec<String> = failure.record.fields().keys().cloned().collect();
            let mut header_row = columns.clone();
            header_row.push(FAILURE_REASON_COLUMN.to_string());
            sink.writer.write_record(&header_row)?;
            sink.header = Some(columns);
        }

        let columns = sink.header.clone().unwrap_or_default();
        let extra = failure.record.fields().keys().filter(|k| !columns.contains(k)).count();
        if extra > 0 {
            warn!(
                path = %self.path.display(),
                offset = failure.record.offset(),
                extra,
                "failed record has columns outside the failure file header"
            );
        }

        let mut row: Vec<String> = columns
            .iter()
            .map(|column| failure.record.get(column).unwrap_or_default().to_string())
            .collect();
        row.push(failure.reason.to_string());

        sink.writer.write_record(&row)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut sink =
            self.sink.lock().map_err(|_| CoreError::collector("failure file lock poisoned"))?;
        sink.writer.flush()?;
        Ok(())
    }
}

/// Record columns of a non-empty failure file, without `failure_reason`.
fn existing_header(path: &Path) -> Result<Option<Vec<String>>> {
    let is_empty = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len() == 0,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
        Err(error) => return Err(error.into()),
    };
    if is_empty {
        return Ok(None);
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut columns: Vec<String> = reader.headers()?.iter().map(ToString::to_string).collect();
    if columns.last().map(String::as_str) == Some(FAILURE_REASON_COLUMN) {
        columns.pop();
    }
    Ok(Some(columns))
}

impl Drop for CsvFailureFile {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            warn!(path = %self.path.display(), error = %error, "failed to flush failure file");
        }
    }
}
