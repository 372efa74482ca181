//! In-memory table of scan records.
//!
//! The registry is the only owner of scan state. Callers address records by id
//! and always receive copies, never references into the table.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use time::{format_description::well_known, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::error::{RegistryError, RegistryResult};
use crate::types::{ResultKind, ScanOptions, ScanResult, ScanStatus, ScanSummary};

/// Progress value at which a scan is complete.
pub const PROGRESS_COMPLETE: u8 = 100;

#[derive(Debug)]
struct ScanRecord {
    target: String,
    options: ScanOptions,
    progress: u8,
    start_time: OffsetDateTime,
    end_time: Option<OffsetDateTime>,
    results: Vec<ScanResult>,
}

impl ScanRecord {
    fn new(target: String, options: ScanOptions) -> Self {
        Self {
            target,
            options,
            progress: 0,
            start_time: OffsetDateTime::now_utc(),
            end_time: None,
            results: Vec::new(),
        }
    }

    fn status(&self) -> ScanStatus {
        ScanStatus::from_progress(self.progress)
    }

    /// RUNNING (or CREATED) -> RUNNING.
    fn advance(&mut self, progress: u8) {
        self.progress = progress;
    }

    /// Any state -> COMPLETE. Stamps the end time.
    fn complete(&mut self) {
        self.progress = PROGRESS_COMPLETE;
        self.end_time = Some(OffsetDateTime::now_utc());
    }

    fn push(&mut self, kind: ResultKind, message: String) {
        self.results.push(ScanResult { kind, message });
    }
}

type SharedRecord = Arc<Mutex<ScanRecord>>;

/// Thread-safe registry of scans keyed by generated id.
///
/// The table is behind an `RwLock` and each record behind its own `Mutex`, so
/// writers on different scans do not contend and a reader never sees a record
/// halfway through an update. None of the methods block on I/O.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    scans: RwLock<HashMap<String, SharedRecord>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new scan and return its freshly generated id.
    pub fn create(&self, target: impl Into<String>, options: ScanOptions) -> String {
        let target = target.into();
        let id = Uuid::new_v4().to_string();
        debug!(scan_id = %id, %target, "creating scan");
        let record = Arc::new(Mutex::new(ScanRecord::new(target, options)));
        self.scans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), record);
        id
    }

    /// Record scan progress.
    ///
    /// Values outside `(0, 100]` are ignored, as is anything reported after the
    /// scan completed. Reaching 100 completes the scan and stamps its end time.
    pub fn set_progress(&self, id: &str, progress: i64) -> RegistryResult<()> {
        let record = self.record(id)?;
        let mut record = lock(&record);
        if record.status() == ScanStatus::Complete {
            debug!(scan_id = %id, progress, "scan already complete, ignoring progress");
            return Ok(());
        }
        match u8::try_from(progress) {
            Ok(PROGRESS_COMPLETE) => {
                record.complete();
                debug!(scan_id = %id, "scan complete");
            }
            Ok(p) if p > 0 && p < PROGRESS_COMPLETE => record.advance(p),
            _ => debug!(scan_id = %id, progress, "ignoring out of range progress"),
        }
        Ok(())
    }

    pub fn get_progress(&self, id: &str) -> RegistryResult<u8> {
        self.read(id, |r| r.progress)
    }

    pub fn get_target(&self, id: &str) -> RegistryResult<String> {
        self.read(id, |r| r.target.clone())
    }

    /// Returns a copy of the scan's options.
    pub fn get_options(&self, id: &str) -> RegistryResult<ScanOptions> {
        self.read(id, |r| r.options.clone())
    }

    /// Insert or overwrite one option.
    pub fn set_option(
        &self,
        id: &str,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> RegistryResult<()> {
        let record = self.record(id)?;
        lock(&record).options.insert(name.into(), value.into());
        Ok(())
    }

    pub fn add_alert(&self, id: &str, message: impl Into<String>) -> RegistryResult<()> {
        self.append(id, ResultKind::Alert, message.into())
    }

    pub fn add_log(&self, id: &str, message: impl Into<String>) -> RegistryResult<()> {
        self.append(id, ResultKind::Log, message.into())
    }

    pub fn add_error(&self, id: &str, message: impl Into<String>) -> RegistryResult<()> {
        self.append(id, ResultKind::Error, message.into())
    }

    /// Snapshot of the results accumulated so far, in insertion order.
    pub fn results_iterator(
        &self,
        id: &str,
    ) -> RegistryResult<impl Iterator<Item = ScanResult>> {
        self.read(id, |r| r.results.clone()).map(Vec::into_iter)
    }

    /// Ids of every registered scan, in no particular order.
    pub fn ids_iterator(&self) -> impl Iterator<Item = String> {
        let ids: Vec<String> = self
            .scans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.into_iter()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.scans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Remove a finished scan. Returns `false` and keeps the record when the
    /// scan has not reached 100% yet.
    pub fn delete(&self, id: &str) -> RegistryResult<bool> {
        let mut scans = self.scans.write().unwrap_or_else(PoisonError::into_inner);
        let record = scans
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if lock(record).status() != ScanStatus::Complete {
            debug!(scan_id = %id, "refusing to delete unfinished scan");
            return Ok(false);
        }
        scans.remove(id);
        debug!(scan_id = %id, "scan deleted");
        Ok(true)
    }

    pub fn status(&self, id: &str) -> RegistryResult<ScanStatus> {
        self.read(id, ScanRecord::status)
    }

    pub fn start_time(&self, id: &str) -> RegistryResult<OffsetDateTime> {
        self.read(id, |r| r.start_time)
    }

    pub fn end_time(&self, id: &str) -> RegistryResult<Option<OffsetDateTime>> {
        self.read(id, |r| r.end_time)
    }

    /// Consistent copy of all of a scan's metadata.
    pub fn summary(&self, id: &str) -> RegistryResult<ScanSummary> {
        self.read(id, |r| ScanSummary {
            id: id.to_string(),
            target: r.target.clone(),
            options: r.options.clone(),
            progress: r.progress,
            status: r.status(),
            start_time: format_timestamp(r.start_time),
            end_time: r.end_time.map(format_timestamp),
            result_count: r.results.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.scans.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, id: &str) -> RegistryResult<SharedRecord> {
        self.scans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&ScanRecord) -> T) -> RegistryResult<T> {
        let record = self.record(id)?;
        let guard = lock(&record);
        Ok(f(&guard))
    }

    fn append(&self, id: &str, kind: ResultKind, message: String) -> RegistryResult<()> {
        let record = self.record(id)?;
        debug!(scan_id = %id, ?kind, "appending result");
        lock(&record).push(kind, message);
        Ok(())
    }
}

fn lock(record: &Mutex<ScanRecord>) -> MutexGuard<'_, ScanRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RFC3339 UTC timestamp.
pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
