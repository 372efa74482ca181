use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Option name to option value, as supplied when a scan is created.
pub type ScanOptions = HashMap<String, String>;

/// Kind tag attached to every result appended to a scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ResultKind {
    Alert = 0,
    Log = 1,
    Error = 2,
}

/// One tagged result entry, replayed in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub kind: ResultKind,
    pub message: String,
}

impl ScanResult {
    pub fn new(kind: ResultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Lifecycle state derived from a record's progress.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Created,
    Running,
    Complete,
}

impl ScanStatus {
    pub fn from_progress(progress: u8) -> Self {
        match progress {
            0 => ScanStatus::Created,
            100..=u8::MAX => ScanStatus::Complete,
            _ => ScanStatus::Running,
        }
    }
}

/// Copy of a scan's metadata, safe to hand out to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub id: String,
    pub target: String,
    pub options: ScanOptions,
    pub progress: u8,
    pub status: ScanStatus,
    pub start_time: String,
    pub end_time: Option<String>,
    pub result_count: usize,
}
