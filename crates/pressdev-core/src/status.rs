use crate::error::Result;
use crate::io::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const SERVICE_RUNTIME: &str = "runtime";
pub const SERVICE_DEPENDENCIES: &str = "dependencies";
pub const SERVICE_BUILD: &str = "build";
pub const SERVICE_DEV: &str = "dev";
pub const SERVICE_STACK: &str = "stack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Building,
    Ready,
    Rebuilding,
    Error,
    Stopped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Building => "building",
            Status::Ready => "ready",
            Status::Rebuilding => "rebuilding",
            Status::Error => "error",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives service status updates. Fire-and-forget: implementations must not
/// block and never report failure back to the caller.
pub trait StatusSink: Send + Sync {
    fn report(&self, service: &str, status: Status, message: Option<&str>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StatusBoard
// ---------------------------------------------------------------------------

/// Last-write-wins status table, optionally mirrored to `status.yaml` so that
/// `pressdev status` can read it from another process.
#[derive(Default)]
pub struct StatusBoard {
    entries: Mutex<BTreeMap<String, StatusEntry>>,
    file: Option<PathBuf>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A board that rewrites `path` on every report.
    pub fn with_file(path: &Path) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            file: Some(path.to_path_buf()),
        }
    }

    pub fn get(&self, service: &str) -> Option<StatusEntry> {
        self.lock().get(service).cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, StatusEntry> {
        self.lock().clone()
    }

    /// Read a board previously written by [`StatusBoard::with_file`].
    /// A missing file is an empty board.
    pub fn read_file(path: &Path) -> Result<BTreeMap<String, StatusEntry>> {
        match std::fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StatusEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &BTreeMap<String, StatusEntry>) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(entries)?;
        atomic_write(path, yaml.as_bytes())
    }
}

impl StatusSink for StatusBoard {
    fn report(&self, service: &str, status: Status, message: Option<&str>) {
        match message {
            Some(m) => tracing::info!("[{service}] {status}: {m}"),
            None => tracing::info!("[{service}] {status}"),
        }
        let mut entries = self.lock();
        entries.insert(
            service.to_string(),
            StatusEntry {
                status,
                message: message.map(str::to_owned),
                updated_at: Utc::now(),
            },
        );
        if let Err(e) = self.persist(&entries) {
            tracing::warn!("failed to write status file: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Sink that keeps every report in order, for asserting transition sequences.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    reports: Mutex<Vec<(String, Status, Option<String>)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn statuses(&self, service: &str) -> Vec<Status> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == service)
            .map(|(_, st, _)| *st)
            .collect()
    }

    pub(crate) fn last(&self, service: &str) -> Option<(Status, Option<String>)> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _, _)| s == service)
            .map(|(_, st, m)| (*st, m.clone()))
    }
}

#[cfg(test)]
impl StatusSink for RecordingSink {
    fn report(&self, service: &str, status: Status, message: Option<&str>) {
        self.reports.lock().unwrap().push((
            service.to_string(),
            status,
            message.map(str::to_owned),
        ));
    }
}
