//! Security audit log.
//!
//! An in-memory ring buffer of security events, optionally mirrored to an
//! append-only JSONL file. File writes are flushed per record so the log
//! survives a crash mid-session.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plugrid_core::{Document, PluginError, PluginId, PluginResult};

/// Ring buffer capacity.
pub const AUDIT_LOG_CAP: usize = 10_000;

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Informational.
    Info,
    /// Suspicious but not blocking.
    Warning,
    /// A violation or failure.
    Error,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// The validator came up.
    ValidatorInitialized,
    /// Validator configuration changed.
    ConfigurationChanged,
    /// A validation pipeline run completed.
    ValidationCompleted,
    /// A sandbox policy was created for a plugin.
    SandboxCreated,
    /// A sandbox policy was destroyed.
    SandboxDestroyed,
    /// Runtime monitoring started.
    MonitoringStarted,
    /// Runtime monitoring stopped.
    MonitoringStopped,
    /// A security violation was detected.
    ViolationDetected,
    /// The audit log was cleared.
    LogCleared,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event: AuditEventKind,
    /// The plugin involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<PluginId>,
    /// Free-form event details.
    pub details: Document,
    /// Severity.
    pub severity: AuditSeverity,
}

/// The audit log. Thread-safe; all methods take `&self`.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditRecord>>,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    /// Create an in-memory-only log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror future records to an append-only file, one JSON document
    /// per line.
    pub fn attach_file(&self, path: &Path) -> PluginResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                PluginError::configuration(format!(
                    "cannot open audit log file {}: {e}",
                    path.display()
                ))
            })?;
        *lock(&self.file) = Some(file);
        Ok(())
    }

    /// Stop mirroring to a file.
    pub fn detach_file(&self) {
        *lock(&self.file) = None;
    }

    /// Append a record, evicting the oldest when full.
    pub fn record(
        &self,
        event: AuditEventKind,
        plugin_id: Option<&PluginId>,
        details: Document,
        severity: AuditSeverity,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event,
            plugin_id: plugin_id.cloned(),
            details,
            severity,
        };
        self.append_to_file(&record);
        let mut entries = lock(&self.entries);
        if entries.len() >= AUDIT_LOG_CAP {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    fn append_to_file(&self, record: &AuditRecord) {
        let mut guard = lock(&self.file);
        if let Some(file) = guard.as_mut() {
            if let Ok(line) = serde_json::to_string(record) {
                let write = file
                    .write_all(line.as_bytes())
                    .and_then(|()| file.write_all(b"\n"))
                    .and_then(|()| file.flush());
                if let Err(e) = write {
                    tracing::warn!(error = %e, "Audit log file write failed; detaching file");
                    *guard = None;
                }
            }
        }
    }

    /// The most recent `n` records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        let entries = lock(&self.entries);
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Every buffered record, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<AuditRecord> {
        lock(&self.entries).iter().cloned().collect()
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Drop all buffered records and log that it happened.
    pub fn clear(&self) {
        lock(&self.entries).clear();
        self.record(
            AuditEventKind::LogCleared,
            None,
            Document::Null,
            AuditSeverity::Info,
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_and_recent() {
        let log = AuditLog::new();
        for i in 0..5 {
            log.record(
                AuditEventKind::ValidationCompleted,
                None,
                json!({ "run": i }),
                AuditSeverity::Info,
            );
        }
        assert_eq!(log.len(), 5);
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].details, json!({ "run": 4 }));
    }

    #[test]
    fn ring_buffer_caps_at_limit() {
        let log = AuditLog::new();
        for _ in 0..AUDIT_LOG_CAP.saturating_add(10) {
            log.record(
                AuditEventKind::ViolationDetected,
                None,
                Document::Null,
                AuditSeverity::Error,
            );
        }
        assert_eq!(log.len(), AUDIT_LOG_CAP);
    }

    #[test]
    fn clear_leaves_a_trace() {
        let log = AuditLog::new();
        log.record(
            AuditEventKind::ValidatorInitialized,
            None,
            Document::Null,
            AuditSeverity::Info,
        );
        log.clear();
        let all = log.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].event, AuditEventKind::LogCleared);
    }

    #[test]
    fn file_mirror_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new();
        log.attach_file(&path).unwrap();
        let id = PluginId::from_static("p1");
        log.record(
            AuditEventKind::SandboxCreated,
            Some(&id),
            json!({ "permissions": ["file_system_read"] }),
            AuditSeverity::Info,
        );
        log.record(
            AuditEventKind::SandboxDestroyed,
            Some(&id),
            Document::Null,
            AuditSeverity::Info,
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, AuditEventKind::SandboxCreated);
        assert_eq!(first.plugin_id.unwrap().as_str(), "p1");
    }
}
