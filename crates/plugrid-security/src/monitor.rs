//! Runtime behavior monitoring.
//!
//! Plugins (or the embedder on their behalf) report behavior documents;
//! a ticker periodically assesses the latest report for every plugin
//! with an active sandbox and writes violations to the audit log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use plugrid_core::{Document, PluginId};

use crate::audit::{AuditEventKind, AuditLog, AuditSeverity};
use crate::sandbox::SandboxRegistry;

/// CPU usage at or above this percentage warns.
pub const CPU_WARN_PERCENT: f64 = 80.0;
/// CPU usage at or above this percentage is a violation.
pub const CPU_ERROR_PERCENT: f64 = 95.0;
/// Memory at or above this many bytes warns.
pub const MEMORY_WARN_BYTES: u64 = 500 * 1024 * 1024;
/// Memory at or above this many bytes is a violation.
pub const MEMORY_ERROR_BYTES: u64 = 1024 * 1024 * 1024;

const ESCALATION_MARKERS: [&str; 5] = ["sudo", "setuid", "admin", "root", "elevate"];

/// Outcome of assessing one behavior document.
#[derive(Debug, Clone, Default)]
pub struct BehaviorAssessment {
    /// Suspicious but tolerated observations.
    pub warnings: Vec<String>,
    /// Violations.
    pub errors: Vec<String>,
}

impl BehaviorAssessment {
    /// Whether the behavior passed without violations.
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Assess a behavior document against the runtime thresholds.
///
/// Recognized fields: `cpu_percent` (number), `memory_bytes` (number),
/// `permission_violations` (array), `process_operations` (array of
/// strings). Unknown fields are ignored.
#[must_use]
pub fn assess_behavior(behavior: &Document) -> BehaviorAssessment {
    let mut assessment = BehaviorAssessment::default();

    if let Some(cpu) = behavior.get("cpu_percent").and_then(Document::as_f64) {
        if cpu >= CPU_ERROR_PERCENT {
            assessment.errors.push(format!("cpu usage at {cpu:.1}%"));
        } else if cpu >= CPU_WARN_PERCENT {
            assessment.warnings.push(format!("cpu usage at {cpu:.1}%"));
        }
    }

    if let Some(mem) = behavior.get("memory_bytes").and_then(Document::as_u64) {
        if mem >= MEMORY_ERROR_BYTES {
            assessment.errors.push(format!("memory usage at {mem} bytes"));
        } else if mem >= MEMORY_WARN_BYTES {
            assessment.warnings.push(format!("memory usage at {mem} bytes"));
        }
    }

    if let Some(violations) = behavior
        .get("permission_violations")
        .and_then(Document::as_array)
    {
        for violation in violations {
            assessment
                .errors
                .push(format!("permission violation: {violation}"));
        }
    }

    if let Some(ops) = behavior.get("process_operations").and_then(Document::as_array) {
        for op in ops.iter().filter_map(Document::as_str) {
            let lowered = op.to_ascii_lowercase();
            if ESCALATION_MARKERS.iter().any(|m| lowered.contains(m)) {
                assessment
                    .errors
                    .push(format!("privilege escalation attempt: {op}"));
            }
        }
    }

    assessment
}

/// The monitoring ticker.
pub struct RuntimeMonitor {
    sandboxes: Arc<SandboxRegistry>,
    audit: Arc<AuditLog>,
    behaviors: Arc<Mutex<HashMap<PluginId, Document>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeMonitor {
    /// Create a monitor over the given sandbox registry.
    #[must_use]
    pub fn new(sandboxes: Arc<SandboxRegistry>, audit: Arc<AuditLog>) -> Self {
        Self {
            sandboxes,
            audit,
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            ticker: Mutex::new(None),
        }
    }

    /// Record the latest behavior document for a plugin.
    pub fn report_behavior(&self, id: &PluginId, behavior: Document) {
        lock(&self.behaviors).insert(id.clone(), behavior);
    }

    /// Assess a plugin's most recent behavior right now, writing any
    /// violations to the audit log.
    #[must_use]
    pub fn check_plugin_behavior(&self, id: &PluginId) -> BehaviorAssessment {
        let behavior = lock(&self.behaviors).get(id).cloned();
        let Some(behavior) = behavior else {
            return BehaviorAssessment::default();
        };
        let assessment = assess_behavior(&behavior);
        for warning in &assessment.warnings {
            warn!(plugin_id = %id, warning, "Plugin behavior warning");
        }
        if !assessment.errors.is_empty() {
            error!(plugin_id = %id, errors = ?assessment.errors, "Plugin behavior violation");
            self.audit.record(
                AuditEventKind::ViolationDetected,
                Some(id),
                json!({ "errors": assessment.errors, "warnings": assessment.warnings }),
                AuditSeverity::Error,
            );
        }
        assessment
    }

    /// Start the ticker. A second call replaces the running ticker.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        self.stop();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for id in monitor.sandboxes.active_sandboxes() {
                    let _ = monitor.check_plugin_behavior(&id);
                }
            }
        });
        *lock(&self.ticker) = Some(handle);
        self.audit.record(
            AuditEventKind::MonitoringStarted,
            None,
            json!({ "interval_ms": u64::try_from(interval.as_millis()).unwrap_or(u64::MAX) }),
            AuditSeverity::Info,
        );
    }

    /// Stop the ticker if it is running.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
            self.audit.record(
                AuditEventKind::MonitoringStopped,
                None,
                Document::Null,
                AuditSeverity::Info,
            );
        }
    }

    /// Whether the ticker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.ticker).is_some()
    }
}

impl Drop for RuntimeMonitor {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
