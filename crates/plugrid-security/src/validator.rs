//! The validation pipeline and the security façade.
//!
//! Validation runs up to five stages, gated by the security level:
//! file integrity (always), metadata shape (Basic and up), checksum
//! verification (Standard and up), permission and install-location
//! policy (Strict and up), and an optional threat scan. A stage failure
//! never aborts the pipeline; the report collects everything.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use plugrid_core::{Document, PluginId, PluginResult};
use plugrid_loader::has_image_extension;

use crate::audit::{AuditEventKind, AuditLog, AuditSeverity};
use crate::level::SecurityLevel;
use crate::monitor::{BehaviorAssessment, RuntimeMonitor};
use crate::sandbox::{SandboxPolicy, SandboxRegistry};
use crate::trust::TrustStore;

/// Files larger than this are flagged with a warning.
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// Maximum display-name length accepted in metadata.
const MAX_NAME_LEN: usize = 100;
/// Maximum number of declared dependencies.
const MAX_DEPENDENCIES: usize = 50;

const RESERVED_PATH_CHARS: [char; 6] = ['<', '>', '"', '|', '?', '*'];
const FORBIDDEN_NAME_CHARS: [char; 8] = ['<', '>', ':', '"', '|', '?', '*', '\\'];

const RISKY_PERMISSIONS: [&str; 6] = [
    "file_system_write",
    "network_access",
    "system_commands",
    "registry_access",
    "process_creation",
    "dll_injection",
];

const EXPECTED_INSTALL_DIRS: [&str; 5] =
    ["plugins", "extensions", "addons", "lib", "libraries"];

/// Symbol names whose presence in an image warrants a warning.
const THREAT_SIGNATURES: [&[u8]; 6] = [
    b"CreateRemoteThread",
    b"WriteProcessMemory",
    b"SetWindowsHookEx",
    b"ptrace",
    b"mprotect",
    b"execve",
];

/// Validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Level applied when the caller does not request one explicitly.
    pub level: SecurityLevel,
    /// Verify embedded or sibling checksums.
    pub verify_checksums: bool,
    /// Run the signature-based threat scan.
    pub enable_threat_scan: bool,
    /// Warn when the image is not under a conventional plugin directory.
    pub check_install_directory: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Standard,
            verify_checksums: true,
            enable_threat_scan: false,
            check_install_directory: false,
        }
    }
}

/// Outcome of one validation pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the file passed every applicable check.
    pub is_valid: bool,
    /// The level the pipeline ran at.
    pub validated_level: SecurityLevel,
    /// Non-blocking findings.
    pub warnings: Vec<String>,
    /// Blocking findings.
    pub errors: Vec<String>,
    /// Structured facts gathered along the way.
    pub details: BTreeMap<String, Document>,
}

impl ValidationReport {
    fn new(level: SecurityLevel) -> Self {
        Self {
            is_valid: true,
            validated_level: level,
            warnings: Vec::new(),
            errors: Vec::new(),
            details: BTreeMap::new(),
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    fn detail(&mut self, key: &str, value: Document) {
        self.details.insert(key.to_string(), value);
    }
}

/// The security façade: validation pipeline, trust store, sandbox
/// policies, runtime monitoring, and the audit log behind one handle.
pub struct SecurityValidator {
    config: RwLock<ValidatorConfig>,
    trust: Arc<TrustStore>,
    audit: Arc<AuditLog>,
    sandboxes: Arc<SandboxRegistry>,
    monitor: Arc<RuntimeMonitor>,
}

impl SecurityValidator {
    /// Create a validator with the given configuration.
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        let audit = Arc::new(AuditLog::new());
        let sandboxes = Arc::new(SandboxRegistry::new(Arc::clone(&audit)));
        let monitor = Arc::new(RuntimeMonitor::new(Arc::clone(&sandboxes), Arc::clone(&audit)));
        audit.record(
            AuditEventKind::ValidatorInitialized,
            None,
            json!({ "level": config.level }),
            AuditSeverity::Info,
        );
        info!(level = %config.level, "Security validator initialized");
        Self {
            config: RwLock::new(config),
            trust: Arc::new(TrustStore::new()),
            audit,
            sandboxes,
            monitor,
        }
    }

    /// The trust store.
    #[must_use]
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Currently configured default level.
    #[must_use]
    pub fn level(&self) -> SecurityLevel {
        read(&self.config).level
    }

    /// Snapshot of the configuration.
    #[must_use]
    pub fn config(&self) -> ValidatorConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: ValidatorConfig) {
        self.audit.record(
            AuditEventKind::ConfigurationChanged,
            None,
            json!({ "level": config.level }),
            AuditSeverity::Info,
        );
        *write(&self.config) = config;
    }

    /// Change only the default level.
    pub fn set_level(&self, level: SecurityLevel) {
        let mut config = self.config();
        config.level = level;
        self.set_config(config);
    }

    /// Validate a candidate image at the configured default level.
    ///
    /// `metadata` is the raw metadata document when the caller already
    /// extracted it; passing `None` limits the pipeline to file-level
    /// checks and fails metadata-shape validation at `Basic` and above.
    #[must_use]
    pub fn validate(&self, path: &Path, metadata: Option<&Document>) -> ValidationReport {
        self.validate_at(path, metadata, self.level())
    }

    /// Validate at an explicit level.
    #[must_use]
    pub fn validate_at(
        &self,
        path: &Path,
        metadata: Option<&Document>,
        level: SecurityLevel,
    ) -> ValidationReport {
        let config = self.config();
        let mut report = ValidationReport::new(level);

        check_file_integrity(path, &mut report);

        if level >= SecurityLevel::Basic {
            check_metadata_shape(metadata, &mut report);
        }
        if level >= SecurityLevel::Basic && config.verify_checksums {
            check_checksum(path, metadata, level, &mut report);
        }
        if level >= SecurityLevel::Strict {
            check_permissions(path, metadata, config.check_install_directory, &mut report);
        }
        if config.enable_threat_scan {
            threat_scan(path, &mut report);
        }

        let plugin_id = metadata
            .and_then(|m| m.get("id"))
            .and_then(Document::as_str)
            .and_then(|s| PluginId::new(s).ok());
        let (event, severity) = if report.is_valid {
            (AuditEventKind::ValidationCompleted, AuditSeverity::Info)
        } else {
            (AuditEventKind::ViolationDetected, AuditSeverity::Error)
        };
        self.audit.record(
            event,
            plugin_id.as_ref(),
            json!({
                "path": path.display().to_string(),
                "level": level,
                "errors": report.errors,
                "warnings": report.warnings,
            }),
            severity,
        );
        debug!(
            path = %path.display(),
            level = %level,
            valid = report.is_valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Validation completed"
        );
        report
    }

    /// Create a sandbox policy at the configured level.
    pub fn create_sandbox(
        &self,
        id: &PluginId,
        permissions: Vec<String>,
    ) -> PluginResult<SandboxPolicy> {
        self.sandboxes.create_sandbox(id, permissions, self.level())
    }

    /// Destroy a plugin's sandbox policy.
    pub fn destroy_sandbox(&self, id: &PluginId) -> PluginResult<()> {
        self.sandboxes.destroy_sandbox(id)
    }

    /// IDs of every plugin with an active sandbox.
    #[must_use]
    pub fn active_sandboxes(&self) -> Vec<PluginId> {
        self.sandboxes.active_sandboxes()
    }

    /// Record the latest behavior document for a plugin.
    pub fn report_behavior(&self, id: &PluginId, behavior: Document) {
        self.monitor.report_behavior(id, behavior);
    }

    /// Assess a plugin's latest behavior immediately.
    #[must_use]
    pub fn check_plugin_behavior(&self, id: &PluginId) -> BehaviorAssessment {
        self.monitor.check_plugin_behavior(id)
    }

    /// Start the periodic behavior ticker.
    pub fn start_runtime_monitoring(&self, interval: Duration) {
        self.monitor.start(interval);
    }

    /// Stop the ticker.
    pub fn stop_runtime_monitoring(&self) {
        self.monitor.stop();
    }
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

// ---------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------

fn check_file_integrity(path: &Path, report: &mut ValidationReport) {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        report.fail(format!("path traverses parent directories: {}", path.display()));
    }
    let text = path.to_string_lossy();
    if text.contains(RESERVED_PATH_CHARS) {
        report.fail(format!("path contains reserved characters: {text}"));
    }
    if !has_image_extension(path) {
        report.fail(format!("extension not in the allow-list: {}", path.display()));
    }

    match std::fs::metadata(path) {
        Err(e) => {
            report.fail(format!("file not accessible: {e}"));
        },
        Ok(meta) => {
            if !meta.is_file() {
                report.fail("not a regular file");
            } else {
                if meta.len() == 0 {
                    report.fail("file is empty");
                }
                if meta.len() > LARGE_FILE_BYTES {
                    report.warn(format!("file is unusually large ({} bytes)", meta.len()));
                }
                report.detail("file_size", json!(meta.len()));
                if let Err(e) = std::fs::File::open(path) {
                    report.fail(format!("file not readable: {e}"));
                }
            }
        },
    }
}

fn check_metadata_shape(metadata: Option<&Document>, report: &mut ValidationReport) {
    let Some(doc) = metadata else {
        report.fail("metadata unavailable for shape validation");
        return;
    };
    let Some(obj) = doc.as_object() else {
        report.fail("metadata document is not an object");
        return;
    };

    for field in ["name", "version", "author"] {
        match obj.get(field).and_then(Document::as_str) {
            Some(value) if !value.trim().is_empty() => {},
            _ => report.fail(format!("metadata field missing or empty: {field}")),
        }
    }

    if let Some(name) = obj.get("name").and_then(Document::as_str) {
        if name.chars().count() > MAX_NAME_LEN {
            report.fail(format!("plugin name exceeds {MAX_NAME_LEN} characters"));
        }
        if name.contains(FORBIDDEN_NAME_CHARS) {
            report.fail(format!("plugin name contains forbidden characters: {name}"));
        }
    }

    if let Some(version) = obj.get("version").and_then(Document::as_str) {
        if plugrid_core::Version::parse(version).is_err() {
            report.fail(format!("version is not valid semver: {version}"));
        }
    }

    if let Some(deps) = obj.get("dependencies") {
        match deps.as_array() {
            None => report.fail("dependencies is not an array"),
            Some(items) => {
                if items.len() > MAX_DEPENDENCIES {
                    report.fail(format!(
                        "too many dependencies ({}, max {MAX_DEPENDENCIES})",
                        items.len()
                    ));
                }
                for item in items {
                    let named = match item {
                        Document::String(s) => !s.is_empty(),
                        Document::Object(o) => o
                            .get("id")
                            .and_then(Document::as_str)
                            .is_some_and(|s| !s.is_empty()),
                        _ => false,
                    };
                    if !named {
                        report.fail("dependency entry has no usable name");
                    }
                }
            },
        }
    }
}

fn check_checksum(
    path: &Path,
    metadata: Option<&Document>,
    level: SecurityLevel,
    report: &mut ValidationReport,
) {
    let embedded = metadata
        .and_then(|m| m.get("checksum"))
        .and_then(Document::as_str)
        .map(str::to_string);
    let sibling = || {
        let sig_path = {
            let mut p = path.as_os_str().to_owned();
            p.push(".sig");
            std::path::PathBuf::from(p)
        };
        std::fs::read_to_string(sig_path)
            .ok()
            .map(|s| s.trim().to_string())
    };

    let Some(expected) = embedded.or_else(sibling) else {
        if level >= SecurityLevel::Standard {
            report.fail("no checksum available");
        } else {
            report.warn("no checksum available");
        }
        return;
    };

    match std::fs::read(path) {
        Err(e) => report.fail(format!("cannot read file for checksum: {e}")),
        Ok(bytes) => {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual.eq_ignore_ascii_case(expected.trim()) {
                report.detail("checksum_verified", json!(true));
            } else {
                report.fail(format!(
                    "checksum mismatch: expected {expected}, computed {actual}"
                ));
            }
        },
    }
}

fn check_permissions(
    path: &Path,
    metadata: Option<&Document>,
    check_install_directory: bool,
    report: &mut ValidationReport,
) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.permissions().mode() & 0o002 != 0 {
                report.warn("file is world-writable");
            }
        }
    }

    if let Some(permissions) = metadata
        .and_then(|m| m.get("permissions"))
        .and_then(Document::as_array)
    {
        for permission in permissions.iter().filter_map(Document::as_str) {
            let lowered = permission.to_ascii_lowercase();
            if ["admin", "root", "elevated"].iter().any(|m| lowered.contains(m)) {
                report.fail(format!("elevated permission requested: {permission}"));
            } else if RISKY_PERMISSIONS.contains(&lowered.as_str()) {
                report.warn(format!("risky permission requested: {permission}"));
            }
        }
    }

    if check_install_directory {
        let parent_name = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .map(str::to_ascii_lowercase);
        let expected = parent_name
            .as_deref()
            .is_some_and(|n| EXPECTED_INSTALL_DIRS.contains(&n));
        if !expected {
            report.warn(format!(
                "file is not under a conventional plugin directory: {}",
                path.display()
            ));
        }
    }
}

fn threat_scan(path: &Path, report: &mut ValidationReport) {
    let Ok(bytes) = std::fs::read(path) else {
        return;
    };
    let mut hits = Vec::new();
    for signature in THREAT_SIGNATURES {
        if bytes
            .windows(signature.len())
            .any(|window| window == signature)
        {
            hits.push(String::from_utf8_lossy(signature).into_owned());
        }
    }
    for hit in &hits {
        report.warn(format!("risky symbol referenced: {hit}"));
    }
    if !hits.is_empty() {
        report.detail("threat_signatures", json!(hits));
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
