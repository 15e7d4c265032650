//! Sandbox policy objects.
//!
//! A sandbox here is a policy record associating a plugin with the
//! permissions it was granted; enforcement is OS-specific and delegated
//! to the embedder. The registry's job is to reject dangerous permission
//! combinations up front and to keep the audit trail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use plugrid_core::{Document, PluginError, PluginId, PluginResult};

use crate::audit::{AuditEventKind, AuditLog, AuditSeverity};
use crate::level::SecurityLevel;

/// Permissions that are refused outright below `Maximum`.
pub const DANGEROUS_PERMISSIONS: [&str; 5] = [
    "system_admin",
    "file_system_root",
    "process_create_admin",
    "registry_write_system",
    "network_unrestricted",
];

/// A sandbox policy for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// The plugin this policy applies to.
    pub plugin_id: PluginId,
    /// Granted permissions.
    pub permissions: Vec<String>,
    /// When the policy was created.
    pub created: DateTime<Utc>,
}

impl SandboxPolicy {
    /// Whether the policy grants a permission.
    #[must_use]
    pub fn grants(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Active sandbox policies, keyed by plugin id.
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<PluginId, SandboxPolicy>>,
    audit: Arc<AuditLog>,
}

impl SandboxRegistry {
    /// Create a registry writing to the given audit log.
    #[must_use]
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Create a sandbox policy for a plugin.
    ///
    /// Dangerous permissions are rejected with `SecurityViolation` unless
    /// the current level is `Maximum`. Creating a second sandbox for the
    /// same plugin replaces the first.
    pub fn create_sandbox(
        &self,
        id: &PluginId,
        permissions: Vec<String>,
        level: SecurityLevel,
    ) -> PluginResult<SandboxPolicy> {
        if level < SecurityLevel::Maximum {
            let dangerous: Vec<&String> = permissions
                .iter()
                .filter(|p| DANGEROUS_PERMISSIONS.contains(&p.as_str()))
                .collect();
            if !dangerous.is_empty() {
                let detail = json!({ "rejected_permissions": dangerous, "level": level });
                self.audit.record(
                    AuditEventKind::ViolationDetected,
                    Some(id),
                    detail,
                    AuditSeverity::Error,
                );
                warn!(plugin_id = %id, ?dangerous, "Rejected dangerous sandbox permissions");
                return Err(PluginError::security(format!(
                    "permissions {dangerous:?} require security level maximum"
                )));
            }
        }

        let policy = SandboxPolicy {
            plugin_id: id.clone(),
            permissions,
            created: Utc::now(),
        };
        lock(&self.sandboxes).insert(id.clone(), policy.clone());
        self.audit.record(
            AuditEventKind::SandboxCreated,
            Some(id),
            json!({ "permissions": policy.permissions }),
            AuditSeverity::Info,
        );
        info!(plugin_id = %id, "Created sandbox policy");
        Ok(policy)
    }

    /// Destroy a plugin's sandbox policy.
    pub fn destroy_sandbox(&self, id: &PluginId) -> PluginResult<()> {
        match lock(&self.sandboxes).remove(id) {
            Some(_) => {
                self.audit.record(
                    AuditEventKind::SandboxDestroyed,
                    Some(id),
                    Document::Null,
                    AuditSeverity::Info,
                );
                Ok(())
            },
            None => Err(PluginError::not_found(format!("sandbox for {id}"))),
        }
    }

    /// The policy for a plugin, if one exists.
    #[must_use]
    pub fn sandbox(&self, id: &PluginId) -> Option<SandboxPolicy> {
        lock(&self.sandboxes).get(id).cloned()
    }

    /// IDs of every plugin with an active sandbox.
    #[must_use]
    pub fn active_sandboxes(&self) -> Vec<PluginId> {
        lock(&self.sandboxes).keys().cloned().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugrid_core::ErrorKind;

    fn registry() -> SandboxRegistry {
        SandboxRegistry::new(Arc::new(AuditLog::new()))
    }

    #[test]
    fn create_and_destroy() {
        let registry = registry();
        let id = PluginId::from_static("p1");
        let policy = registry
            .create_sandbox(
                &id,
                vec!["file_system_read".to_string()],
                SecurityLevel::Standard,
            )
            .unwrap();
        assert!(policy.grants("file_system_read"));
        assert!(!policy.grants("network_access"));
        assert_eq!(registry.active_sandboxes(), vec![id.clone()]);

        registry.destroy_sandbox(&id).unwrap();
        let err = registry.destroy_sandbox(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn dangerous_permissions_rejected_below_maximum() {
        let registry = registry();
        let id = PluginId::from_static("p1");
        let err = registry
            .create_sandbox(
                &id,
                vec!["system_admin".to_string()],
                SecurityLevel::Strict,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(registry.sandbox(&id).is_none());
    }

    #[test]
    fn dangerous_permissions_allowed_at_maximum() {
        let registry = registry();
        let id = PluginId::from_static("p1");
        let policy = registry
            .create_sandbox(
                &id,
                vec!["network_unrestricted".to_string()],
                SecurityLevel::Maximum,
            )
            .unwrap();
        assert!(policy.grants("network_unrestricted"));
    }

    #[test]
    fn sandbox_events_audited() {
        let audit = Arc::new(AuditLog::new());
        let registry = SandboxRegistry::new(Arc::clone(&audit));
        let id = PluginId::from_static("p1");
        registry
            .create_sandbox(&id, Vec::new(), SecurityLevel::None)
            .unwrap();
        registry.destroy_sandbox(&id).unwrap();
        let events: Vec<AuditEventKind> = audit.all().iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![AuditEventKind::SandboxCreated, AuditEventKind::SandboxDestroyed]
        );
    }
}
