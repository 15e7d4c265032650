//! Plugin security: validation pipeline, trust store, sandbox policy,
//! runtime behavior monitoring, and the audit log.
//!
//! The [`SecurityValidator`] is the façade the host talks to; the other
//! modules are its parts and are usable on their own.
//!
//! [`SecurityValidator`]: crate::validator::SecurityValidator

#![warn(missing_docs)]

pub mod audit;
pub mod level;
pub mod monitor;
pub mod prelude;
pub mod sandbox;
pub mod trust;
pub mod validator;

pub use audit::{AUDIT_LOG_CAP, AuditEventKind, AuditLog, AuditRecord, AuditSeverity};
pub use level::SecurityLevel;
pub use monitor::{BehaviorAssessment, RuntimeMonitor, assess_behavior};
pub use sandbox::{DANGEROUS_PERMISSIONS, SandboxPolicy, SandboxRegistry};
pub use trust::TrustStore;
pub use validator::{SecurityValidator, ValidationReport, ValidatorConfig};
