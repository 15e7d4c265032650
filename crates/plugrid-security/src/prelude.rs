//! Commonly used security types.

pub use crate::audit::{AuditEventKind, AuditLog, AuditRecord, AuditSeverity};
pub use crate::level::SecurityLevel;
pub use crate::trust::TrustStore;
pub use crate::validator::{SecurityValidator, ValidationReport, ValidatorConfig};
pub use plugrid_core::prelude::*;
