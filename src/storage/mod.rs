//! Persistent state on disk: the audit log and the process lock.

pub mod audit_log;
pub mod lockfile;

pub use audit_log::{AuditError, AuditLog, AuditMode};
pub use lockfile::ProcessLock;
