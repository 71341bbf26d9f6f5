//! Audit events for security-relevant denials.
//!
//! Every block of external content and every role denial produces one event.
//! Events are emitted as structured `tracing` records and counted in the
//! global metrics registry so tests and operators can observe them.

use serde::Serialize;

use crate::metrics::MetricsRegistry;

/// Severity attached to an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

/// A single audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Stable event kind, e.g. `external_persistence_blocked`.
    pub kind: &'static str,
    pub severity: Severity,
    /// Item type or capability name the event concerns.
    pub subject: String,
    /// Free-form detail (offending URLs, denied role).
    pub detail: String,
}

impl AuditEvent {
    /// A write path rejected externally-marked content.
    #[must_use]
    pub fn external_persistence_blocked(item_type: &str, urls: &[String]) -> Self {
        Self {
            kind: "external_persistence_blocked",
            severity: Severity::High,
            subject: item_type.to_string(),
            detail: urls.join(", "),
        }
    }

    /// A privileged operation denied a caller.
    #[must_use]
    pub fn role_denied(role: &str, capability: &str) -> Self {
        Self {
            kind: "role_denied",
            severity: Severity::Medium,
            subject: capability.to_string(),
            detail: role.to_string(),
        }
    }
}

/// Record an audit event.
pub fn record(event: AuditEvent) {
    tracing::warn!(
        kind = event.kind,
        severity = ?event.severity,
        subject = %event.subject,
        detail = %event.detail,
        "audit event"
    );
    MetricsRegistry::global().increment_counter("audit_events_total", &[("kind", event.kind)]);
}
