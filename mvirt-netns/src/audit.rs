//! Network audit logging
//!
//! Audit events are emitted on the `audit` tracing target with the component
//! name and the IDs of the affected objects, so a subscriber can route them
//! separately from operational logs.

use tracing::info;

const COMPONENT: &str = "netns";

/// Audit logger with domain-specific methods.
#[derive(Debug, Clone)]
pub struct NetnsAuditLogger {
    enabled: bool,
}

impl Default for NetnsAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl NetnsAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn log(&self, message: String, objects: &[&str]) {
        if !self.enabled {
            return;
        }
        info!(
            target: "audit",
            component = COMPONENT,
            objects = %objects.join(","),
            "{message}"
        );
    }

    // === Network Events ===

    pub fn network_created(&self, namespace: &str, manager: &str, name: &str) {
        self.log(
            format!("Network '{}/{}' created in namespace {}", manager, name, namespace),
            &[manager, name],
        );
    }

    pub fn network_deleted(&self, namespace: &str, manager: &str, name: &str) {
        self.log(
            format!("Network '{}/{}' deleted in namespace {}", manager, name, namespace),
            &[manager, name],
        );
    }

    // === Attachment Events ===

    pub fn attachment_added(&self, id: &str, lease: Option<&str>) {
        let message = match lease {
            Some(lease) => format!("Attachment '{}' added (lease {})", id, lease),
            None => format!("Attachment '{}' added", id),
        };
        self.log(message, &[id]);
    }

    pub fn attachment_failed(&self, id: &str, error: &str) {
        self.log(format!("Attachment '{}' failed: {}", id, error), &[id]);
    }

    pub fn attachment_removed(&self, id: &str) {
        self.log(format!("Attachment '{}' removed", id), &[id]);
    }

    pub fn attachment_reclaimed(&self, id: &str) {
        self.log(
            format!("Attachment '{}' reclaimed after lease expiry", id),
            &[id],
        );
    }
}
