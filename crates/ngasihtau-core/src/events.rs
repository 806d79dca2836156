//! Fire-and-forget event publication.
//!
//! Publication never fails the caller: implementations log delivery problems
//! and move on.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

/// Well-known event subjects.
pub mod subjects {
    /// A new CEK was derived and wrapped.
    pub const KEY_GENERATED: &str = "key.generated";
    /// An existing CEK was served.
    pub const KEY_RETRIEVED: &str = "key.retrieved";
    /// A license was issued.
    pub const LICENSE_ISSUED: &str = "license.issued";
    /// A license validated successfully (nonce rotated).
    pub const LICENSE_VALIDATED: &str = "license.validated";
    /// A license was renewed.
    pub const LICENSE_RENEWED: &str = "license.renewed";
    /// A license was revoked individually.
    pub const LICENSE_REVOKED: &str = "license.revoked";
    /// Licenses were revoked because their device was revoked.
    pub const LICENSE_REVOKED_BY_DEVICE: &str = "license.revoked.by_device";
    /// Licenses were revoked because their material was withdrawn.
    pub const LICENSE_REVOKED_BY_MATERIAL: &str = "license.revoked.by_material";
    /// A device registered.
    pub const DEVICE_REGISTERED: &str = "device.registered";
    /// A device was deregistered.
    pub const DEVICE_DEREGISTERED: &str = "device.deregistered";
    /// An encryption job was created.
    pub const ENCRYPTION_REQUESTED: &str = "encryption.requested";
    /// An encryption job completed.
    pub const ENCRYPTION_COMPLETED: &str = "encryption.completed";
    /// An encryption job failed terminally.
    pub const ENCRYPTION_FAILED: &str = "encryption.failed";
    /// A download was granted.
    pub const MATERIAL_DOWNLOADED: &str = "material.downloaded";
}

/// Event bus port.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event. Infallible from the caller's point of view.
    async fn publish(&self, subject: &str, payload: Value);
}

/// Captures events in memory for assertions.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<(String, Value)>>,
}

impl InMemoryEventPublisher {
    /// Creates an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `(subject, payload)` pairs in publish order.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    /// Subjects in publish order.
    pub fn subjects(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// How many events carried the given subject.
    pub fn count_of(&self, subject: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subject)
            .count()
    }

    /// Drops all captured events.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, subject: &str, payload: Value) {
        tracing::debug!(subject, "event published");
        self.events
            .lock()
            .unwrap()
            .push((subject.to_string(), payload));
    }
}
