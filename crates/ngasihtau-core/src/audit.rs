//! Append-only audit trail, written ahead of external responses.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::events::EventPublisher;
use crate::id::Id;
use crate::model::AuditLogEntry;
use crate::repo::AuditLogRepository;

/// Well-known audit actions.
pub mod actions {
    /// Device registration.
    pub const DEVICE_REGISTER: &str = "device.register";
    /// Device deregistration.
    pub const DEVICE_DEREGISTER: &str = "device.deregister";
    /// License issuance.
    pub const LICENSE_ISSUE: &str = "license.issue";
    /// License validation.
    pub const LICENSE_VALIDATE: &str = "license.validate";
    /// License renewal.
    pub const LICENSE_RENEW: &str = "license.renew";
    /// License revocation.
    pub const LICENSE_REVOKE: &str = "license.revoke";
    /// CEK generation.
    pub const KEY_GENERATE: &str = "key.generate";
    /// CEK retrieval.
    pub const KEY_RETRIEVE: &str = "key.retrieve";
    /// Download grant.
    pub const MATERIAL_DOWNLOAD: &str = "material.download";
    /// Encryption job completion.
    pub const JOB_COMPLETE: &str = "job.complete";
    /// Encryption job terminal failure.
    pub const JOB_FAIL: &str = "job.fail";
}

/// Request metadata carried into audit entries.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Client IP as reported by the transport layer.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
}

impl RequestContext {
    /// Context for an externally originated request.
    pub fn new(ip: &str, user_agent: &str) -> Self {
        Self {
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    /// Context for internally originated work (background workers).
    pub fn system() -> Self {
        Self {
            ip: "internal".to_string(),
            user_agent: "worker".to_string(),
        }
    }
}

/// Filter for querying recorded entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Restrict to one user.
    pub user_id: Option<Id>,
    /// Restrict to one action.
    pub action: Option<String>,
    /// Keep only successful entries.
    pub success_only: bool,
}

impl AuditFilter {
    /// Whether an entry passes the filter.
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(user_id) = self.user_id {
            if entry.user_id != user_id {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &entry.action != action {
                return false;
            }
        }
        if self.success_only && !entry.success {
            return false;
        }
        true
    }
}

/// Audit writer. Appends are best-effort: a failing audit backend is logged
/// and never fails the guarded operation.
pub struct AuditTrail {
    repo: Arc<dyn AuditLogRepository>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl AuditTrail {
    /// Creates a trail over the given repository.
    pub fn new(repo: Arc<dyn AuditLogRepository>) -> Self {
        Self { repo, events: None }
    }

    /// Creates a trail that mirrors every entry onto the event bus under
    /// `audit.<action>`.
    pub fn with_events(
        repo: Arc<dyn AuditLogRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            events: Some(events),
        }
    }

    /// Records one entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        ctx: &RequestContext,
        action: &str,
        resource: &str,
        resource_id: &str,
        user_id: Id,
        device_id: Option<Id>,
        success: bool,
        error_code: Option<&str>,
    ) {
        let entry = AuditLogEntry {
            id: Id::generate(),
            user_id,
            device_id,
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: resource_id.to_string(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            success,
            error_code: error_code.map(str::to_string),
            created_at: Utc::now(),
        };
        if let Err(err) = self.repo.append(entry).await {
            warn!(action, %user_id, error = %err, "audit append failed");
        }
        if let Some(events) = &self.events {
            events
                .publish(
                    &format!("audit.{action}"),
                    json!({
                        "action": action,
                        "resource": resource,
                        "resource_id": resource_id,
                        "user_id": user_id,
                        "success": success,
                    }),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAuditRepo;

    #[tokio::test]
    async fn test_record_appends_entry() {
        let repo = Arc::new(InMemoryAuditRepo::new());
        let trail = AuditTrail::new(repo.clone());
        let user = Id::generate();
        let device = Id::generate();

        trail
            .record(
                &RequestContext::new("10.0.0.1", "client/1.0"),
                actions::LICENSE_ISSUE,
                "license",
                "some-license",
                user,
                Some(device),
                true,
                None,
            )
            .await;

        let entries = repo.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, actions::LICENSE_ISSUE);
        assert_eq!(entries[0].user_id, user);
        assert_eq!(entries[0].device_id, Some(device));
        assert_eq!(entries[0].ip, "10.0.0.1");
        assert!(entries[0].success);
        assert!(entries[0].error_code.is_none());
    }

    #[tokio::test]
    async fn test_failure_entries_carry_error_code() {
        let repo = Arc::new(InMemoryAuditRepo::new());
        let trail = AuditTrail::new(repo.clone());

        trail
            .record(
                &RequestContext::system(),
                actions::LICENSE_VALIDATE,
                "license",
                "some-license",
                Id::generate(),
                None,
                false,
                Some("INVALID_NONCE"),
            )
            .await;

        let entries = repo.entries();
        assert_eq!(entries[0].error_code.as_deref(), Some("INVALID_NONCE"));
        assert!(!entries[0].success);
        assert_eq!(entries[0].ip, "internal");
    }

    #[tokio::test]
    async fn test_with_events_mirrors_onto_bus() {
        let repo = Arc::new(InMemoryAuditRepo::new());
        let bus = Arc::new(crate::events::InMemoryEventPublisher::new());
        let trail = AuditTrail::with_events(repo.clone(), bus.clone());

        trail
            .record(
                &RequestContext::system(),
                actions::DEVICE_REGISTER,
                "device",
                "some-device",
                Id::generate(),
                None,
                true,
                None,
            )
            .await;

        assert_eq!(repo.len(), 1);
        assert_eq!(bus.count_of("audit.device.register"), 1);
    }

    #[test]
    fn test_filter_matching() {
        let user = Id::generate();
        let entry = AuditLogEntry {
            id: Id::generate(),
            user_id: user,
            device_id: None,
            action: actions::KEY_GENERATE.to_string(),
            resource: "cek".to_string(),
            resource_id: "r".to_string(),
            ip: String::new(),
            user_agent: String::new(),
            success: false,
            error_code: Some("KEY_GENERATION_FAILED".to_string()),
            created_at: Utc::now(),
        };

        assert!(AuditFilter::default().matches(&entry));
        assert!(AuditFilter {
            user_id: Some(user),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!AuditFilter {
            user_id: Some(Id::generate()),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!AuditFilter {
            action: Some(actions::LICENSE_ISSUE.to_string()),
            ..Default::default()
        }
        .matches(&entry));
        assert!(!AuditFilter {
            success_only: true,
            ..Default::default()
        }
        .matches(&entry));
    }
}
