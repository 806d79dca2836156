//! Shared test harness: the whole protection stack wired over the
//! in-memory ports.

use std::sync::Arc;

use chrono::Utc;

use ngasihtau_core::access::StaticAccessChecker;
use ngasihtau_core::audit::{AuditTrail, RequestContext};
use ngasihtau_core::blob::{BlobStore, InMemoryBlobStore};
use ngasihtau_core::config::ProtectionConfig;
use ngasihtau_core::events::InMemoryEventPublisher;
use ngasihtau_core::id::Id;
use ngasihtau_core::kv::InMemoryKv;
use ngasihtau_core::memory::{
    InMemoryAuditRepo, InMemoryCekRepo, InMemoryDeviceRepo, InMemoryJobRepo,
    InMemoryLicenseRepo, InMemoryMaterialRepo,
};
use ngasihtau_core::model::{Device, License, Platform};
use ngasihtau_crypto::keys::KeyManager;
use ngasihtau_guard::blocklist::FailureTracker;
use ngasihtau_guard::gate::SecurityGate;
use ngasihtau_guard::rate_limit::DownloadRateLimiter;
use ngasihtau_jobs::manager::{JobManager, JobManagerConfig};
use ngasihtau_jobs::queue::PollingQueue;
use ngasihtau_licensing::devices::DeviceRegistry;
use ngasihtau_licensing::download::DownloadCoordinator;
use ngasihtau_licensing::licenses::LicenseEngine;

/// A fingerprint that satisfies the registry's length rules.
pub const FINGERPRINT: &str = "0123456789abcdef0123456789abcdef";

/// The full stack over in-memory ports.
pub struct TestStack {
    pub config: ProtectionConfig,
    pub kv: Arc<InMemoryKv>,
    pub blob: Arc<InMemoryBlobStore>,
    pub events: Arc<InMemoryEventPublisher>,
    pub audit_repo: Arc<InMemoryAuditRepo>,
    pub access: Arc<StaticAccessChecker>,
    pub device_repo: Arc<InMemoryDeviceRepo>,
    pub license_repo: Arc<InMemoryLicenseRepo>,
    pub cek_repo: Arc<InMemoryCekRepo>,
    pub material_repo: Arc<InMemoryMaterialRepo>,
    pub job_repo: Arc<InMemoryJobRepo>,
    pub keys: Arc<KeyManager>,
    pub engine: Arc<LicenseEngine>,
    pub registry: Arc<DeviceRegistry>,
    pub coordinator: Arc<DownloadCoordinator>,
    pub queue: Arc<PollingQueue>,
    pub jobs: Arc<JobManager>,
    pub gate: Arc<SecurityGate>,
    pub tracker: Arc<FailureTracker>,
}

impl TestStack {
    /// Wires every subsystem over fresh in-memory ports.
    pub fn new() -> Self {
        let config = ProtectionConfig::for_testing();
        let kv = Arc::new(InMemoryKv::new());
        let blob = Arc::new(InMemoryBlobStore::new());
        let events = Arc::new(InMemoryEventPublisher::new());
        let audit_repo = Arc::new(InMemoryAuditRepo::new());
        let audit = Arc::new(AuditTrail::with_events(audit_repo.clone(), events.clone()));
        let access = Arc::new(StaticAccessChecker::allow_all());
        let device_repo = Arc::new(InMemoryDeviceRepo::new());
        let license_repo = Arc::new(InMemoryLicenseRepo::new());
        let cek_repo = Arc::new(InMemoryCekRepo::new());
        let material_repo = Arc::new(InMemoryMaterialRepo::new());
        let job_repo = Arc::new(InMemoryJobRepo::new());
        let tracker = Arc::new(FailureTracker::new(kv.clone(), &config.limits));

        let keys = Arc::new(KeyManager::new(
            &config,
            cek_repo.clone(),
            events.clone(),
            audit.clone(),
        ));
        let engine = Arc::new(LicenseEngine::new(
            license_repo.clone(),
            device_repo.clone(),
            access.clone(),
            tracker.clone(),
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            device_repo.clone(),
            engine.clone(),
            keys.clone(),
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let queue = Arc::new(PollingQueue::new(config.limits.job_timeout));
        let jobs = Arc::new(JobManager::new(
            job_repo.clone(),
            material_repo.clone(),
            blob.clone(),
            access.clone(),
            keys.clone(),
            queue.clone(),
            events.clone(),
            audit.clone(),
            JobManagerConfig::from_limits(&config.limits),
        ));
        let coordinator = Arc::new(DownloadCoordinator::new(
            registry.clone(),
            engine.clone(),
            material_repo.clone(),
            blob.clone(),
            Arc::new(DownloadRateLimiter::new(kv.clone(), &config.limits)),
            kv.clone(),
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let gate = Arc::new(SecurityGate::new(&config, kv.clone()));

        Self {
            config,
            kv,
            blob,
            events,
            audit_repo,
            access,
            device_repo,
            license_repo,
            cek_repo,
            material_repo,
            job_repo,
            keys,
            engine,
            registry,
            coordinator,
            queue,
            jobs,
            gate,
            tracker,
        }
    }

    /// Registers a device with the shared test fingerprint.
    pub async fn register_device(&self, user_id: Id) -> Device {
        self.registry
            .register(
                &RequestContext::system(),
                user_id,
                FINGERPRINT,
                "integration device",
                Platform::Desktop,
                Utc::now(),
            )
            .await
            .unwrap()
    }

    /// Issues a license for the triple using the shared fingerprint.
    pub async fn issue_license(&self, user_id: Id, material_id: Id, device_id: Id) -> License {
        self.engine
            .issue(
                &RequestContext::system(),
                user_id,
                material_id,
                device_id,
                FINGERPRINT,
                Utc::now(),
            )
            .await
            .unwrap()
    }

    /// Uploads plaintext source bytes for a material and registers its
    /// catalog entry.
    pub async fn seed_source(&self, material_id: Id, bytes: Vec<u8>) {
        let key = format!("materials/{material_id}.pdf");
        self.blob
            .put(&key, bytes, "application/pdf")
            .await
            .unwrap();
        self.access.set_file(material_id, &key, "pdf");
    }
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}
