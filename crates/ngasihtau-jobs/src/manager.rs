//! Encryption job lifecycle: creation, execution, retries with exponential
//! backoff, timeouts, idempotent redelivery handling, and cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use ngasihtau_core::access::MaterialAccessChecker;
use ngasihtau_core::audit::{actions, AuditTrail, RequestContext};
use ngasihtau_core::blob::BlobStore;
use ngasihtau_core::config::{chrono_duration, Limits};
use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::events::{subjects, EventPublisher};
use ngasihtau_core::id::Id;
use ngasihtau_core::model::{
    is_supported_file_type, EncryptedMaterial, EncryptionJob, JobPriority, JobStatus,
};
use ngasihtau_core::repo::{EncryptedMaterialRepository, EncryptionJobRepository};
use ngasihtau_crypto::codec::{build_manifest, encrypt_file};
use ngasihtau_crypto::keys::KeyManager;
use ngasihtau_crypto::primitives::random_nonce;

use crate::queue::JobQueue;

/// Tuning knobs of the job manager.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Attempts before a job fails terminally.
    pub max_retries: u32,
    /// First backoff step.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Per-job execution deadline.
    pub job_timeout: Duration,
    /// Plaintext chunk size for encryption.
    pub chunk_size: usize,
}

impl JobManagerConfig {
    /// Derives the config from the process limits.
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            max_retries: limits.max_job_retries,
            retry_base_delay: limits.retry_base_delay,
            retry_max_delay: limits.retry_max_delay,
            job_timeout: limits.job_timeout,
            chunk_size: limits.chunk_size,
        }
    }
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self::from_limits(&Limits::default())
    }
}

/// What a delivery of a job resulted in. Drives the worker's queue reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished; ack.
    Completed,
    /// Retries exhausted, terminally failed; ack.
    Failed,
    /// Transient failure; redeliver after the backoff delay.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Redelivery of a job someone else owns or already finished; ack and
    /// drop.
    Skipped,
}

/// Counter snapshot of the manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobManagerStats {
    /// Jobs created.
    pub created: u64,
    /// Jobs completed.
    pub completed: u64,
    /// Jobs terminally failed.
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Attempts cut off by the job timeout.
    pub timed_out: u64,
}

/// Owns job status transitions and runs the encryption pipeline.
pub struct JobManager {
    jobs: Arc<dyn EncryptionJobRepository>,
    materials: Arc<dyn EncryptedMaterialRepository>,
    blob: Arc<dyn BlobStore>,
    access: Arc<dyn MaterialAccessChecker>,
    keys: Arc<KeyManager>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    config: JobManagerConfig,
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
}

impl JobManager {
    /// Builds the manager over its ports.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn EncryptionJobRepository>,
        materials: Arc<dyn EncryptedMaterialRepository>,
        blob: Arc<dyn BlobStore>,
        access: Arc<dyn MaterialAccessChecker>,
        keys: Arc<KeyManager>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
        config: JobManagerConfig,
    ) -> Self {
        Self {
            jobs,
            materials,
            blob,
            access,
            keys,
            queue,
            events,
            audit,
            config,
            created: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Persists a pending job and enqueues it for dispatch.
    pub async fn create_job(
        &self,
        material_id: Id,
        user_id: Id,
        device_id: Id,
        license_id: Id,
        priority: JobPriority,
    ) -> Result<EncryptionJob> {
        let job = EncryptionJob {
            id: Id::generate(),
            material_id,
            user_id,
            device_id,
            license_id,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(job.clone()).await?;
        self.queue.enqueue(job.id, priority).await?;
        self.created.fetch_add(1, Ordering::Relaxed);

        info!(job_id = %job.id, %material_id, ?priority, "encryption job created");
        self.events
            .publish(
                subjects::ENCRYPTION_REQUESTED,
                json!({
                    "job_id": job.id,
                    "material_id": material_id,
                    "user_id": user_id,
                    "priority": priority as u8,
                }),
            )
            .await;
        Ok(job)
    }

    /// Runs one delivery of a job: claims it, executes within the job
    /// timeout, and settles the result. Deliveries of jobs in a terminal or
    /// processing state are dropped ([`JobOutcome::Skipped`]).
    pub async fn run_job(&self, job_id: Id) -> Result<JobOutcome> {
        let now = Utc::now();
        let Some(job) = self.jobs.start(job_id, now).await? else {
            match self.jobs.get(job_id).await? {
                Some(existing) => {
                    debug!(%job_id, status = ?existing.status, "dropping redelivery");
                }
                None => warn!(%job_id, "dropping delivery of unknown job"),
            }
            return Ok(JobOutcome::Skipped);
        };

        match tokio::time::timeout(self.config.job_timeout, self.execute(&job)).await {
            Ok(Ok(())) => {
                self.jobs.complete(job_id, Utc::now()).await?;
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(%job_id, "encryption job completed");
                self.events
                    .publish(
                        subjects::ENCRYPTION_COMPLETED,
                        json!({ "job_id": job_id, "material_id": job.material_id }),
                    )
                    .await;
                self.audit
                    .record(
                        &RequestContext::system(),
                        actions::JOB_COMPLETE,
                        "encryption_job",
                        &job_id.to_string(),
                        job.user_id,
                        Some(job.device_id),
                        true,
                        None,
                    )
                    .await;
                Ok(JobOutcome::Completed)
            }
            Ok(Err(err)) => self.settle_failure(&job, err.to_string()).await,
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                let message = format!(
                    "timed out after {} seconds",
                    self.config.job_timeout.as_secs()
                );
                self.settle_failure(&job, message).await
            }
        }
    }

    async fn settle_failure(&self, job: &EncryptionJob, message: String) -> Result<JobOutcome> {
        if job.retry_count + 1 < self.config.max_retries {
            match self.jobs.retry(job.id).await? {
                Some(new_count) => {
                    let delay = self.backoff(new_count);
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %job.id,
                        retry_count = new_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "encryption attempt failed, scheduling retry"
                    );
                    Ok(JobOutcome::Retry { delay })
                }
                None => Ok(JobOutcome::Skipped),
            }
        } else {
            self.jobs.fail(job.id, &message, Utc::now()).await?;
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(job_id = %job.id, error = %message, "encryption job failed terminally");
            self.events
                .publish(
                    subjects::ENCRYPTION_FAILED,
                    json!({
                        "job_id": job.id,
                        "material_id": job.material_id,
                        "error": message,
                    }),
                )
                .await;
            self.audit
                .record(
                    &RequestContext::system(),
                    actions::JOB_FAIL,
                    "encryption_job",
                    &job.id.to_string(),
                    job.user_id,
                    Some(job.device_id),
                    false,
                    Some("JOB_FAILED"),
                )
                .await;
            Ok(JobOutcome::Failed)
        }
    }

    /// The encryption pipeline: fetch plaintext, derive and unwrap the CEK,
    /// encrypt into chunks, upload, and persist the material record. An
    /// upload whose record insert fails is deleted before the error returns.
    async fn execute(&self, job: &EncryptionJob) -> Result<()> {
        if self
            .materials
            .find_by_material(job.material_id)
            .await?
            .is_some()
        {
            debug!(material_id = %job.material_id, "material already encrypted");
            return Ok(());
        }

        let file = self
            .access
            .file_key(job.material_id)
            .await?
            .ok_or(ProtectionError::MaterialNotFound {
                material_id: job.material_id,
            })?;
        if !is_supported_file_type(&file.file_type) {
            return Err(ProtectionError::UnsupportedFileType {
                file_type: file.file_type,
            });
        }

        let plaintext = self.blob.get(&file.storage_key).await?;
        let record = self
            .keys
            .get_or_create_cek(
                &RequestContext::system(),
                job.user_id,
                job.material_id,
                job.device_id,
            )
            .await?;
        let cek = self.keys.unwrap_cek(&record)?;

        let seed = random_nonce();
        let encrypted = encrypt_file(&plaintext, &cek, &seed, self.config.chunk_size)?;
        let manifest = build_manifest(
            job.material_id,
            job.license_id,
            &file.file_type,
            self.config.chunk_size,
            &encrypted,
            Utc::now(),
        );

        let encrypted_file_key = format!("encrypted/{}/{}.bin", job.material_id, record.id);
        self.blob
            .put(
                &encrypted_file_key,
                encrypted.data,
                "application/octet-stream",
            )
            .await?;

        let material = EncryptedMaterial {
            id: Id::generate(),
            material_id: job.material_id,
            cek_id: record.id,
            manifest,
            encrypted_file_key: encrypted_file_key.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.materials.insert(material).await {
            // Do not leave an orphaned upload behind.
            if let Err(cleanup_err) = self.blob.delete(&encrypted_file_key).await {
                warn!(key = %encrypted_file_key, error = %cleanup_err, "orphan cleanup failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Deletes completed jobs older than `older_than`. Returns the count.
    pub async fn cleanup_old(&self, older_than: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono_duration(older_than);
        let removed = self.jobs.delete_completed_before(cutoff).await?;
        debug!(removed, "cleaned up old completed jobs");
        Ok(removed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JobManagerStats {
        JobManagerStats {
            created: self.created.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    /// `min(base · 2^retry_count, max)`.
    fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(20));
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.config.retry_max_delay)
    }
}
