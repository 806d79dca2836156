//! Bounded worker pool consuming the job queue, with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ngasihtau_core::config::Limits;

use crate::manager::{JobManager, JobOutcome};
use crate::queue::JobQueue;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Idle sleep between empty queue polls.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
}

impl WorkerPoolConfig {
    /// Derives the config from the process limits.
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            concurrency: limits.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_limits(&Limits::default())
    }
}

/// A running pool of encryption workers.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns the configured number of workers consuming from `queue`.
    pub fn start(
        config: WorkerPoolConfig,
        manager: Arc<JobManager>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..config.concurrency.max(1))
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    manager.clone(),
                    queue.clone(),
                    config.poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        Self {
            shutdown_tx,
            handles,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops dispatch and waits for in-flight jobs up to the shutdown
    /// timeout. Workers still running afterwards are aborted; their jobs
    /// redeliver once the queue's ack wait expires.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let drain = async {
            for handle in &self.handles {
                // Join failures only happen for panicked workers.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("shutdown timeout elapsed, aborting remaining workers");
            for handle in &self.handles {
                handle.abort();
            }
        }
        debug!("worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    manager: Arc<JobManager>,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker = index, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match queue.consume().await {
            Ok(Some(job_id)) => match manager.run_job(job_id).await {
                Ok(JobOutcome::Retry { delay }) => {
                    let _ = queue.nak_delay(job_id, delay).await;
                }
                Ok(_) => {
                    let _ = queue.ack(job_id).await;
                }
                Err(err) => {
                    // Infrastructure error around the job itself: leave the
                    // delivery for a later attempt.
                    warn!(worker = index, %job_id, error = %err, "job delivery errored");
                    let _ = queue.nak_delay(job_id, poll_interval).await;
                }
            },
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            Err(err) => {
                warn!(worker = index, error = %err, "queue consume failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{JobManagerConfig, JobManagerStats};
    use crate::queue::PollingQueue;
    use ngasihtau_core::access::StaticAccessChecker;
    use ngasihtau_core::audit::AuditTrail;
    use ngasihtau_core::blob::{BlobStore, InMemoryBlobStore};
    use ngasihtau_core::config::ProtectionConfig;
    use ngasihtau_core::events::InMemoryEventPublisher;
    use ngasihtau_core::id::Id;
    use ngasihtau_core::memory::{
        InMemoryAuditRepo, InMemoryCekRepo, InMemoryJobRepo, InMemoryMaterialRepo,
    };
    use ngasihtau_core::model::{JobPriority, JobStatus};
    use ngasihtau_core::repo::EncryptionJobRepository;
    use ngasihtau_crypto::keys::KeyManager;

    struct Fixture {
        manager: Arc<JobManager>,
        queue: Arc<PollingQueue>,
        jobs: Arc<InMemoryJobRepo>,
        materials: Arc<InMemoryMaterialRepo>,
        blob: Arc<InMemoryBlobStore>,
        access: Arc<StaticAccessChecker>,
    }

    fn fixture() -> Fixture {
        let protection = ProtectionConfig::for_testing();
        let jobs = Arc::new(InMemoryJobRepo::new());
        let materials = Arc::new(InMemoryMaterialRepo::new());
        let blob = Arc::new(InMemoryBlobStore::new());
        let access = Arc::new(StaticAccessChecker::allow_all());
        let events = Arc::new(InMemoryEventPublisher::new());
        let audit = Arc::new(AuditTrail::new(Arc::new(InMemoryAuditRepo::new())));
        let keys = Arc::new(KeyManager::new(
            &protection,
            Arc::new(InMemoryCekRepo::new()),
            events.clone(),
            audit.clone(),
        ));
        let queue = Arc::new(PollingQueue::new(Duration::from_secs(60)));
        let manager = Arc::new(JobManager::new(
            jobs.clone(),
            materials.clone(),
            blob.clone(),
            access.clone(),
            keys,
            queue.clone(),
            events,
            audit,
            JobManagerConfig {
                max_retries: 3,
                retry_base_delay: Duration::from_millis(5),
                retry_max_delay: Duration::from_millis(20),
                job_timeout: Duration::from_secs(5),
                chunk_size: 512,
            },
        ));
        Fixture {
            manager,
            queue,
            jobs,
            materials,
            blob,
            access,
        }
    }

    fn pool_config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: workers,
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    async fn seed_material(f: &Fixture, size: usize) -> Id {
        let material = Id::generate();
        let key = format!("materials/{material}.pdf");
        f.blob
            .put(&key, vec![0x17u8; size], "application/pdf")
            .await
            .unwrap();
        f.access.set_file(material, &key, "pdf");
        material
    }

    async fn wait_for(
        f: &Fixture,
        deadline: Duration,
        predicate: impl Fn(JobManagerStats) -> bool,
    ) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if predicate(f.manager.stats()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_pool_processes_jobs() {
        let f = fixture();
        for _ in 0..6 {
            let material = seed_material(&f, 800).await;
            f.manager
                .create_job(
                    material,
                    Id::generate(),
                    Id::generate(),
                    Id::generate(),
                    JobPriority::Normal,
                )
                .await
                .unwrap();
        }

        let pool = WorkerPool::start(pool_config(3), f.manager.clone(), f.queue.clone());
        assert_eq!(pool.worker_count(), 3);

        assert!(wait_for(&f, Duration::from_secs(5), |s| s.completed == 6).await);
        pool.shutdown().await;

        assert_eq!(f.queue.inflight_len(), 0);
        assert_eq!(f.materials.len(), 6);
    }

    #[tokio::test]
    async fn test_pool_retries_through_queue() {
        let f = fixture();
        // No file registered: every attempt fails, retries drain, then the
        // job lands terminally failed.
        let material = Id::generate();
        f.access.set_file(material, "materials/missing.pdf", "pdf");
        let job = f
            .manager
            .create_job(
                material,
                Id::generate(),
                Id::generate(),
                Id::generate(),
                JobPriority::High,
            )
            .await
            .unwrap();

        let pool = WorkerPool::start(pool_config(1), f.manager.clone(), f.queue.clone());
        assert!(wait_for(&f, Duration::from_secs(5), |s| s.failed == 1).await);
        pool.shutdown().await;

        let row = f.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.retry_count, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let f = fixture();
        let pool = WorkerPool::start(pool_config(2), f.manager.clone(), f.queue.clone());
        pool.shutdown().await;

        // Work enqueued after shutdown stays queued.
        let material = seed_material(&f, 100).await;
        f.manager
            .create_job(
                material,
                Id::generate(),
                Id::generate(),
                Id::generate(),
                JobPriority::Normal,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.manager.stats().completed, 0);
        assert_eq!(f.queue.ready_len(), 1);
    }
}
