//! Job dispatch queue: the port shared by the in-process polling queue and
//! any durable external work queue.
//!
//! Dispatch semantics (priority, retries, idempotent redelivery handling)
//! live in the job manager; the queue only moves job ids.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ngasihtau_core::error::Result;
use ngasihtau_core::id::Id;
use ngasihtau_core::model::JobPriority;

/// Queue port with at-least-once delivery semantics.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes a job id available for consumption.
    async fn enqueue(&self, job_id: Id, priority: JobPriority) -> Result<()>;

    /// Takes the next deliverable job id, highest priority first, FIFO
    /// within a priority. `None` when nothing is ready.
    async fn consume(&self) -> Result<Option<Id>>;

    /// Confirms a delivery; the job will not be redelivered.
    async fn ack(&self, job_id: Id) -> Result<()>;

    /// Returns a delivery for immediate redelivery.
    async fn nak(&self, job_id: Id) -> Result<()>;

    /// Returns a delivery for redelivery after `delay`.
    async fn nak_delay(&self, job_id: Id, delay: Duration) -> Result<()>;
}

struct Delivery {
    delivered_at: Instant,
    priority: JobPriority,
}

#[derive(Default)]
struct QueueState {
    // Ordered by (priority, arrival): High dispatches first, FIFO inside.
    ready: BTreeSet<(JobPriority, u64, Id)>,
    delayed: Vec<(Instant, JobPriority, Id)>,
    inflight: HashMap<Id, Delivery>,
    seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, priority: JobPriority, job_id: Id) {
        self.seq += 1;
        self.ready.insert((priority, self.seq, job_id));
    }
}

/// In-process [`JobQueue`]. Unacked deliveries older than `ack_wait` are
/// redelivered, matching the ack-wait behavior of a durable external queue.
pub struct PollingQueue {
    state: Mutex<QueueState>,
    ack_wait: Duration,
}

impl PollingQueue {
    /// Creates a queue whose unacked deliveries redeliver after `ack_wait`.
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ack_wait,
        }
    }

    /// Jobs currently ready for delivery.
    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// Deliveries awaiting an ack.
    pub fn inflight_len(&self) -> usize {
        self.state.lock().unwrap().inflight.len()
    }

    fn promote_due(&self, state: &mut QueueState, now: Instant) {
        let mut due = Vec::new();
        state.delayed.retain(|(when, priority, job_id)| {
            if *when <= now {
                due.push((*priority, *job_id));
                false
            } else {
                true
            }
        });
        for (priority, job_id) in due {
            state.push_ready(priority, job_id);
        }

        let expired: Vec<(Id, JobPriority)> = state
            .inflight
            .iter()
            .filter(|(_, d)| now.duration_since(d.delivered_at) >= self.ack_wait)
            .map(|(id, d)| (*id, d.priority))
            .collect();
        for (job_id, priority) in expired {
            state.inflight.remove(&job_id);
            state.push_ready(priority, job_id);
        }
    }
}

#[async_trait]
impl JobQueue for PollingQueue {
    async fn enqueue(&self, job_id: Id, priority: JobPriority) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.push_ready(priority, job_id);
        Ok(())
    }

    async fn consume(&self) -> Result<Option<Id>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        self.promote_due(&mut state, now);

        let next = state.ready.iter().next().copied();
        Ok(next.map(|(priority, seq, job_id)| {
            state.ready.remove(&(priority, seq, job_id));
            state.inflight.insert(
                job_id,
                Delivery {
                    delivered_at: now,
                    priority,
                },
            );
            job_id
        }))
    }

    async fn ack(&self, job_id: Id) -> Result<()> {
        self.state.lock().unwrap().inflight.remove(&job_id);
        Ok(())
    }

    async fn nak(&self, job_id: Id) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(delivery) = state.inflight.remove(&job_id) {
            state.push_ready(delivery.priority, job_id);
        }
        Ok(())
    }

    async fn nak_delay(&self, job_id: Id, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(delivery) = state.inflight.remove(&job_id) {
            state
                .delayed
                .push((Instant::now() + delay, delivery.priority, job_id));
        }
        Ok(())
    }
}
