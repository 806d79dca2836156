//! Per-device validation-failure tracking with automatic blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use ngasihtau_core::config::Limits;
use ngasihtau_core::error::Result;
use ngasihtau_core::id::Id;
use ngasihtau_core::kv::Kv;

/// Tracks validation failures per device and blocks a device once the
/// failure cap is reached inside one window. Blocks expire on their own TTL
/// or via [`FailureTracker::unblock`].
pub struct FailureTracker {
    kv: Arc<dyn Kv>,
    window: Duration,
    max_failures: u32,
    block_duration: Duration,
    blocks_applied: AtomicU64,
}

impl FailureTracker {
    /// Builds a tracker from the configured limits.
    pub fn new(kv: Arc<dyn Kv>, limits: &Limits) -> Self {
        Self {
            kv,
            window: limits.rate_limit_window,
            max_failures: limits.max_validation_failures_per_hour,
            block_duration: limits.device_block_duration,
            blocks_applied: AtomicU64::new(0),
        }
    }

    /// Records one validation failure. Returns true when this failure
    /// tripped the cap and the device is now blocked.
    pub async fn record_failure(&self, device_id: Id) -> Result<bool> {
        let count = self
            .kv
            .incr(&failure_key(device_id), self.window)
            .await?;
        if count >= u64::from(self.max_failures) {
            self.kv
                .setnx(&block_key(device_id), self.block_duration)
                .await?;
            self.blocks_applied.fetch_add(1, Ordering::Relaxed);
            warn!(%device_id, failures = count, "device blocked after repeated validation failures");
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether a live block exists for the device.
    pub async fn is_blocked(&self, device_id: Id) -> Result<bool> {
        Ok(self.kv.get(&block_key(device_id)).await?.is_some())
    }

    /// Current failure count inside the live window.
    pub async fn failure_count(&self, device_id: Id) -> Result<u64> {
        Ok(self
            .kv
            .get(&failure_key(device_id))
            .await?
            .unwrap_or(0))
    }

    /// Clears the block and resets the failure counter.
    pub async fn unblock(&self, device_id: Id) -> Result<()> {
        self.kv.del(&block_key(device_id)).await?;
        self.kv.del(&failure_key(device_id)).await?;
        Ok(())
    }

    /// How many blocks this tracker has applied.
    pub fn blocks_applied(&self) -> u64 {
        self.blocks_applied.load(Ordering::Relaxed)
    }
}

fn failure_key(device_id: Id) -> String {
    format!("vf:device:{device_id}")
}

fn block_key(device_id: Id) -> String {
    format!("block:device:{device_id}")
}
