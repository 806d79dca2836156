//! Sliding-window download rate limits over the atomic KV store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ngasihtau_core::config::Limits;
use ngasihtau_core::error::Result;
use ngasihtau_core::id::Id;
use ngasihtau_core::kv::Kv;

/// Outcome of a download rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCheck {
    /// Whether the download may proceed.
    pub allowed: bool,
    /// Checks left in the tighter of the two windows.
    pub remaining: u32,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterStats {
    /// Checks that passed.
    pub allowed: u64,
    /// Checks that were rejected.
    pub rejected: u64,
}

/// Enforces the per-user and per-material download caps. Limits are
/// independent across user ids and across material ids.
pub struct DownloadRateLimiter {
    kv: Arc<dyn Kv>,
    window: Duration,
    user_cap: u32,
    material_cap: u32,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl DownloadRateLimiter {
    /// Builds a limiter from the configured limits.
    pub fn new(kv: Arc<dyn Kv>, limits: &Limits) -> Self {
        Self {
            kv,
            window: limits.rate_limit_window,
            user_cap: limits.max_downloads_per_hour,
            material_cap: limits.max_material_downloads_per_hour,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Counts this check against both windows and reports whether the
    /// download may proceed.
    pub async fn download_check(&self, user_id: Id, material_id: Id) -> Result<DownloadCheck> {
        let user_count = self
            .kv
            .incr(&format!("rl:dl:user:{user_id}"), self.window)
            .await?;
        let material_count = self
            .kv
            .incr(&format!("rl:dl:material:{material_id}"), self.window)
            .await?;

        let user_remaining = u64::from(self.user_cap).saturating_sub(user_count);
        let material_remaining = u64::from(self.material_cap).saturating_sub(material_count);
        let allowed =
            user_count <= u64::from(self.user_cap) && material_count <= u64::from(self.material_cap);

        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%user_id, %material_id, "download rate limit exhausted");
        }
        Ok(DownloadCheck {
            allowed,
            remaining: user_remaining.min(material_remaining) as u32,
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
