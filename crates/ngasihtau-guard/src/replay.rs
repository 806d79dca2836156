//! Single-use request nonces backed by the atomic KV store.

use std::sync::Arc;
use std::time::Duration;

use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::kv::Kv;

/// Records request nonces with SET-IF-NOT-EXISTS semantics so that a nonce
/// is accepted exactly once per replay window.
pub struct ReplayGuard {
    kv: Arc<dyn Kv>,
    window: Duration,
}

impl ReplayGuard {
    /// Creates a guard with the given nonce TTL.
    pub fn new(kv: Arc<dyn Kv>, window: Duration) -> Self {
        Self { kv, window }
    }

    /// Registers a nonce after the signature has been verified. A nonce
    /// already live in the store rejects as [`ProtectionError::ReplayAttack`].
    pub async fn register_nonce(&self, nonce: &str) -> Result<()> {
        let fresh = self.kv.setnx(&nonce_key(nonce), self.window).await?;
        if fresh {
            Ok(())
        } else {
            tracing::warn!("replayed request nonce rejected");
            Err(ProtectionError::ReplayAttack)
        }
    }
}

fn nonce_key(nonce: &str) -> String {
    format!("replay:{nonce}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngasihtau_core::error::ErrorKind;
    use ngasihtau_core::kv::InMemoryKv;

    #[tokio::test]
    async fn test_first_use_passes_second_rejects() {
        let kv = Arc::new(InMemoryKv::new());
        let guard = ReplayGuard::new(kv, Duration::from_secs(300));
        guard.register_nonce("n-1").await.unwrap();
        let err = guard.register_nonce("n-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayAttack);
    }

    #[tokio::test]
    async fn test_distinct_nonces_pass() {
        let kv = Arc::new(InMemoryKv::new());
        let guard = ReplayGuard::new(kv, Duration::from_secs(300));
        guard.register_nonce("n-1").await.unwrap();
        guard.register_nonce("n-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_nonce_usable_again_after_window() {
        let kv = Arc::new(InMemoryKv::new());
        let guard = ReplayGuard::new(kv.clone(), Duration::from_secs(300));
        guard.register_nonce("n-1").await.unwrap();
        kv.advance(Duration::from_secs(301));
        guard.register_nonce("n-1").await.unwrap();
    }
}
