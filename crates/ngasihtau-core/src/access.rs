//! Material catalog / entitlement port.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::id::Id;

/// Storage location and declared type of a material's source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialFile {
    /// Object-storage key of the plaintext source.
    pub storage_key: String,
    /// Declared file type (e.g. `pdf`).
    pub file_type: String,
}

/// Entitlement and catalog lookups consumed from the platform.
#[async_trait]
pub trait MaterialAccessChecker: Send + Sync {
    /// Whether the user is entitled to the material.
    async fn has_access(&self, user_id: Id, material_id: Id) -> Result<bool>;

    /// Source-file location of a material, `None` when unknown.
    async fn file_key(&self, material_id: Id) -> Result<Option<MaterialFile>>;
}

/// Static checker for tests and single-process wiring.
#[derive(Default)]
pub struct StaticAccessChecker {
    grants: Mutex<HashSet<(Id, Id)>>,
    files: Mutex<HashMap<Id, MaterialFile>>,
    allow_all: bool,
}

impl StaticAccessChecker {
    /// Creates a checker that denies everything by default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a checker that grants every (user, material) pair.
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Self::default()
        }
    }

    /// Grants one (user, material) pair.
    pub fn grant(&self, user_id: Id, material_id: Id) {
        self.grants.lock().unwrap().insert((user_id, material_id));
    }

    /// Registers the source file of a material.
    pub fn set_file(&self, material_id: Id, storage_key: &str, file_type: &str) {
        self.files.lock().unwrap().insert(
            material_id,
            MaterialFile {
                storage_key: storage_key.to_string(),
                file_type: file_type.to_string(),
            },
        );
    }
}

#[async_trait]
impl MaterialAccessChecker for StaticAccessChecker {
    async fn has_access(&self, user_id: Id, material_id: Id) -> Result<bool> {
        if self.allow_all {
            return Ok(true);
        }
        Ok(self.grants.lock().unwrap().contains(&(user_id, material_id)))
    }

    async fn file_key(&self, material_id: Id) -> Result<Option<MaterialFile>> {
        Ok(self.files.lock().unwrap().get(&material_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denies_by_default() {
        let checker = StaticAccessChecker::new();
        assert!(!checker
            .has_access(Id::generate(), Id::generate())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_grant_is_pair_specific() {
        let checker = StaticAccessChecker::new();
        let (user, material) = (Id::generate(), Id::generate());
        checker.grant(user, material);
        assert!(checker.has_access(user, material).await.unwrap());
        assert!(!checker.has_access(user, Id::generate()).await.unwrap());
        assert!(!checker.has_access(Id::generate(), material).await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_all() {
        let checker = StaticAccessChecker::allow_all();
        assert!(checker
            .has_access(Id::generate(), Id::generate())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_key_lookup() {
        let checker = StaticAccessChecker::new();
        let material = Id::generate();
        assert!(checker.file_key(material).await.unwrap().is_none());
        checker.set_file(material, "materials/source.pdf", "pdf");
        let file = checker.file_key(material).await.unwrap().unwrap();
        assert_eq!(file.storage_key, "materials/source.pdf");
        assert_eq!(file.file_type, "pdf");
    }
}
