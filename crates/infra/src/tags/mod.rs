//! Per-tenant vendor tag storage.
//!
//! Tags share the metadata store with job rows but have no lifecycle link to
//! any job. Vendor names arrive here already normalized.

mod sqlite;

pub use sqlite::SqliteVendorTagStore;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use wallettaser_core::{TenantId, VendorTag};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TagStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait VendorTagStore: Send + Sync {
    /// Insert or replace the tag for `tag.vendor`.
    async fn upsert(&self, tenant_id: &TenantId, tag: &VendorTag) -> Result<(), TagStoreError>;

    async fn get(
        &self,
        tenant_id: &TenantId,
        vendor: &str,
    ) -> Result<Option<VendorTag>, TagStoreError>;

    /// All tags of a tenant, sorted by vendor.
    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<VendorTag>, TagStoreError>;

    /// Returns whether a tag was removed.
    async fn delete(&self, tenant_id: &TenantId, vendor: &str) -> Result<bool, TagStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVendorTagStore {
    tags: RwLock<BTreeMap<(TenantId, String), VendorTag>>,
}

impl InMemoryVendorTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> TagStoreError {
    TagStoreError::Storage("vendor tag lock poisoned".to_string())
}

#[async_trait]
impl VendorTagStore for InMemoryVendorTagStore {
    async fn upsert(&self, tenant_id: &TenantId, tag: &VendorTag) -> Result<(), TagStoreError> {
        let mut tags = self.tags.write().map_err(poisoned)?;
        tags.insert((tenant_id.clone(), tag.vendor.clone()), tag.clone());
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        vendor: &str,
    ) -> Result<Option<VendorTag>, TagStoreError> {
        let tags = self.tags.read().map_err(poisoned)?;
        Ok(tags.get(&(tenant_id.clone(), vendor.to_string())).cloned())
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<VendorTag>, TagStoreError> {
        let tags = self.tags.read().map_err(poisoned)?;
        Ok(tags
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, tag)| tag.clone())
            .collect())
    }

    async fn delete(&self, tenant_id: &TenantId, vendor: &str) -> Result<bool, TagStoreError> {
        let mut tags = self.tags.write().map_err(poisoned)?;
        Ok(tags.remove(&(tenant_id.clone(), vendor.to_string())).is_some())
    }
}
