//! In-process store used for previews and tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use netfence_common::resource_id::document_id;
use netfence_common::{ResourceDependencyInformation, Result, ServiceTag, Subscription};

use crate::store::{DependencyStore, OrganizationStore};

#[derive(Default)]
struct Collections {
    records: BTreeMap<String, ResourceDependencyInformation>,
    subscriptions: BTreeMap<String, Subscription>,
    tags: BTreeMap<String, ServiceTag>,
}

/// Same collections as [`crate::SqliteStore`], held in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filter(
        &self,
        keep: impl Fn(&ResourceDependencyInformation) -> bool,
    ) -> Vec<ResourceDependencyInformation> {
        self.inner
            .read()
            .await
            .records
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DependencyStore for MemoryStore {
    async fn upsert(&self, record: &ResourceDependencyInformation) -> Result<()> {
        self.inner
            .write()
            .await
            .records
            .insert(record.document_id(), record.clone());
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceDependencyInformation>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(&document_id(resource_id))
            .cloned())
    }

    async fn delete(&self, resource_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .records
            .remove(&document_id(resource_id))
            .is_some())
    }

    async fn get_all(&self) -> Result<Vec<ResourceDependencyInformation>> {
        Ok(self.filter(|_| true).await)
    }

    async fn get_first(&self) -> Result<Option<ResourceDependencyInformation>> {
        Ok(self.inner.read().await.records.values().next().cloned())
    }

    async fn get_configs_where_inbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        Ok(self.filter(|r| r.references_inbound(resource_id)).await)
    }

    async fn get_configs_where_outbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        Ok(self.filter(|r| r.references_outbound(resource_id)).await)
    }

    async fn find_by_tag_name(&self, tag: &str) -> Result<Vec<ResourceDependencyInformation>> {
        Ok(self.filter(|r| r.references_tag(tag)).await)
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.inner.read().await.subscriptions.values().cloned().collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(subscription.id.to_ascii_lowercase(), subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .subscriptions
            .remove(&id.to_ascii_lowercase())
            .is_some())
    }

    async fn list_tags(&self) -> Result<Vec<ServiceTag>> {
        Ok(self.inner.read().await.tags.values().cloned().collect())
    }

    async fn get_tag(&self, name: &str) -> Result<Option<ServiceTag>> {
        Ok(self
            .inner
            .read()
            .await
            .tags
            .get(&name.to_ascii_lowercase())
            .cloned())
    }

    async fn upsert_tag(&self, tag: &ServiceTag) -> Result<()> {
        self.inner
            .write()
            .await
            .tags
            .insert(tag.name.to_ascii_lowercase(), tag.clone());
        Ok(())
    }

    async fn delete_tag(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .tags
            .remove(&name.to_ascii_lowercase())
            .is_some())
    }
}
