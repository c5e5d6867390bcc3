//! Store contracts for dependency records and organization collections

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

use netfence_common::{
    OrganizationSettings, ResourceDependencyInformation, Result, ServiceTag, Subscription,
};

/// Dependency records keyed by the document id derived from the resource id.
///
/// Edges are plain resource-id strings inside the records; every query here is
/// one hop. Reads of missing records return `None`/empty, never an error.
#[async_trait]
pub trait DependencyStore: Send + Sync {
    /// Replace the record with the same document id, creating it if absent
    async fn upsert(&self, record: &ResourceDependencyInformation) -> Result<()>;

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceDependencyInformation>>;

    /// Returns false when there was nothing to delete
    async fn delete(&self, resource_id: &str) -> Result<bool>;

    async fn get_all(&self) -> Result<Vec<ResourceDependencyInformation>>;

    async fn get_first(&self) -> Result<Option<ResourceDependencyInformation>>;

    /// Records listing `resource_id` in their main or SCM inbound `resourceIds`
    async fn get_configs_where_inbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>>;

    /// Records listing `resource_id` in `allowOutbound.resourceIds`
    async fn get_configs_where_outbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>>;

    /// Records referencing an organization tag in their inbound restrictions
    async fn find_by_tag_name(&self, tag: &str) -> Result<Vec<ResourceDependencyInformation>>;

    /// Resource ids whose outbound list contains `resource_id`
    async fn get_resource_ids_where_outbound(&self, resource_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get_configs_where_outbound(resource_id)
            .await?
            .into_iter()
            .map(|r| r.resource_id)
            .collect())
    }

    /// Delete the record for `resource_id` and strip the id out of every other
    /// record. Returns the records that were rewritten. Deleting an id with no
    /// record is not an error.
    async fn remove_config_and_dependencies(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        if self.delete(resource_id).await? {
            info!("Deleted dependency record for {resource_id}");
        } else {
            debug!("No dependency record for {resource_id}, stripping references only");
        }

        let mut affected: BTreeMap<String, ResourceDependencyInformation> = BTreeMap::new();
        for record in self.get_configs_where_inbound(resource_id).await? {
            affected.insert(record.document_id(), record);
        }
        for record in self.get_configs_where_outbound(resource_id).await? {
            affected.entry(record.document_id()).or_insert(record);
        }

        let mut mutated = Vec::new();
        for (_, mut record) in affected {
            if record.strip_reference(resource_id) {
                self.upsert(&record).await?;
                mutated.push(record);
            }
        }

        info!(
            "Removed {resource_id} from {} dependent records",
            mutated.len()
        );
        Ok(mutated)
    }
}

/// Organization subscriptions and tags, each keyed by business key
#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn delete_subscription(&self, id: &str) -> Result<bool>;

    async fn list_tags(&self) -> Result<Vec<ServiceTag>>;

    /// Case-insensitive lookup by tag name
    async fn get_tag(&self, name: &str) -> Result<Option<ServiceTag>>;

    async fn upsert_tag(&self, tag: &ServiceTag) -> Result<()>;

    async fn delete_tag(&self, name: &str) -> Result<bool>;

    async fn subscription_name(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .list_subscriptions()
            .await?
            .into_iter()
            .find(|s| s.id.eq_ignore_ascii_case(id))
            .map(|s| s.name))
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.list_tags().await?.is_empty() && self.list_subscriptions().await?.is_empty())
    }

    /// Load `settings` when the store holds nothing yet. Returns whether it seeded.
    async fn seed_if_empty(&self, settings: &OrganizationSettings) -> Result<bool> {
        if !self.is_empty().await? {
            return Ok(false);
        }
        for subscription in &settings.subscriptions {
            self.upsert_subscription(subscription).await?;
        }
        for tag in &settings.tags {
            self.upsert_tag(tag).await?;
        }
        info!(
            "Seeded organization store with {} subscriptions and {} tags",
            settings.subscriptions.len(),
            settings.tags.len()
        );
        Ok(true)
    }
}
