//! Resource metadata lookup through Resource Graph
//!
//! Ids are looked up in batches of [`ID_CHUNK`]; every query pages with
//! `$skipToken` until the service stops returning one.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use netfence_access::RestApi;
use netfence_common::{resource_id, Result};

use crate::kinds::ResourceKind;

const RESOURCE_GRAPH_API_VERSION: &str = "2021-03-01";
pub const ID_CHUNK: usize = 100;

/// One row of a Resource Graph `Resources` query
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub properties: Value,
}

impl ResourceMetadata {
    pub fn kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_type(&self.resource_type)
    }

    /// String property at a `/`-separated path below `properties`
    pub fn property_str(&self, path: &str) -> Option<&str> {
        path.split('/')
            .try_fold(&self.properties, |node, key| node.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubnetInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[async_trait]
pub trait ResourceInventory: Send + Sync {
    /// Live metadata for the given ids. Ids that do not exist are absent from the result.
    async fn resources_by_ids(&self, ids: &[String]) -> Result<Vec<ResourceMetadata>>;

    /// Every subnet of every virtual network in a subscription
    async fn subnets(&self, subscription_id: &str) -> Result<Vec<SubnetInfo>>;

    /// Deployment slot ids of a web site
    async fn slots(&self, site_id: &str) -> Result<Vec<String>>;
}

#[derive(Deserialize)]
struct QueryPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(rename = "$skipToken", default)]
    skip_token: Option<String>,
}

#[derive(Deserialize)]
struct IdRow {
    id: String,
}

/// Resource Graph backed inventory
pub struct ResourceGraphInventory {
    rest: Arc<dyn RestApi>,
    endpoint: String,
}

impl ResourceGraphInventory {
    pub fn new(rest: Arc<dyn RestApi>, management_endpoint: &str) -> Self {
        Self {
            rest,
            endpoint: management_endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/providers/Microsoft.ResourceGraph/resources?api-version={RESOURCE_GRAPH_API_VERSION}",
            self.endpoint
        )
    }

    async fn query<T>(&self, query: &str, subscriptions: Option<&[String]>) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut rows = Vec::new();
        let mut skip_token: Option<String> = None;

        loop {
            let mut body = json!({ "query": query, "options": {} });
            if let Some(subs) = subscriptions {
                body["subscriptions"] = json!(subs);
            }
            if let Some(token) = &skip_token {
                body["options"]["$skipToken"] = json!(token);
            }

            let value = self.rest.post(&self.url(), body).await?;
            let page: QueryPage<T> = serde_json::from_value(value)?;
            rows.extend(page.data);

            match page.skip_token.filter(|t| !t.is_empty()) {
                Some(token) => skip_token = Some(token),
                None => break,
            }
        }
        Ok(rows)
    }
}

/// KQL string literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub(crate) fn by_ids_query(ids: &[String]) -> String {
    let list = ids
        .iter()
        .map(|id| quote(id.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Resources | where id in~ ({list}) \
         | project id, name, type, subscriptionId, resourceGroup, properties"
    )
}

pub(crate) fn subnets_query() -> String {
    "Resources | where type =~ 'microsoft.network/virtualnetworks' \
     | mv-expand subnet = properties.subnets \
     | project id = tostring(subnet.id), name = tostring(subnet.name)"
        .to_string()
}

pub(crate) fn slots_query(site_id: &str) -> String {
    format!(
        "Resources | where type =~ 'microsoft.web/sites/slots' and id startswith {} | project id",
        quote(&format!("{}/slots/", site_id.trim()))
    )
}

#[async_trait]
impl ResourceInventory for ResourceGraphInventory {
    async fn resources_by_ids(&self, ids: &[String]) -> Result<Vec<ResourceMetadata>> {
        let mut found = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let rows: Vec<ResourceMetadata> = self.query(&by_ids_query(chunk), None).await?;
            debug!("Resource Graph resolved {} of {} ids", rows.len(), chunk.len());
            found.extend(rows);
        }
        Ok(found)
    }

    async fn subnets(&self, subscription_id: &str) -> Result<Vec<SubnetInfo>> {
        let subs = vec![subscription_id.to_string()];
        let rows: Vec<SubnetInfo> = self.query(&subnets_query(), Some(&subs)).await?;
        Ok(rows.into_iter().filter(|s| !s.id.is_empty()).collect())
    }

    async fn slots(&self, site_id: &str) -> Result<Vec<String>> {
        let subs = vec![resource_id::subscription_id(site_id)?];
        let rows: Vec<IdRow> = self.query(&slots_query(site_id), Some(&subs)).await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}
