//! In-process fakes for the engine's seams

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netfence_access::{Method, RestApi};
use netfence_common::{resource_id, FenceError, ResourceDependencyInformation, Result};
use netfence_graph::{DependencyStore, MemoryStore};

use crate::appliers::ApplierRegistry;
use crate::config::NetfenceConfig;
use crate::coordinator::Coordinator;
use crate::inventory::{ResourceInventory, ResourceMetadata, SubnetInfo};
use crate::kinds::ResourceKind;
use crate::rules::RuleEngine;
use crate::tags::{CloudServiceTag, CloudTagResolver, CloudTagSource, OrgTagResolver};
use crate::validation::Validator;

pub const MGMT: &str = "https://management.azure.com";
pub const SUB1: &str = "11111111-1111-1111-1111-111111111111";
pub const SITE1: &str = "/subscriptions/11111111-1111-1111-1111-111111111111/resourceGroups/rg-web/providers/Microsoft.Web/sites/app1";
pub const SITE2: &str = "/subscriptions/11111111-1111-1111-1111-111111111111/resourceGroups/rg-web/providers/Microsoft.Web/sites/app2";
pub const SITE3: &str = "/subscriptions/11111111-1111-1111-1111-111111111111/resourceGroups/rg-web/providers/Microsoft.Web/sites/app3";
pub const PIP1: &str = "/subscriptions/11111111-1111-1111-1111-111111111111/resourceGroups/rg-net/providers/Microsoft.Network/publicIPAddresses/pip1";
pub const PIP2: &str = "/subscriptions/11111111-1111-1111-1111-111111111111/resourceGroups/rg-net/providers/Microsoft.Network/publicIPAddresses/pip2";

pub fn record(resource_id: &str) -> ResourceDependencyInformation {
    ResourceDependencyInformation::new(resource_id)
}

type Call = (Method, String, Option<Value>);

/// Management API double keyed by lower-cased path. GET reads, PUT replaces,
/// PATCH merges objects, DELETE removes. Child collections list their members.
#[derive(Default)]
pub struct FakeRest {
    docs: Mutex<HashMap<String, (String, Value)>>,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<Vec<String>>,
}

const COLLECTIONS: &[&str] = &["/firewallrules", "/virtualnetworkrules"];

fn path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn key(url: &str) -> String {
    path(url).to_ascii_lowercase()
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                merge(target.entry(k).or_insert(Value::Null), v);
            }
        }
        (target, patch) => *target = patch,
    }
}

impl FakeRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, url: &str, value: Value) {
        self.docs
            .lock()
            .unwrap()
            .insert(key(url), (path(url).to_string(), value));
    }

    pub fn doc(&self, url: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(&key(url)).map(|(_, v)| v.clone())
    }

    /// Writes to any url containing `fragment` fail with a 500
    pub fn fail_writes_to(&self, fragment: &str) {
        self.failing.lock().unwrap().push(fragment.to_ascii_lowercase());
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| *m != Method::Get)
            .cloned()
            .collect()
    }

    pub fn writes_to(&self, fragment: &str) -> usize {
        let fragment = fragment.to_ascii_lowercase();
        self.writes()
            .iter()
            .filter(|(_, url, _)| key(url).contains(&fragment))
            .count()
    }

    fn list(&self, collection: &str) -> Value {
        let prefix = format!("{collection}/");
        let docs = self.docs.lock().unwrap();
        let mut members: Vec<(String, Value)> = docs
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
            .map(|(_, (original, value))| {
                let name = original.rsplit('/').next().unwrap_or_default().to_string();
                let mut value = value.clone();
                value["name"] = json!(name);
                (name, value)
            })
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        json!({ "value": members.into_iter().map(|(_, v)| v).collect::<Vec<_>>() })
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn send(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method, url.to_string(), body.clone()));
        let k = key(url);

        if method != Method::Get
            && self.failing.lock().unwrap().iter().any(|f| k.contains(f.as_str()))
        {
            return Err(FenceError::Http {
                url: url.to_string(),
                status: 500,
                body: "injected failure".into(),
            });
        }

        match method {
            Method::Get => {
                if let Some((_, value)) = self.docs.lock().unwrap().get(&k) {
                    return Ok(value.clone());
                }
                if COLLECTIONS.iter().any(|c| k.ends_with(c)) {
                    return Ok(self.list(&k));
                }
                Err(FenceError::not_found(url))
            }
            Method::Put => {
                let value = body.unwrap_or(Value::Null);
                self.docs
                    .lock()
                    .unwrap()
                    .insert(k, (path(url).to_string(), value.clone()));
                Ok(value)
            }
            Method::Patch => {
                let mut docs = self.docs.lock().unwrap();
                let entry = docs
                    .entry(k)
                    .or_insert_with(|| (path(url).to_string(), json!({})));
                merge(&mut entry.1, body.unwrap_or(Value::Null));
                Ok(entry.1.clone())
            }
            Method::Delete => {
                self.docs.lock().unwrap().remove(&k);
                Ok(Value::Null)
            }
            Method::Post => Ok(Value::Null),
        }
    }
}

/// Resource Graph double
#[derive(Default)]
pub struct FakeInventory {
    resources: Mutex<Vec<ResourceMetadata>>,
    subnets: Mutex<Vec<SubnetInfo>>,
    slots: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeInventory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, properties: Value) {
        self.resources.lock().unwrap().push(ResourceMetadata {
            id: id.to_string(),
            name: resource_id::resource_name(id).unwrap(),
            resource_type: resource_id::resource_type(id).unwrap(),
            subscription_id: resource_id::subscription_id(id).unwrap(),
            resource_group: resource_id::resource_group(id).unwrap(),
            properties,
        });
    }

    pub fn add_subnet(&self, id: &str) {
        self.subnets.lock().unwrap().push(SubnetInfo {
            id: id.to_string(),
            name: resource_id::resource_name(id).unwrap(),
        });
    }

    pub fn add_slot(&self, site: &str, slot: &str) {
        self.slots
            .lock()
            .unwrap()
            .entry(site.to_ascii_lowercase())
            .or_default()
            .push(slot.to_string());
    }
}

#[async_trait]
impl ResourceInventory for FakeInventory {
    async fn resources_by_ids(&self, ids: &[String]) -> Result<Vec<ResourceMetadata>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|r| ids.iter().any(|id| resource_id::same_id(id, &r.id)))
            .cloned()
            .collect())
    }

    async fn subnets(&self, subscription_id: &str) -> Result<Vec<SubnetInfo>> {
        Ok(self
            .subnets
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                resource_id::subscription_id(&s.id)
                    .is_ok_and(|sub| sub.eq_ignore_ascii_case(subscription_id))
            })
            .cloned()
            .collect())
    }

    async fn slots(&self, site_id: &str) -> Result<Vec<String>> {
        Ok(self
            .slots
            .lock()
            .unwrap()
            .get(&site_id.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

/// Published service-tag document double
#[derive(Default)]
pub struct FakeCloudTags {
    tags: Mutex<Vec<CloudServiceTag>>,
    fetches: AtomicUsize,
}

impl FakeCloudTags {
    pub fn new(tags: Vec<CloudServiceTag>) -> Arc<Self> {
        let fake = Self::default();
        *fake.tags.lock().unwrap() = tags;
        Arc::new(fake)
    }

    pub fn set(&self, tags: Vec<CloudServiceTag>) {
        *self.tags.lock().unwrap() = tags;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudTagSource for FakeCloudTags {
    async fn fetch(&self) -> Result<Vec<CloudServiceTag>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.tags.lock().unwrap().clone())
    }
}

/// Memory store whose writes can be switched off
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl DependencyStore for FailingStore {
    async fn upsert(&self, _record: &ResourceDependencyInformation) -> Result<()> {
        Err(FenceError::Store("database is read-only".into()))
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceDependencyInformation>> {
        self.inner.get(resource_id).await
    }

    async fn delete(&self, _resource_id: &str) -> Result<bool> {
        Err(FenceError::Store("database is read-only".into()))
    }

    async fn get_all(&self) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_all().await
    }

    async fn get_first(&self) -> Result<Option<ResourceDependencyInformation>> {
        self.inner.get_first().await
    }

    async fn get_configs_where_inbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_configs_where_inbound(resource_id).await
    }

    async fn get_configs_where_outbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_configs_where_outbound(resource_id).await
    }

    async fn find_by_tag_name(&self, tag: &str) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.find_by_tag_name(tag).await
    }
}

/// Memory store that counts tag-index lookups
#[derive(Default)]
pub struct TagIndexStore {
    pub inner: MemoryStore,
    tag_queries: AtomicUsize,
}

impl TagIndexStore {
    pub fn tag_queries(&self) -> usize {
        self.tag_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyStore for TagIndexStore {
    async fn upsert(&self, record: &ResourceDependencyInformation) -> Result<()> {
        self.inner.upsert(record).await
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceDependencyInformation>> {
        self.inner.get(resource_id).await
    }

    async fn delete(&self, resource_id: &str) -> Result<bool> {
        self.inner.delete(resource_id).await
    }

    async fn get_all(&self) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_all().await
    }

    async fn get_first(&self) -> Result<Option<ResourceDependencyInformation>> {
        self.inner.get_first().await
    }

    async fn get_configs_where_inbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_configs_where_inbound(resource_id).await
    }

    async fn get_configs_where_outbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.inner.get_configs_where_outbound(resource_id).await
    }

    async fn find_by_tag_name(&self, tag: &str) -> Result<Vec<ResourceDependencyInformation>> {
        self.tag_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_tag_name(tag).await
    }
}

/// Engine wired to fakes
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub rest: Arc<FakeRest>,
    pub inventory: Arc<FakeInventory>,
    pub cloud: Arc<FakeCloudTags>,
    pub config: NetfenceConfig,
}

impl Harness {
    /// Defaults without per-kind default tags
    pub fn default_config() -> NetfenceConfig {
        let mut config = NetfenceConfig::default();
        config.tags.default_main_tags.clear();
        config.tags.default_scm_tags.clear();
        config
    }

    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    pub fn with_config(config: NetfenceConfig) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            rest: FakeRest::new(),
            inventory: FakeInventory::new(),
            cloud: FakeCloudTags::new(Vec::new()),
            config,
        }
    }

    fn cloud_resolver(&self) -> Arc<CloudTagResolver> {
        Arc::new(CloudTagResolver::new(self.cloud.clone(), Duration::from_secs(60)))
    }

    fn org_resolver(&self) -> Arc<OrgTagResolver> {
        Arc::new(OrgTagResolver::new(self.store.clone()))
    }

    pub fn engine_with(&self, store: Arc<dyn DependencyStore>) -> RuleEngine {
        RuleEngine::new(
            store,
            self.inventory.clone(),
            self.cloud_resolver(),
            self.org_resolver(),
            Arc::new(ApplierRegistry::new(self.rest.clone(), MGMT)),
            &self.config,
        )
    }

    pub fn engine(&self) -> RuleEngine {
        self.engine_with(self.store.clone())
    }

    pub fn validator(&self) -> Validator {
        Validator::new(
            self.cloud_resolver(),
            self.org_resolver(),
            self.config.policy.clone(),
        )
        .unwrap()
    }

    pub fn coordinator_with(&self, store: Arc<dyn DependencyStore>) -> Coordinator {
        Coordinator::new(
            store.clone(),
            Arc::new(self.engine_with(store)),
            Arc::new(self.validator()),
            self.config.service.fan_out_concurrency,
        )
    }

    pub fn coordinator(&self) -> Coordinator {
        self.coordinator_with(self.store.clone())
    }

    /// Report `resource_id` as provisioned
    pub fn ready(&self, resource_id: &str) {
        let kind = ResourceKind::from_resource_id(resource_id).unwrap();
        self.rest.seed(
            &format!("{MGMT}{resource_id}?api-version={}", kind.api_version()),
            json!({"properties": {"provisioningState": "Succeeded"}}),
        );
    }
}
