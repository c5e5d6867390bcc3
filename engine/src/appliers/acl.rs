//! Network-ACL style firewalls shared by Storage, Key Vault and Cosmos DB
//!
//! All three keep an IP rule list and a subnet rule list on the resource
//! itself and are written with a single PATCH. They differ only in where the
//! lists live, how entries are spelled and how many entries are allowed.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use netfence_access::RestApi;
use netfence_common::{
    IpSecurityRestrictionRule, NetworkRestrictionSettings, Result, ResultObject, RuleSet,
};

use super::{arm_url, check_provisioning, ensure_capacity, RestrictionApplier};
use crate::kinds::ResourceKind;

#[derive(Debug)]
pub struct AclLayout {
    pub kind: ResourceKind,
    /// Object under `properties` holding the lists; `None` means `properties` itself
    pub container: Option<&'static str>,
    pub ip_field: &'static str,
    /// Entries carry an explicit `"action": "Allow"`
    pub with_action: bool,
    /// Provider rejects `/32`; single hosts are written as bare addresses
    pub bare_hosts: bool,
    pub ip_limit: usize,
    pub subnet_limit: usize,
    pub check_provisioning: bool,
}

pub const STORAGE: AclLayout = AclLayout {
    kind: ResourceKind::Storage,
    container: Some("networkAcls"),
    ip_field: "value",
    with_action: true,
    bare_hosts: true,
    ip_limit: 200,
    subnet_limit: 200,
    check_provisioning: true,
};

pub const KEY_VAULT: AclLayout = AclLayout {
    kind: ResourceKind::KeyVault,
    container: Some("networkAcls"),
    ip_field: "value",
    with_action: false,
    bare_hosts: false,
    ip_limit: 1000,
    subnet_limit: 200,
    check_provisioning: true,
};

/// Cosmos DB accounts report transient provisioning states for long periods
/// and accept writes regardless, so the readiness check is skipped.
pub const COSMOS_DB: AclLayout = AclLayout {
    kind: ResourceKind::CosmosDb,
    container: None,
    ip_field: "ipAddressOrRange",
    with_action: false,
    bare_hosts: false,
    ip_limit: 1000,
    subnet_limit: 200,
    check_provisioning: false,
};

struct Entries {
    ips: Vec<Value>,
    subnets: Vec<Value>,
    skipped: Vec<String>,
}

pub struct AclApplier {
    layout: &'static AclLayout,
    rest: Arc<dyn RestApi>,
    endpoint: String,
}

impl AclApplier {
    pub fn new(layout: &'static AclLayout, rest: Arc<dyn RestApi>, management_endpoint: &str) -> Self {
        Self {
            layout,
            rest,
            endpoint: management_endpoint.to_string(),
        }
    }

    fn url(&self, resource_id: &str) -> String {
        arm_url(&self.endpoint, resource_id, "", self.layout.kind.api_version())
    }

    fn ip_value(&self, address: &str) -> String {
        match address.strip_suffix("/32") {
            Some(host) if self.layout.bare_hosts => host.to_string(),
            _ => address.to_string(),
        }
    }

    fn entries(&self, rules: &RuleSet) -> Entries {
        let mut entries = Entries {
            ips: Vec::new(),
            subnets: Vec::new(),
            skipped: Vec::new(),
        };
        for rule in rules.iter() {
            if let Some(subnet) = rule.vnet_subnet_resource_id.as_deref().filter(|_| rule.is_subnet()) {
                let mut entry = json!({ "id": subnet });
                if self.layout.with_action {
                    entry["action"] = json!("Allow");
                }
                entries.subnets.push(entry);
            } else if rule.is_service_tag() {
                entries
                    .skipped
                    .push(rule.ip_address.clone().unwrap_or_else(|| rule.name.clone()));
            } else if let Some(ip) = rule.ip_address.as_deref() {
                let mut entry = Map::new();
                entry.insert(self.layout.ip_field.to_string(), json!(self.ip_value(ip)));
                if self.layout.with_action {
                    entry.insert("action".into(), json!("Allow"));
                }
                entries.ips.push(Value::Object(entry));
            }
        }
        entries
    }

    fn acl<'a>(&self, resource: &'a Value) -> Option<&'a Value> {
        let properties = resource.get("properties")?;
        match self.layout.container {
            Some(container) => properties.get(container),
            None => Some(properties),
        }
    }

    fn live_rules(&self, resource: &Value) -> RuleSet {
        let mut rules = RuleSet::new();
        let Some(acl) = self.acl(resource) else {
            return rules;
        };
        let list = |field: &str| {
            acl.get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        for entry in list("ipRules") {
            if let Some(ip) = entry.get(self.layout.ip_field).and_then(Value::as_str) {
                rules.insert(IpSecurityRestrictionRule::for_address(ip, ""));
            }
        }
        for entry in list("virtualNetworkRules") {
            if let Some(id) = entry.get("id").and_then(Value::as_str) {
                rules.insert(IpSecurityRestrictionRule::for_subnet(id, ""));
            }
        }
        rules
    }

    /// PATCH body. `live` is the current resource for append, where the
    /// default action and bypass of a resource we do not own stay as they are.
    fn body(&self, entries: &Entries, live: Option<&Value>) -> Value {
        let mut lists = Map::new();
        lists.insert("ipRules".into(), json!(entries.ips));
        lists.insert("virtualNetworkRules".into(), json!(entries.subnets));

        match self.layout.container {
            Some(container) => {
                let mut acl = live
                    .and_then(|l| self.acl(l))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut fresh = Map::new();
                        fresh.insert("bypass".into(), json!("AzureServices"));
                        fresh
                    });
                if live.is_none() {
                    acl.insert("defaultAction".into(), json!("Deny"));
                }
                acl.extend(lists);
                json!({ "properties": { container: acl } })
            }
            None => {
                if live.is_none() || !entries.subnets.is_empty() {
                    lists.insert(
                        "isVirtualNetworkFilterEnabled".into(),
                        json!(!entries.subnets.is_empty()),
                    );
                }
                json!({ "properties": lists })
            }
        }
    }

    fn check_limits(&self, resource_id: &str, entries: &Entries) -> Result<()> {
        ensure_capacity(resource_id, entries.ips.len(), self.layout.ip_limit)?;
        ensure_capacity(resource_id, entries.subnets.len(), self.layout.subnet_limit)
    }

    fn report(&self, resource_id: &str, entries: &Entries, result: &mut ResultObject) {
        for skipped in &entries.skipped {
            result.warning(format!(
                "{resource_id}: service tag rule {skipped} cannot be expressed on {}",
                self.layout.kind.type_name()
            ));
        }
        result.info(format!(
            "{resource_id}: {} ip rules and {} subnet rules in place",
            entries.ips.len(),
            entries.subnets.len()
        ));
    }
}

#[async_trait]
impl RestrictionApplier for AclApplier {
    fn kind(&self) -> ResourceKind {
        self.layout.kind
    }

    async fn overwrite(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        let entries = self.entries(&settings.main);
        self.check_limits(&settings.resource_id, &entries)?;

        self.rest
            .patch(&self.url(&settings.resource_id), self.body(&entries, None))
            .await?;
        info!(
            "Overwrote {} network ACLs: {} ip, {} subnet",
            settings.resource_id,
            entries.ips.len(),
            entries.subnets.len()
        );

        let mut result = ResultObject::new();
        self.report(&settings.resource_id, &entries, &mut result);
        Ok(result)
    }

    async fn append(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        let url = self.url(&settings.resource_id);
        let live = self.rest.get(&url).await?;
        let current = self.live_rules(&live);

        let mut merged = current.clone();
        merged.merge(settings.main.clone());
        if let Some(delete) = &settings.main_delete {
            merged.subtract(delete);
        }

        let mut result = ResultObject::new();
        let entries = self.entries(&merged);
        let changed = merged.iter().any(|r| !current.contains(r) && !r.is_service_tag())
            || current.iter().any(|r| !merged.contains(r));
        if !changed {
            for skipped in &entries.skipped {
                result.warning(format!(
                    "{}: service tag rule {skipped} cannot be expressed on {}",
                    settings.resource_id,
                    self.layout.kind.type_name()
                ));
            }
            result.info(format!("{}: rules already present", settings.resource_id));
            return Ok(result);
        }

        self.check_limits(&settings.resource_id, &entries)?;
        self.rest.patch(&url, self.body(&entries, Some(&live))).await?;
        info!(
            "Appended to {} network ACLs: {} -> {} rules",
            settings.resource_id,
            current.len(),
            merged.len()
        );
        self.report(&settings.resource_id, &entries, &mut result);
        Ok(result)
    }

    async fn check_provisioning_state(&self, resource_id: &str) -> Result<()> {
        if !self.layout.check_provisioning {
            return Ok(());
        }
        check_provisioning(self.rest.as_ref(), &self.url(resource_id), resource_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRest, MGMT};
    use netfence_common::rule::TAG_SERVICE_TAG;
    use netfence_common::FenceError;

    const ACCOUNT: &str =
        "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/st1";
    const VAULT: &str = "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv1";
    const COSMOS: &str =
        "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.DocumentDB/databaseAccounts/db1";
    const SUBNET: &str =
        "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/a";

    fn main_rules() -> RuleSet {
        let mut tag_rule = IpSecurityRestrictionRule::for_address("AzureFrontDoor.Backend", "fd");
        tag_rule.tag = Some(TAG_SERVICE_TAG.into());
        vec![
            IpSecurityRestrictionRule::for_address("20.1.2.3", "pip"),
            IpSecurityRestrictionRule::for_address("10.0.0.0/24", "ops"),
            IpSecurityRestrictionRule::for_subnet(SUBNET, "app"),
            tag_rule,
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_storage_overwrite_shape() {
        let rest = FakeRest::new();
        let applier = AclApplier::new(&STORAGE, rest.clone(), MGMT);
        let result = applier
            .overwrite(&NetworkRestrictionSettings::new(ACCOUNT, main_rules(), RuleSet::new()))
            .await
            .unwrap();

        let doc = rest
            .doc(&format!("{MGMT}{ACCOUNT}?api-version=2023-01-01"))
            .unwrap();
        let acl = &doc["properties"]["networkAcls"];
        assert_eq!(acl["defaultAction"], "Deny");
        assert_eq!(acl["bypass"], "AzureServices");
        let ips: Vec<&str> = acl["ipRules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["value"].as_str().unwrap())
            .collect();
        assert_eq!(ips, vec!["10.0.0.0/24", "20.1.2.3"]);
        assert_eq!(acl["ipRules"][0]["action"], "Allow");
        assert_eq!(acl["virtualNetworkRules"][0]["id"], SUBNET);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_storage_cap_is_200() {
        let rest = FakeRest::new();
        let applier = AclApplier::new(&STORAGE, rest.clone(), MGMT);
        let rules: RuleSet = (0..201)
            .map(|i| IpSecurityRestrictionRule::for_address(&format!("10.1.{}.{}", i / 250, i % 250), "r"))
            .collect();
        let err = applier
            .overwrite(&NetworkRestrictionSettings::new(ACCOUNT, rules, RuleSet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, FenceError::CapacityExceeded { count: 201, limit: 200, .. }));
        assert!(rest.writes().is_empty());
    }

    #[tokio::test]
    async fn test_key_vault_append_preserves_live_policy() {
        let rest = FakeRest::new();
        let url = format!("{MGMT}{VAULT}?api-version=2023-07-01");
        rest.seed(
            &url,
            json!({"properties": {"networkAcls": {
                "defaultAction": "Allow",
                "bypass": "None",
                "ipRules": [{"value": "20.1.2.3/32"}],
                "virtualNetworkRules": []
            }}}),
        );
        let applier = AclApplier::new(&KEY_VAULT, rest.clone(), MGMT);

        let present: RuleSet = vec![IpSecurityRestrictionRule::for_address("20.1.2.3", "pip")]
            .into_iter()
            .collect();
        applier
            .append(&NetworkRestrictionSettings::new(VAULT, present, RuleSet::new()))
            .await
            .unwrap();
        assert!(rest.writes().is_empty());

        let add: RuleSet = vec![IpSecurityRestrictionRule::for_subnet(SUBNET, "app")]
            .into_iter()
            .collect();
        applier
            .append(&NetworkRestrictionSettings::new(VAULT, add, RuleSet::new()))
            .await
            .unwrap();
        let acl = rest.doc(&url).unwrap()["properties"]["networkAcls"].clone();
        assert_eq!(acl["defaultAction"], "Allow");
        assert_eq!(acl["bypass"], "None");
        assert_eq!(acl["ipRules"].as_array().unwrap().len(), 1);
        assert_eq!(acl["virtualNetworkRules"][0]["id"], SUBNET);
    }

    #[tokio::test]
    async fn test_cosmos_layout_and_provisioning_exemption() {
        let rest = FakeRest::new();
        let applier = AclApplier::new(&COSMOS_DB, rest.clone(), MGMT);
        // no document seeded: a readiness lookup would be a 404
        applier.check_provisioning_state(COSMOS).await.unwrap();

        applier
            .overwrite(&NetworkRestrictionSettings::new(COSMOS, main_rules(), RuleSet::new()))
            .await
            .unwrap();
        let doc = rest
            .doc(&format!("{MGMT}{COSMOS}?api-version=2023-04-15"))
            .unwrap();
        assert_eq!(doc["properties"]["ipRules"][1]["ipAddressOrRange"], "20.1.2.3/32");
        assert_eq!(doc["properties"]["isVirtualNetworkFilterEnabled"], true);
    }

    #[tokio::test]
    async fn test_storage_requires_succeeded_state() {
        let rest = FakeRest::new();
        rest.seed(
            &format!("{MGMT}{ACCOUNT}?api-version=2023-01-01"),
            json!({"properties": {"provisioningState": "ResolvingDNS"}}),
        );
        let applier = AclApplier::new(&STORAGE, rest, MGMT);
        assert!(applier.check_provisioning_state(ACCOUNT).await.is_err());
    }
}
