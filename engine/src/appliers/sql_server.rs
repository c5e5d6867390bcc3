//! SQL logical servers: firewall and virtual network rules are child resources

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

use netfence_access::RestApi;
use netfence_common::rule::bounded_name;
use netfence_common::{resource_id, NetworkRestrictionSettings, Result, ResultObject, RuleSet};

use super::{arm_url, check_provisioning, ensure_capacity, RestrictionApplier};
use crate::kinds::ResourceKind;

pub const SQL_FIREWALL_RULE_LIMIT: usize = 256;
pub const SQL_VNET_RULE_LIMIT: usize = 128;

/// Platform rule that lets Azure services in; never removed
const ALLOW_AZURE_SERVICES: &str = "AllowAllWindowsAzureIps";
const RULE_NAME_MAX_LEN: usize = 64;

#[derive(Deserialize)]
struct ChildList {
    #[serde(default)]
    value: Vec<ChildRule>,
}

#[derive(Deserialize)]
struct ChildRule {
    name: String,
    #[serde(default)]
    properties: Value,
}

type Range = (Ipv4Addr, Ipv4Addr);

#[derive(Default)]
struct Desired {
    firewall: BTreeMap<Range, String>,
    subnets: BTreeMap<String, (String, String)>,
    skipped: Vec<String>,
}

/// First and last address of a CIDR or single address
fn ip_range(address: &str) -> Option<Range> {
    let address = address.trim();
    if let Ok(net) = address.parse::<Ipv4Net>() {
        return Some((net.network(), net.broadcast()));
    }
    address.parse::<Ipv4Addr>().ok().map(|ip| (ip, ip))
}

fn firewall_rule_name((start, end): &Range) -> String {
    format!("netfence-{start}-{end}")
}

/// `netfence-{vnet}-{subnet}` plus a digest of the full subnet id, so same-named
/// subnets in other resource groups or subscriptions get their own rule
fn vnet_rule_name(subnet_id: &str) -> String {
    let digest = Sha256::digest(subnet_id.trim().to_ascii_lowercase().as_bytes());
    let suffix: String = format!("-{digest:x}").chars().take(9).collect();
    let subnet = resource_id::resource_name(subnet_id).unwrap_or_default();
    let vnet = resource_id::parent_id(subnet_id)
        .and_then(|p| resource_id::resource_name(&p).ok())
        .unwrap_or_default();
    let raw = format!("netfence-{vnet}-{subnet}");
    let clean: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    bounded_name(&clean, &suffix, RULE_NAME_MAX_LEN)
}

fn desired(rules: &RuleSet) -> Desired {
    let mut desired = Desired::default();
    for rule in rules.iter() {
        if let Some(subnet) = rule.vnet_subnet_resource_id.as_deref().filter(|_| rule.is_subnet()) {
            desired.subnets.insert(
                subnet.trim().to_ascii_lowercase(),
                (vnet_rule_name(subnet), subnet.trim().to_string()),
            );
            continue;
        }
        let address = rule.ip_address.clone().unwrap_or_default();
        match ip_range(&address).filter(|_| !rule.is_service_tag()) {
            Some(range) => {
                desired.firewall.insert(range, firewall_rule_name(&range));
            }
            None => desired.skipped.push(address),
        }
    }
    desired
}

fn live_range(rule: &ChildRule) -> Option<Range> {
    let start = rule.properties.get("startIpAddress")?.as_str()?.parse().ok()?;
    let end = rule.properties.get("endIpAddress")?.as_str()?.parse().ok()?;
    Some((start, end))
}

fn live_subnet(rule: &ChildRule) -> Option<String> {
    rule.properties
        .get("virtualNetworkSubnetId")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
}

pub struct SqlServerApplier {
    rest: Arc<dyn RestApi>,
    endpoint: String,
}

impl SqlServerApplier {
    pub fn new(rest: Arc<dyn RestApi>, management_endpoint: &str) -> Self {
        Self {
            rest,
            endpoint: management_endpoint.to_string(),
        }
    }

    fn url(&self, server_id: &str, suffix: &str) -> String {
        arm_url(
            &self.endpoint,
            server_id,
            suffix,
            ResourceKind::SqlServer.api_version(),
        )
    }

    async fn list(&self, server_id: &str, collection: &str) -> Result<Vec<ChildRule>> {
        let value = self
            .rest
            .get(&self.url(server_id, &format!("/{collection}")))
            .await?;
        let list: ChildList = serde_json::from_value(value)?;
        Ok(list.value)
    }

    /// Bring the child collections to `keep` plus `add`. With `prune` every
    /// live rule outside `add` is deleted, otherwise only those in `remove`.
    async fn converge(
        &self,
        server_id: &str,
        add: &Desired,
        remove: &Desired,
        prune: bool,
    ) -> Result<ResultObject> {
        let firewall = self.list(server_id, "firewallRules").await?;
        let vnets = self.list(server_id, "virtualNetworkRules").await?;

        let mut fw_deletes = Vec::new();
        let mut fw_live = BTreeMap::new();
        for rule in &firewall {
            if rule.name == ALLOW_AZURE_SERVICES {
                continue;
            }
            match live_range(rule) {
                Some(range)
                    if (prune && !add.firewall.contains_key(&range))
                        || remove.firewall.contains_key(&range) =>
                {
                    fw_deletes.push(rule.name.clone())
                }
                Some(range) => {
                    fw_live.insert(range, rule.name.clone());
                }
                None if prune => fw_deletes.push(rule.name.clone()),
                None => {}
            }
        }
        let fw_puts: Vec<(&Range, &String)> = add
            .firewall
            .iter()
            .filter(|(range, _)| !fw_live.contains_key(*range))
            .collect();

        let mut vnet_deletes = Vec::new();
        let mut vnet_live = BTreeMap::new();
        for rule in &vnets {
            match live_subnet(rule) {
                Some(subnet)
                    if (prune && !add.subnets.contains_key(&subnet))
                        || remove.subnets.contains_key(&subnet) =>
                {
                    vnet_deletes.push(rule.name.clone())
                }
                Some(subnet) => {
                    vnet_live.insert(subnet, rule.name.clone());
                }
                None if prune => vnet_deletes.push(rule.name.clone()),
                None => {}
            }
        }
        let vnet_puts: Vec<&(String, String)> = add
            .subnets
            .iter()
            .filter(|(key, _)| !vnet_live.contains_key(*key))
            .map(|(_, v)| v)
            .collect();

        ensure_capacity(server_id, fw_live.len() + fw_puts.len(), SQL_FIREWALL_RULE_LIMIT)?;
        ensure_capacity(server_id, vnet_live.len() + vnet_puts.len(), SQL_VNET_RULE_LIMIT)?;

        for name in &fw_deletes {
            self.rest
                .delete(&self.url(server_id, &format!("/firewallRules/{name}")))
                .await?;
        }
        for name in &vnet_deletes {
            self.rest
                .delete(&self.url(server_id, &format!("/virtualNetworkRules/{name}")))
                .await?;
        }
        for ((start, end), name) in &fw_puts {
            self.rest
                .put(
                    &self.url(server_id, &format!("/firewallRules/{name}")),
                    json!({"properties": {"startIpAddress": start.to_string(), "endIpAddress": end.to_string()}}),
                )
                .await?;
        }
        for (name, subnet) in &vnet_puts {
            self.rest
                .put(
                    &self.url(server_id, &format!("/virtualNetworkRules/{name}")),
                    json!({"properties": {"virtualNetworkSubnetId": subnet, "ignoreMissingVnetServiceEndpoint": false}}),
                )
                .await?;
        }

        info!(
            "Converged {server_id}: firewall +{} -{}, vnet +{} -{}",
            fw_puts.len(),
            fw_deletes.len(),
            vnet_puts.len(),
            vnet_deletes.len()
        );
        let mut result = ResultObject::new();
        for skipped in &add.skipped {
            result.warning(format!(
                "{server_id}: rule {skipped} cannot be expressed as a SQL firewall range"
            ));
        }
        result.info(format!(
            "{server_id}: firewall rules +{} -{}, virtual network rules +{} -{}",
            fw_puts.len(),
            fw_deletes.len(),
            vnet_puts.len(),
            vnet_deletes.len()
        ));
        Ok(result)
    }
}

#[async_trait]
impl RestrictionApplier for SqlServerApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SqlServer
    }

    async fn overwrite(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        self.converge(
            &settings.resource_id,
            &desired(&settings.main),
            &Desired::default(),
            true,
        )
        .await
    }

    async fn append(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        let remove = settings
            .main_delete
            .as_ref()
            .map(desired)
            .unwrap_or_default();
        self.converge(&settings.resource_id, &desired(&settings.main), &remove, false)
            .await
    }

    async fn check_provisioning_state(&self, resource_id: &str) -> Result<()> {
        check_provisioning(self.rest.as_ref(), &self.url(resource_id, ""), resource_id).await
    }
}
