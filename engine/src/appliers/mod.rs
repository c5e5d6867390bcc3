//! Restriction appliers, one strategy per resource kind
//!
//! Each applier knows how its kind contributes rules as someone else's
//! inbound peer, and how to overwrite, append to or preview its own live
//! firewall configuration. Kinds are dispatched through [`ApplierRegistry`].

mod acl;
mod front_door;
mod public_ip;
mod sql_server;
mod web_site;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use netfence_access::RestApi;
use netfence_common::{
    FenceError, IpSecurityRestrictionRule, NetworkRestrictionSettings, PrintOut, Result,
    ResultObject,
};

use crate::inventory::ResourceMetadata;
use crate::kinds::ResourceKind;

pub use acl::{AclApplier, AclLayout, COSMOS_DB, KEY_VAULT, STORAGE};
pub use front_door::FrontDoorApplier;
pub use public_ip::PublicIpApplier;
pub use sql_server::SqlServerApplier;
pub use web_site::{WebSiteApplier, WEB_SITE_RULE_LIMIT};

/// What a resource contributes when it appears as an inbound peer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerContribution {
    pub rules: Vec<IpSecurityRestrictionRule>,
    /// Front Door instance id, aggregated by the rule engine into one header rule
    pub front_door_id: Option<String>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait RestrictionApplier: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Data-plane kinds contribute nothing as peers
    fn generate_self_rules(&self, _resource: &ResourceMetadata, _max_name_len: usize) -> PeerContribution {
        PeerContribution::default()
    }

    /// Replace the live configuration with `settings.main` / `settings.scm`
    async fn overwrite(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject>;

    /// Merge `settings` into the live configuration and drop the delete sets
    async fn append(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject>;

    fn convert_to_print_out(&self, settings: &NetworkRestrictionSettings) -> Result<PrintOut> {
        Ok(print_out(settings))
    }

    async fn check_provisioning_state(&self, resource_id: &str) -> Result<()>;
}

/// Comma-joined addresses and subnets of the main rule set
pub fn print_out(settings: &NetworkRestrictionSettings) -> PrintOut {
    PrintOut {
        ips: settings.main.ip_addresses().join(","),
        subnet_ids: settings.main.subnet_ids().join(","),
    }
}

pub(crate) fn arm_url(endpoint: &str, resource_id: &str, suffix: &str, api_version: &str) -> String {
    format!(
        "{}{}{suffix}?api-version={api_version}",
        endpoint.trim_end_matches('/'),
        resource_id.trim()
    )
}

pub(crate) fn ensure_capacity(resource: &str, count: usize, limit: usize) -> Result<()> {
    if count > limit {
        return Err(FenceError::CapacityExceeded {
            resource: resource.to_string(),
            count,
            limit,
        });
    }
    Ok(())
}

/// Resources without a `provisioningState` are taken as ready
pub(crate) async fn check_provisioning(rest: &dyn RestApi, url: &str, resource_id: &str) -> Result<()> {
    let resource = rest.get(url).await?;
    match resource
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
    {
        None => Ok(()),
        Some(state) if state.eq_ignore_ascii_case("Succeeded") => Ok(()),
        Some(state) => Err(FenceError::validation(format!(
            "{resource_id} is in provisioning state {state}, expected Succeeded"
        ))),
    }
}

/// Kind to applier lookup
pub struct ApplierRegistry {
    appliers: HashMap<ResourceKind, Arc<dyn RestrictionApplier>>,
}

impl ApplierRegistry {
    pub fn new(rest: Arc<dyn RestApi>, management_endpoint: &str) -> Self {
        let web: Arc<dyn RestrictionApplier> =
            Arc::new(WebSiteApplier::new(rest.clone(), management_endpoint));
        let entries: Vec<(ResourceKind, Arc<dyn RestrictionApplier>)> = vec![
            (ResourceKind::WebSite, web.clone()),
            (ResourceKind::WebSiteSlot, web),
            (ResourceKind::PublicIpAddress, Arc::new(PublicIpApplier)),
            (
                ResourceKind::FrontDoor,
                Arc::new(FrontDoorApplier::new(ResourceKind::FrontDoor)),
            ),
            (
                ResourceKind::FrontDoorProfile,
                Arc::new(FrontDoorApplier::new(ResourceKind::FrontDoorProfile)),
            ),
            (
                ResourceKind::Storage,
                Arc::new(AclApplier::new(&STORAGE, rest.clone(), management_endpoint)),
            ),
            (
                ResourceKind::KeyVault,
                Arc::new(AclApplier::new(&KEY_VAULT, rest.clone(), management_endpoint)),
            ),
            (
                ResourceKind::CosmosDb,
                Arc::new(AclApplier::new(&COSMOS_DB, rest.clone(), management_endpoint)),
            ),
            (
                ResourceKind::SqlServer,
                Arc::new(SqlServerApplier::new(rest, management_endpoint)),
            ),
        ];
        Self {
            appliers: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn RestrictionApplier>> {
        self.appliers
            .get(&kind)
            .cloned()
            .ok_or_else(|| FenceError::unsupported("restriction management", kind.type_name()))
    }
}
