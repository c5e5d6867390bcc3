//! Web sites and their deployment slots (`config/web`)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use netfence_access::RestApi;
use netfence_common::rule::bounded_name;
use netfence_common::{
    FenceError, IpSecurityRestrictionRule, NetworkRestrictionSettings, PrintOut, Result,
    ResultObject, RuleSet,
};

use super::{arm_url, check_provisioning, ensure_capacity, PeerContribution, RestrictionApplier};
use crate::inventory::ResourceMetadata;
use crate::kinds::ResourceKind;

/// Provider cap on entries per restriction list
pub const WEB_SITE_RULE_LIMIT: usize = 512;

const MAIN_FIELD: &str = "ipSecurityRestrictions";
const SCM_FIELD: &str = "scmIpSecurityRestrictions";

pub struct WebSiteApplier {
    rest: Arc<dyn RestApi>,
    endpoint: String,
}

impl WebSiteApplier {
    pub fn new(rest: Arc<dyn RestApi>, management_endpoint: &str) -> Self {
        Self {
            rest,
            endpoint: management_endpoint.to_string(),
        }
    }

    fn config_url(&self, resource_id: &str) -> String {
        arm_url(
            &self.endpoint,
            resource_id,
            "/config/web",
            ResourceKind::WebSite.api_version(),
        )
    }

    fn check_limits(settings: &NetworkRestrictionSettings) -> Result<()> {
        ensure_capacity(&settings.resource_id, settings.main.len(), WEB_SITE_RULE_LIMIT)?;
        ensure_capacity(&settings.resource_id, settings.scm.len(), WEB_SITE_RULE_LIMIT)
    }
}

/// Live rules of one list. The platform's implicit "Any" entries are not ours.
fn live_rules(config: &Value, field: &str) -> Result<RuleSet> {
    let entries = match config.pointer(&format!("/properties/{field}")) {
        Some(Value::Array(entries)) => entries.clone(),
        _ => return Ok(RuleSet::new()),
    };
    let rules: Vec<IpSecurityRestrictionRule> = serde_json::from_value(Value::Array(entries))?;
    Ok(rules
        .into_iter()
        .filter(|r| {
            !r.ip_address
                .as_deref()
                .is_some_and(|ip| ip.eq_ignore_ascii_case("any"))
        })
        .collect())
}

fn apply_delta(live: &RuleSet, add: &RuleSet, delete: Option<&RuleSet>) -> RuleSet {
    let mut merged = live.clone();
    merged.merge(add.clone());
    if let Some(delete) = delete {
        merged.subtract(delete);
    }
    merged
}

#[async_trait]
impl RestrictionApplier for WebSiteApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::WebSite
    }

    /// A web site reaches its peers through its VNet integration subnet
    fn generate_self_rules(&self, resource: &ResourceMetadata, max_name_len: usize) -> PeerContribution {
        let mut contribution = PeerContribution::default();
        match resource.property_str("virtualNetworkSubnetId") {
            Some(subnet) => contribution.rules.push(
                IpSecurityRestrictionRule::for_subnet(
                    subnet,
                    &bounded_name(&resource.name, "", max_name_len),
                )
                .with_description(format!("Web site {}", resource.name)),
            ),
            None => contribution.warnings.push(format!(
                "web site {} has no VNet integration",
                resource.name
            )),
        }
        contribution
    }

    async fn overwrite(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        Self::check_limits(settings)?;

        let body = json!({
            "properties": {
                MAIN_FIELD: settings.main.to_vec(),
                SCM_FIELD: settings.scm.to_vec(),
                "scmIpSecurityRestrictionsUseMain": false,
                "ipSecurityRestrictionsDefaultAction": "Deny",
                "scmIpSecurityRestrictionsDefaultAction": "Deny",
            }
        });
        self.rest
            .patch(&self.config_url(&settings.resource_id), body)
            .await?;

        info!(
            "Overwrote {} with {} main and {} scm rules",
            settings.resource_id,
            settings.main.len(),
            settings.scm.len()
        );
        let mut result = ResultObject::new();
        result.info(format!(
            "{}: applied {} main and {} scm rules",
            settings.resource_id,
            settings.main.len(),
            settings.scm.len()
        ));
        Ok(result)
    }

    async fn append(&self, settings: &NetworkRestrictionSettings) -> Result<ResultObject> {
        let url = self.config_url(&settings.resource_id);
        let live = self.rest.get(&url).await?;
        let live_main = live_rules(&live, MAIN_FIELD)?;
        let live_scm = live_rules(&live, SCM_FIELD)?;

        let main = apply_delta(&live_main, &settings.main, settings.main_delete.as_ref());
        let scm = apply_delta(&live_scm, &settings.scm, settings.scm_delete.as_ref());

        let mut result = ResultObject::new();
        if main == live_main && scm == live_scm {
            result.info(format!("{}: rules already present", settings.resource_id));
            return Ok(result);
        }

        let merged = NetworkRestrictionSettings::new(settings.resource_id.clone(), main, scm);
        Self::check_limits(&merged)?;

        let body = json!({
            "properties": {
                MAIN_FIELD: merged.main.to_vec(),
                SCM_FIELD: merged.scm.to_vec(),
            }
        });
        self.rest.patch(&url, body).await?;

        info!(
            "Appended to {}: main {} -> {}, scm {} -> {}",
            settings.resource_id,
            live_main.len(),
            merged.main.len(),
            live_scm.len(),
            merged.scm.len()
        );
        result.info(format!(
            "{}: main rules {} -> {}, scm rules {} -> {}",
            settings.resource_id,
            live_main.len(),
            merged.main.len(),
            live_scm.len(),
            merged.scm.len()
        ));
        Ok(result)
    }

    fn convert_to_print_out(&self, _settings: &NetworkRestrictionSettings) -> Result<PrintOut> {
        Err(FenceError::unsupported(
            "ConvertToPrintOut",
            ResourceKind::WebSite.type_name(),
        ))
    }

    async fn check_provisioning_state(&self, resource_id: &str) -> Result<()> {
        let url = arm_url(
            &self.endpoint,
            resource_id,
            "",
            ResourceKind::WebSite.api_version(),
        );
        check_provisioning(self.rest.as_ref(), &url, resource_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRest, MGMT};
    use netfence_access::Method;

    const SITE: &str = "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Web/sites/app1";
    const SUBNET: &str = "/subscriptions/s1/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/app2";

    fn config_url() -> String {
        format!("{MGMT}{SITE}/config/web?api-version=2022-03-01")
    }

    fn rules(addresses: &[&str]) -> RuleSet {
        addresses
            .iter()
            .enumerate()
            .map(|(i, a)| IpSecurityRestrictionRule::for_address(a, &format!("r{i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() {
        let rest = FakeRest::new();
        let applier = WebSiteApplier::new(rest.clone(), MGMT);
        let settings = NetworkRestrictionSettings::new(SITE, rules(&["1.1.1.1", "2.2.2.0/24"]), rules(&["3.3.3.3"]));

        applier.overwrite(&settings).await.unwrap();
        let first = rest.doc(&config_url()).unwrap();
        applier.overwrite(&settings).await.unwrap();
        let second = rest.doc(&config_url()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first["properties"]["ipSecurityRestrictions"].as_array().unwrap().len(), 2);
        assert_eq!(first["properties"]["scmIpSecurityRestrictionsUseMain"], false);
        assert_eq!(first["properties"]["ipSecurityRestrictionsDefaultAction"], "Deny");
    }

    #[tokio::test]
    async fn test_overwrite_over_capacity_writes_nothing() {
        let rest = FakeRest::new();
        let applier = WebSiteApplier::new(rest.clone(), MGMT);
        let many: Vec<String> = (0..513).map(|i| format!("10.{}.{}.1", i / 256, i % 256)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let settings = NetworkRestrictionSettings::new(SITE, rules(&refs), RuleSet::new());

        let err = applier.overwrite(&settings).await.unwrap_err();
        assert!(matches!(err, FenceError::CapacityExceeded { count: 513, limit: 512, .. }));
        assert!(rest.writes().is_empty());
    }

    #[tokio::test]
    async fn test_append_dedupes_by_identity_and_skips_noop() {
        let rest = FakeRest::new();
        rest.seed(
            &config_url(),
            json!({"properties": {
                "ipSecurityRestrictions": [
                    {"ipAddress": "1.1.1.1/32", "name": "existing", "action": "Allow", "priority": 100},
                    {"ipAddress": "Any", "name": "Allow all", "action": "Allow", "priority": 2147483647}
                ],
                "scmIpSecurityRestrictions": []
            }}),
        );
        let applier = WebSiteApplier::new(rest.clone(), MGMT);

        // same address under another name: nothing to do
        let same = NetworkRestrictionSettings::new(SITE, rules(&["1.1.1.1"]), RuleSet::new());
        applier.append(&same).await.unwrap();
        assert!(rest.writes().is_empty());

        let mut add = NetworkRestrictionSettings::new(
            SITE,
            vec![IpSecurityRestrictionRule::for_subnet(SUBNET, "app2")].into_iter().collect(),
            RuleSet::new(),
        );
        add.main_delete = Some(rules(&["1.1.1.1"]));
        applier.append(&add).await.unwrap();

        let writes = rest.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, Method::Patch);
        let written = &writes[0].2.as_ref().unwrap()["properties"]["ipSecurityRestrictions"];
        assert_eq!(written.as_array().unwrap().len(), 1);
        assert_eq!(written[0]["vnetSubnetResourceId"], SUBNET);
        // append never touches the default action of a resource it does not own
        assert!(writes[0].2.as_ref().unwrap()["properties"]
            .get("ipSecurityRestrictionsDefaultAction")
            .is_none());
    }

    #[test]
    fn test_preview_unsupported() {
        let applier = WebSiteApplier::new(FakeRest::new(), MGMT);
        let err = applier
            .convert_to_print_out(&NetworkRestrictionSettings::default())
            .unwrap_err();
        assert!(matches!(err, FenceError::Unsupported { .. }));
    }

    #[test]
    fn test_self_rules_use_vnet_integration() {
        let applier = WebSiteApplier::new(FakeRest::new(), MGMT);
        let mut meta = ResourceMetadata {
            id: SITE.into(),
            name: "app1".into(),
            resource_type: "microsoft.web/sites".into(),
            subscription_id: "s1".into(),
            resource_group: "rg".into(),
            properties: json!({"virtualNetworkSubnetId": SUBNET}),
        };
        let contribution = applier.generate_self_rules(&meta, 32);
        assert_eq!(contribution.rules.len(), 1);
        assert!(contribution.rules[0].is_subnet());
        assert!(contribution.warnings.is_empty());

        meta.properties = json!({});
        let contribution = applier.generate_self_rules(&meta, 32);
        assert!(contribution.rules.is_empty());
        assert_eq!(contribution.warnings.len(), 1);
    }
}
