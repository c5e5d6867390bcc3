//! Dependency records, restriction settings and organization tags

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resource_id::{self, same_id};
use crate::rule::RuleSet;

/// Inbound sources for one endpoint (main site or SCM)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionSources {
    #[serde(default)]
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub azure_service_tags: Vec<String>,
    #[serde(default)]
    pub new_day_internal_and_third_party_tags: Vec<String>,
}

impl RestrictionSources {
    pub fn is_empty(&self) -> bool {
        self.resource_ids.is_empty()
            && self.azure_service_tags.is_empty()
            && self.new_day_internal_and_third_party_tags.is_empty()
    }

    fn references(&self, resource_id: &str) -> bool {
        self.resource_ids.iter().any(|id| same_id(id, resource_id))
    }

    fn strip(&mut self, resource_id: &str) -> bool {
        let before = self.resource_ids.len();
        self.resource_ids.retain(|id| !same_id(id, resource_id));
        before != self.resource_ids.len()
    }

    fn references_tag(&self, tag: &str) -> bool {
        self.new_day_internal_and_third_party_tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowInbound {
    #[serde(default)]
    pub security_restrictions: RestrictionSources,
    #[serde(default)]
    pub scm_security_restrictions: RestrictionSources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowOutbound {
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

/// One record per managed resource, keyed by [`resource_id::document_id`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDependencyInformation {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub print_out: bool,
    #[serde(default)]
    pub allow_inbound: AllowInbound,
    #[serde(default)]
    pub allow_outbound: AllowOutbound,
}

impl ResourceDependencyInformation {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            ..Default::default()
        }
    }

    pub fn document_id(&self) -> String {
        resource_id::document_id(&self.resource_id)
    }

    pub fn name(&self) -> Result<String> {
        resource_id::resource_name(&self.resource_id)
    }

    pub fn resource_type(&self) -> Result<String> {
        resource_id::resource_type(&self.resource_id)
    }

    pub fn resource_group(&self) -> Result<String> {
        resource_id::resource_group(&self.resource_id)
    }

    pub fn subscription_id(&self) -> Result<String> {
        resource_id::subscription_id(&self.resource_id)
    }

    /// Whether `resource_id` appears in the main or SCM inbound lists
    pub fn references_inbound(&self, resource_id: &str) -> bool {
        self.allow_inbound.security_restrictions.references(resource_id)
            || self.allow_inbound.scm_security_restrictions.references(resource_id)
    }

    pub fn references_outbound(&self, resource_id: &str) -> bool {
        self.allow_outbound
            .resource_ids
            .iter()
            .any(|id| same_id(id, resource_id))
    }

    pub fn references_tag(&self, tag: &str) -> bool {
        self.allow_inbound.security_restrictions.references_tag(tag)
            || self.allow_inbound.scm_security_restrictions.references_tag(tag)
    }

    /// Remove `resource_id` from every inbound and outbound list.
    /// Returns true if anything changed.
    pub fn strip_reference(&mut self, resource_id: &str) -> bool {
        let main = self.allow_inbound.security_restrictions.strip(resource_id);
        let scm = self.allow_inbound.scm_security_restrictions.strip(resource_id);
        let before = self.allow_outbound.resource_ids.len();
        self.allow_outbound
            .resource_ids
            .retain(|id| !same_id(id, resource_id));
        main || scm || before != self.allow_outbound.resource_ids.len()
    }

    /// All resource ids this record points at, inbound and outbound
    pub fn referenced_ids(&self) -> impl Iterator<Item = &String> {
        self.allow_inbound
            .security_restrictions
            .resource_ids
            .iter()
            .chain(self.allow_inbound.scm_security_restrictions.resource_ids.iter())
            .chain(self.allow_outbound.resource_ids.iter())
    }
}

/// Desired end state for one resource. `main`/`scm` replace the live
/// configuration on overwrite; the delete sets are only used by append callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkRestrictionSettings {
    pub resource_id: String,
    pub main: RuleSet,
    pub scm: RuleSet,
    pub main_delete: Option<RuleSet>,
    pub scm_delete: Option<RuleSet>,
}

impl NetworkRestrictionSettings {
    pub fn new(resource_id: impl Into<String>, main: RuleSet, scm: RuleSet) -> Self {
        Self {
            resource_id: resource_id.into(),
            main,
            scm,
            main_delete: None,
            scm_delete: None,
        }
    }

    /// Same rules aimed at another resource (deployment slots)
    pub fn retarget(&self, resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedSubscription {
    pub subscription_name: String,
    #[serde(default)]
    pub is_mandatory: bool,
}

/// Organization-defined service tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTag {
    pub name: String,
    #[serde(default)]
    pub address_prefixes: Vec<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub allowed_subscriptions: Vec<AllowedSubscription>,
}

impl ServiceTag {
    /// Tags with no subscription list are usable everywhere
    pub fn is_allowed_for(&self, subscription_name: &str) -> bool {
        self.allowed_subscriptions.is_empty()
            || self
                .allowed_subscriptions
                .iter()
                .any(|s| s.subscription_name.eq_ignore_ascii_case(subscription_name))
    }

    pub fn is_mandatory_for(&self, subscription_name: &str) -> bool {
        self.allowed_subscriptions.iter().any(|s| {
            s.is_mandatory && s.subscription_name.eq_ignore_ascii_case(subscription_name)
        })
    }
}

/// Organization subscription, used to map subscription ids to names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub name: String,
}

/// Seed payload for the organization stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSettings {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub tags: Vec<ServiceTag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIP: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/pip1";

    fn record() -> ResourceDependencyInformation {
        serde_json::from_value(serde_json::json!({
            "resourceId": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Web/sites/app1",
            "allowInbound": {
                "securityRestrictions": {
                    "resourceIds": [PIP],
                    "azureServiceTags": ["AzureCloud"],
                    "newDayInternalAndThirdPartyTags": ["Office"]
                },
                "scmSecurityRestrictions": { "resourceIds": [PIP.to_uppercase()] }
            },
            "allowOutbound": { "resourceIds": [PIP] }
        }))
        .unwrap()
    }

    #[test]
    fn test_envelope_parses_with_defaults() {
        let r: ResourceDependencyInformation =
            serde_json::from_str(r#"{"resourceId":"/subscriptions/s"}"#).unwrap();
        assert!(!r.print_out);
        assert!(r.allow_inbound.security_restrictions.resource_ids.is_empty());
        assert!(r.allow_outbound.resource_ids.is_empty());
    }

    #[test]
    fn test_references() {
        let r = record();
        assert!(r.references_inbound(PIP));
        assert!(r.references_outbound(&PIP.to_lowercase()));
        assert!(r.references_tag("office"));
        assert!(!r.references_tag("AzureCloud"));
        assert_eq!(r.name().unwrap(), "app1");
    }

    #[test]
    fn test_strip_reference_clears_every_list() {
        let mut r = record();
        assert!(r.strip_reference(PIP));
        assert!(!r.references_inbound(PIP));
        assert!(!r.references_outbound(PIP));
        assert_eq!(r.referenced_ids().count(), 0);
        assert!(!r.strip_reference(PIP));
    }

    #[test]
    fn test_serialize_skips_false_print_out() {
        let json = serde_json::to_value(record()).unwrap();
        assert!(json.get("printOut").is_none());
        assert!(json["allowInbound"]["securityRestrictions"]["newDayInternalAndThirdPartyTags"]
            .is_array());
    }

    #[test]
    fn test_service_tag_subscription_rules() {
        let tag = ServiceTag {
            name: "Office".into(),
            address_prefixes: vec![],
            subnet_ids: vec![],
            allowed_subscriptions: vec![
                AllowedSubscription { subscription_name: "prod".into(), is_mandatory: true },
                AllowedSubscription { subscription_name: "dev".into(), is_mandatory: false },
            ],
        };
        assert!(tag.is_allowed_for("PROD"));
        assert!(tag.is_allowed_for("dev"));
        assert!(!tag.is_allowed_for("test"));
        assert!(tag.is_mandatory_for("prod"));
        assert!(!tag.is_mandatory_for("dev"));
    }
}
