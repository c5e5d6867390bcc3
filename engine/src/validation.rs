//! Record validation: id shape per role, tag existence, subscription policy

use regex::RegexSet;
use std::sync::Arc;

use netfence_common::resource_id::{self, same_id};
use netfence_common::{FenceError, ResourceDependencyInformation, Result, ResultObject, RestrictionSources};

use crate::config::PolicyConfig;
use crate::kinds::ResourceKind;
use crate::tags::{CloudTagResolver, OrgTagResolver};

const PREFIX: &str = r"(?i)^/subscriptions/[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}/resourceGroups/[^/]+/providers/";

/// Resources whose firewall netfence manages
const MAIN_TYPES: &[&str] = &[
    r"Microsoft\.Web/sites/[^/]+(/slots/[^/]+)?$",
    r"Microsoft\.Storage/storageAccounts/[^/]+$",
    r"Microsoft\.KeyVault/vaults/[^/]+$",
    r"Microsoft\.DocumentDB/databaseAccounts/[^/]+$",
    r"Microsoft\.Sql/servers/[^/]+$",
];

/// Resources that can be granted inbound access
const INBOUND_TYPES: &[&str] = &[
    r"Microsoft\.Network/publicIPAddresses/[^/]+$",
    r"Microsoft\.Web/sites/[^/]+(/slots/[^/]+)?$",
    r"Microsoft\.Network/frontDoors/[^/]+$",
    r"Microsoft\.Cdn/profiles/[^/]+$",
    r"Microsoft\.Network/virtualNetworks/[^/]+/subnets/[^/]+$",
];

fn role_set(types: &[&str]) -> Result<RegexSet> {
    RegexSet::new(types.iter().map(|t| format!("{PREFIX}{t}")))
        .map_err(|e| FenceError::Config(format!("resource id patterns: {e}")))
}

pub struct Validator {
    cloud_tags: Arc<CloudTagResolver>,
    org_tags: Arc<OrgTagResolver>,
    policy: PolicyConfig,
    main: RegexSet,
    inbound: RegexSet,
    outbound: RegexSet,
}

impl Validator {
    pub fn new(
        cloud_tags: Arc<CloudTagResolver>,
        org_tags: Arc<OrgTagResolver>,
        policy: PolicyConfig,
    ) -> Result<Self> {
        Ok(Self {
            cloud_tags,
            org_tags,
            policy,
            main: role_set(MAIN_TYPES)?,
            inbound: role_set(INBOUND_TYPES)?,
            outbound: role_set(MAIN_TYPES)?,
        })
    }

    /// Errors land in the returned result; `Err` means a lookup itself failed
    pub async fn validate(&self, record: &ResourceDependencyInformation) -> Result<ResultObject> {
        let mut result = ResultObject::new();
        let id = record.resource_id.trim();
        if id.is_empty() {
            result.error("resourceId is required");
            return Ok(result);
        }
        if !self.main.is_match(id) {
            result.error(format!("{id} is not a supported resource for restriction management"));
            return Ok(result);
        }
        let subscription = resource_id::subscription_id(id)?;
        let kind = ResourceKind::from_resource_id(id)?;

        let scm = &record.allow_inbound.scm_security_restrictions;
        if !kind.has_scm() && !scm.is_empty() {
            result.error(format!(
                "scmSecurityRestrictions only apply to web sites, not {}",
                kind.type_name()
            ));
        }

        for (list, sources) in [
            ("securityRestrictions", &record.allow_inbound.security_restrictions),
            ("scmSecurityRestrictions", scm),
        ] {
            self.check_sources(id, &subscription, list, sources, &mut result)
                .await?;
        }

        for target in &record.allow_outbound.resource_ids {
            self.check_reference(id, &subscription, "allowOutbound", target, &self.outbound, &mut result);
        }
        Ok(result)
    }

    async fn check_sources(
        &self,
        id: &str,
        subscription: &str,
        list: &str,
        sources: &RestrictionSources,
        result: &mut ResultObject,
    ) -> Result<()> {
        for peer in &sources.resource_ids {
            self.check_reference(id, subscription, list, peer, &self.inbound, result);
        }
        for tag in &sources.azure_service_tags {
            if !self.cloud_tags.exists(tag).await? {
                result.error(format!("{list}: {tag} is not a known cloud service tag"));
            }
        }
        let subscription_name = self
            .org_tags
            .subscription_name(subscription)
            .await?
            .unwrap_or_default();
        for name in &sources.new_day_internal_and_third_party_tags {
            match self.org_tags.get(name).await? {
                None => result.error(format!("{list}: {name} is not a known organization tag")),
                Some(tag) if !tag.is_allowed_for(&subscription_name) => result.error(format!(
                    "{list}: organization tag {name} is not allowed in subscription {subscription}"
                )),
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_reference(
        &self,
        id: &str,
        subscription: &str,
        list: &str,
        reference: &str,
        patterns: &RegexSet,
        result: &mut ResultObject,
    ) {
        let reference = reference.trim();
        if !patterns.is_match(reference) {
            result.error(format!("{list}: {reference} is not an accepted resource id"));
            return;
        }
        if same_id(reference, id) {
            result.error(format!("{list}: a resource cannot reference itself"));
            return;
        }
        if self.policy.subnet_allow_listed(reference) {
            return;
        }
        match resource_id::subscription_id(reference) {
            Ok(other) if self.policy.same_group(subscription, &other) => {}
            Ok(other) => result.error(format!(
                "{list}: {reference} is in subscription {other}, which may not be referenced from {subscription}"
            )),
            Err(e) => result.error(format!("{list}: {}", e.user_message())),
        }
    }
}
