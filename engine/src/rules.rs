//! Rule Generation Engine
//!
//! A resource's inbound rule set is the union of:
//! - explicit inbound peers, each contributing what its kind exposes
//! - peers inferred from other records' outbound edges
//! - cloud service tags (IPv4 prefixes)
//! - organization tags, per-kind defaults and mandatory tags
//! - subnets matched to VNet-less web site peers by naming convention
//! - one aggregated Front Door rule for all Front Door peers
//!
//! Every subnet rule is finally checked against the live subnet inventory.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use netfence_common::resource_id::{self, same_id};
use netfence_common::rule::{bounded_name, TAG_SERVICE_TAG};
use netfence_common::{
    FenceError, IpSecurityRestrictionRule, NetworkRestrictionSettings, ResourceDependencyInformation,
    Result, ResultObject, RuleKey, RuleSet,
};
use netfence_graph::DependencyStore;

use crate::appliers::ApplierRegistry;
use crate::config::{NetfenceConfig, PolicyConfig, TagsConfig};
use crate::inventory::{ResourceInventory, ResourceMetadata, SubnetInfo};
use crate::kinds::ResourceKind;
use crate::tags::{org, CloudTagResolver, OrgTagResolver};

pub const FRONT_DOOR_BACKEND_TAG: &str = "AzureFrontDoor.Backend";
pub const FRONT_DOOR_ID_HEADER: &str = "x-azure-fdid";
pub const FRONT_DOOR_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleList {
    Main,
    Scm,
}

/// Subnet inventory memoized per subscription for one computation
struct SubnetCache<'a> {
    inventory: &'a dyn ResourceInventory,
    loaded: HashMap<String, Vec<SubnetInfo>>,
}

impl<'a> SubnetCache<'a> {
    fn new(inventory: &'a dyn ResourceInventory) -> Self {
        Self {
            inventory,
            loaded: HashMap::new(),
        }
    }

    async fn get(&mut self, subscription_id: &str) -> Result<&[SubnetInfo]> {
        let key = subscription_id.to_ascii_lowercase();
        if !self.loaded.contains_key(&key) {
            let subnets = self.inventory.subnets(subscription_id).await?;
            debug!("Loaded {} subnets for subscription {subscription_id}", subnets.len());
            self.loaded.insert(key.clone(), subnets);
        }
        Ok(self.loaded.get(&key).map(Vec::as_slice).unwrap_or(&[]))
    }
}

pub struct RuleEngine {
    store: Arc<dyn DependencyStore>,
    inventory: Arc<dyn ResourceInventory>,
    cloud_tags: Arc<CloudTagResolver>,
    org_tags: Arc<OrgTagResolver>,
    appliers: Arc<ApplierRegistry>,
    tags: TagsConfig,
    policy: PolicyConfig,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn DependencyStore>,
        inventory: Arc<dyn ResourceInventory>,
        cloud_tags: Arc<CloudTagResolver>,
        org_tags: Arc<OrgTagResolver>,
        appliers: Arc<ApplierRegistry>,
        config: &NetfenceConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            cloud_tags,
            org_tags,
            appliers,
            tags: config.tags.clone(),
            policy: config.policy.clone(),
        }
    }

    pub fn appliers(&self) -> &Arc<ApplierRegistry> {
        &self.appliers
    }

    pub fn inventory(&self) -> &Arc<dyn ResourceInventory> {
        &self.inventory
    }

    pub fn org_tags(&self) -> &Arc<OrgTagResolver> {
        &self.org_tags
    }

    pub async fn compute_inbound_rules(
        &self,
        record: &ResourceDependencyInformation,
    ) -> Result<(RuleSet, ResultObject)> {
        self.compute(record, RuleList::Main).await
    }

    /// Only web sites have an SCM list; every other kind gets an empty set
    pub async fn compute_scm_rules(
        &self,
        record: &ResourceDependencyInformation,
    ) -> Result<(RuleSet, ResultObject)> {
        if !ResourceKind::from_resource_id(&record.resource_id)?.has_scm() {
            return Ok((RuleSet::new(), ResultObject::new()));
        }
        self.compute(record, RuleList::Scm).await
    }

    pub async fn compute_settings(
        &self,
        record: &ResourceDependencyInformation,
    ) -> Result<(NetworkRestrictionSettings, ResultObject)> {
        let (main, mut result) = self.compute_inbound_rules(record).await?;
        let (scm, scm_result) = self.compute_scm_rules(record).await?;
        result.merge(scm_result);
        Ok((
            NetworkRestrictionSettings::new(record.resource_id.clone(), main, scm),
            result,
        ))
    }

    /// Rules letting `record`'s resource into each of its outbound targets.
    /// Whether a target is managed is the caller's decision.
    pub async fn compute_append_rules_for_outbound_targets(
        &self,
        record: &ResourceDependencyInformation,
    ) -> Result<(BTreeMap<String, RuleSet>, ResultObject)> {
        let mut targets = BTreeMap::new();
        if record.allow_outbound.resource_ids.is_empty() {
            return Ok((targets, ResultObject::new()));
        }

        let (rules, result) = self.source_rules(&record.resource_id).await?;
        for target in &record.allow_outbound.resource_ids {
            let target = target.trim();
            if target.is_empty() || same_id(target, &record.resource_id) {
                continue;
            }
            if !targets.keys().any(|t: &String| same_id(t, target)) {
                targets.insert(target.to_string(), rules.clone());
            }
        }
        Ok((targets, result))
    }

    /// What a resource contributes to the targets it calls
    pub async fn source_rules(&self, resource_id: &str) -> Result<(RuleSet, ResultObject)> {
        let mut rules = RuleSet::new();
        let mut result = ResultObject::new();
        let mut subnets = SubnetCache::new(self.inventory.as_ref());
        let mut front_doors = BTreeSet::new();

        self.peer_rules(
            &[(resource_id.to_string(), true)],
            &mut rules,
            &mut front_doors,
            &mut result,
            &mut subnets,
        )
        .await?;
        if !front_doors.is_empty() {
            result.warning(format!(
                "{resource_id} is a front door and cannot be granted outbound access by address"
            ));
        }
        if rules.is_empty() && result.success() {
            result.warning(format!("{resource_id} contributes no rules to its outbound targets"));
        }
        Ok((rules, result))
    }

    /// Whether `record` picks up organization tag `tag` without listing it,
    /// through kind defaults or a subscription-mandatory tag
    pub async fn implicitly_uses_tag(
        &self,
        record: &ResourceDependencyInformation,
        tag: &str,
    ) -> Result<bool> {
        let kind = ResourceKind::from_resource_id(&record.resource_id)?;
        let named = |tags: &[String]| tags.iter().any(|t| t.trim().eq_ignore_ascii_case(tag.trim()));
        if named(self.tags.main_defaults_for(kind).as_slice())
            || (kind.has_scm() && named(self.tags.default_scm_tags.as_slice()))
        {
            return Ok(true);
        }
        if !self.tags.requires_mandatory(kind) {
            return Ok(false);
        }
        let mandatory = self.org_tags.mandatory_subscriptions(tag).await?;
        if mandatory.is_empty() {
            return Ok(false);
        }
        let subscription = record.subscription_id()?;
        Ok(self
            .org_tags
            .subscription_name(&subscription)
            .await?
            .is_some_and(|name| mandatory.iter().any(|m| m.eq_ignore_ascii_case(&name))))
    }

    async fn compute(
        &self,
        record: &ResourceDependencyInformation,
        list: RuleList,
    ) -> Result<(RuleSet, ResultObject)> {
        let kind = ResourceKind::from_resource_id(&record.resource_id)?;
        let (sources, defaults, mandatory) = match list {
            RuleList::Main => (
                &record.allow_inbound.security_restrictions,
                self.tags.main_defaults_for(kind),
                self.tags.requires_mandatory(kind),
            ),
            RuleList::Scm => (
                &record.allow_inbound.scm_security_restrictions,
                self.tags.default_scm_tags.clone(),
                false,
            ),
        };

        let mut rules = RuleSet::new();
        let mut result = ResultObject::new();
        let mut subnets = SubnetCache::new(self.inventory.as_ref());
        let mut front_doors = BTreeSet::new();

        let mut peers: Vec<(String, bool)> = Vec::new();
        for id in &sources.resource_ids {
            push_peer(&mut peers, id, true);
        }
        for id in self
            .store
            .get_resource_ids_where_outbound(&record.resource_id)
            .await?
        {
            push_peer(&mut peers, &id, false);
        }
        peers.retain(|(id, _)| !same_id(id, &record.resource_id));

        self.peer_rules(&peers, &mut rules, &mut front_doors, &mut result, &mut subnets)
            .await?;
        self.front_door_rule(front_doors, &mut rules, &mut result);
        self.cloud_tag_rules(&sources.azure_service_tags, &mut rules, &mut result)
            .await?;
        self.org_tag_rules(
            record,
            &sources.new_day_internal_and_third_party_tags,
            &defaults,
            mandatory,
            &mut rules,
            &mut result,
        )
        .await?;
        self.drop_unknown_subnets(&mut rules, &mut result, &mut subnets)
            .await?;

        debug!(
            "Computed {} {:?} rules for {}",
            rules.len(),
            list,
            record.resource_id
        );
        Ok((rules, result))
    }

    /// Peers flagged `true` were listed explicitly; a missing one is an error.
    /// Inferred peers that vanished only warn.
    async fn peer_rules(
        &self,
        peers: &[(String, bool)],
        rules: &mut RuleSet,
        front_doors: &mut BTreeSet<String>,
        result: &mut ResultObject,
        subnets: &mut SubnetCache<'_>,
    ) -> Result<()> {
        let max_len = self.policy.rule_name_max_len;
        let mut lookups: Vec<(String, bool, ResourceKind)> = Vec::new();

        for (id, explicit) in peers {
            match ResourceKind::from_resource_id(id) {
                Ok(ResourceKind::Subnet) => {
                    let name = resource_id::resource_name(id)?;
                    rules.insert(
                        IpSecurityRestrictionRule::for_subnet(id, &bounded_name(&name, "", max_len))
                            .with_description(format!("Subnet {name}")),
                    );
                }
                Ok(kind) => lookups.push((id.clone(), *explicit, kind)),
                Err(e) => report(result, *explicit, format!("inbound resource {id}: {}", e.user_message())),
            }
        }
        if lookups.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = lookups.iter().map(|(id, _, _)| id.clone()).collect();
        let found: HashMap<String, ResourceMetadata> = self
            .inventory
            .resources_by_ids(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id.trim().to_ascii_lowercase(), m))
            .collect();

        for (id, explicit, kind) in &lookups {
            let Some(meta) = found.get(&id.trim().to_ascii_lowercase()) else {
                report(result, *explicit, format!("inbound resource {id} was not found"));
                continue;
            };
            let applier = match self.appliers.get(*kind) {
                Ok(applier) => applier,
                Err(e) => {
                    report(result, *explicit, format!("inbound resource {id}: {}", e.user_message()));
                    continue;
                }
            };

            let contribution = applier.generate_self_rules(meta, max_len);
            for rule in contribution.rules {
                rules.insert(rule);
            }
            for warning in contribution.warnings {
                result.warning(warning);
            }
            if let Some(fd) = contribution.front_door_id {
                front_doors.insert(fd);
            }

            if kind.is_web_site() && meta.property_str("virtualNetworkSubnetId").is_none() {
                self.naming_convention(meta, rules, result, subnets).await?;
            }
        }
        Ok(())
    }

    /// Subnets named after a VNet-less web site peer (`app`, `snet-app`,
    /// `app-subnet`, ...) are taken as that site's integration subnet
    async fn naming_convention(
        &self,
        peer: &ResourceMetadata,
        rules: &mut RuleSet,
        result: &mut ResultObject,
        subnets: &mut SubnetCache<'_>,
    ) -> Result<()> {
        let pattern = Regex::new(&format!(
            r"(?i)^(snet-|subnet-)?{}(-snet|-subnet)?$",
            regex::escape(&peer.name)
        ))
        .map_err(|e| FenceError::Config(format!("naming pattern for {}: {e}", peer.name)))?;

        let subscription = if peer.subscription_id.is_empty() {
            resource_id::subscription_id(&peer.id)?
        } else {
            peer.subscription_id.clone()
        };

        let matches: Vec<SubnetInfo> = subnets
            .get(&subscription)
            .await?
            .iter()
            .filter(|s| pattern.is_match(&s.name))
            .cloned()
            .collect();
        for subnet in matches {
            let rule = IpSecurityRestrictionRule::for_subnet(
                &subnet.id,
                &bounded_name(&peer.name, "", self.policy.rule_name_max_len),
            )
            .with_description(format!("Web site {} by subnet name", peer.name));
            if rules.insert(rule) {
                result.warning(format!(
                    "subnet {} was matched to web site {} by naming convention",
                    subnet.id, peer.name
                ));
            }
        }
        Ok(())
    }

    fn front_door_rule(
        &self,
        front_doors: BTreeSet<String>,
        rules: &mut RuleSet,
        result: &mut ResultObject,
    ) {
        if front_doors.is_empty() {
            return;
        }
        let limit = self.policy.front_door_max_instances;
        if front_doors.len() > limit {
            warn!("{} front door instances exceed the header limit of {limit}", front_doors.len());
            result.error(
                FenceError::CapacityExceeded {
                    resource: FRONT_DOOR_BACKEND_TAG.to_string(),
                    count: front_doors.len(),
                    limit,
                }
                .to_string(),
            );
            return;
        }

        let mut rule = IpSecurityRestrictionRule::for_address(FRONT_DOOR_BACKEND_TAG, "AzureFrontDoor")
            .with_description(format!("{} front door instance(s)", front_doors.len()));
        rule.tag = Some(TAG_SERVICE_TAG.to_string());
        rule.priority = FRONT_DOOR_PRIORITY;
        rule.headers = Some(BTreeMap::from([(
            FRONT_DOOR_ID_HEADER.to_string(),
            front_doors.into_iter().collect(),
        )]));
        rules.insert(rule);
    }

    async fn cloud_tag_rules(
        &self,
        tags: &[String],
        rules: &mut RuleSet,
        result: &mut ResultObject,
    ) -> Result<()> {
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            match self.cloud_tags.ipv4_prefixes(tag).await? {
                None => result.error(format!("{tag} is not a known cloud service tag")),
                Some(prefixes) if prefixes.is_empty() => {
                    result.warning(format!("cloud service tag {tag} has no IPv4 prefixes"))
                }
                Some(prefixes) => {
                    for (i, prefix) in prefixes.iter().enumerate() {
                        rules.insert(
                            IpSecurityRestrictionRule::for_address(
                                prefix,
                                &bounded_name(tag, &(i + 1).to_string(), self.policy.rule_name_max_len),
                            )
                            .with_description(format!("Service tag {tag}")),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn org_tag_rules(
        &self,
        record: &ResourceDependencyInformation,
        requested: &[String],
        defaults: &[String],
        mandatory: bool,
        rules: &mut RuleSet,
        result: &mut ResultObject,
    ) -> Result<()> {
        let max_len = self.policy.rule_name_max_len;
        let subscription_id = record.subscription_id()?;
        let subscription = self
            .org_tags
            .subscription_name(&subscription_id)
            .await?
            .unwrap_or_default();

        for name in requested.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            match self.org_tags.get(name).await? {
                None => result.error(format!("{name} is not a known organization tag")),
                Some(tag) if !tag.is_allowed_for(&subscription) => result.error(format!(
                    "organization tag {name} is not allowed in subscription {subscription_id}"
                )),
                Some(tag) => {
                    rules.merge(org::rules_for(&tag, max_len));
                }
            }
        }

        for name in defaults
            .iter()
            .map(|t| t.trim())
            .filter(|t| !requested.iter().any(|r| r.trim().eq_ignore_ascii_case(t)))
        {
            match self.org_tags.get(name).await? {
                None => result.warning(format!("default organization tag {name} is not defined")),
                Some(tag) if !tag.is_allowed_for(&subscription) => result.info(format!(
                    "default organization tag {name} skipped for subscription {subscription_id}"
                )),
                Some(tag) => {
                    rules.merge(org::rules_for(&tag, max_len));
                }
            }
        }

        if mandatory && !subscription.is_empty() {
            for tag in self.org_tags.mandatory_for(&subscription).await? {
                rules.merge(org::rules_for(&tag, max_len));
                result.info(format!("mandatory organization tag {} applied", tag.name));
            }
        }
        Ok(())
    }

    async fn drop_unknown_subnets(
        &self,
        rules: &mut RuleSet,
        result: &mut ResultObject,
        subnets: &mut SubnetCache<'_>,
    ) -> Result<()> {
        for subnet in rules.subnet_ids() {
            if self.policy.subnet_allow_listed(&subnet) {
                continue;
            }
            let known = match resource_id::subscription_id(&subnet) {
                Ok(subscription) => subnets
                    .get(&subscription)
                    .await?
                    .iter()
                    .any(|s| same_id(&s.id, &subnet)),
                Err(_) => false,
            };
            if !known {
                rules.remove(&RuleKey::Subnet(subnet.trim().to_ascii_lowercase()));
                result.warning(format!(
                    "subnet {subnet} was not found in its subscription and was left out"
                ));
            }
        }
        Ok(())
    }
}

fn push_peer(peers: &mut Vec<(String, bool)>, id: &str, explicit: bool) {
    let id = id.trim();
    if id.is_empty() || peers.iter().any(|(p, _)| same_id(p, id)) {
        return;
    }
    peers.push((id.to_string(), explicit));
}

fn report(result: &mut ResultObject, explicit: bool, message: String) {
    if explicit {
        result.error(message);
    } else {
        result.warning(message);
    }
}
