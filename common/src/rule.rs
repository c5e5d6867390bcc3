//! IP security restriction rules and rule sets
//!
//! A rule's identity is its subnet id when present, otherwise its address,
//! compared case-insensitively. Name, priority, tag and headers are payload.

use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

pub const ACTION_ALLOW: &str = "Allow";
pub const TAG_DEFAULT: &str = "Default";
pub const TAG_SERVICE_TAG: &str = "ServiceTag";
pub const DEFAULT_PRIORITY: i32 = 300;

/// Identity of a rule inside a set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKey {
    Subnet(String),
    Address(String),
}

/// One restriction rule, shaped like the web site `ipSecurityRestrictions` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSecurityRestrictionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnet_subnet_resource_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, Vec<String>>>,
}

fn default_action() -> String {
    ACTION_ALLOW.to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl IpSecurityRestrictionRule {
    /// Allow rule for an address or CIDR. Bare IPv4 addresses are widened to `/32`.
    pub fn for_address(address: &str, name: &str) -> Self {
        let address = address.trim();
        let ip = if address.contains('/') || address.contains(':') || !looks_like_ipv4(address) {
            address.to_string()
        } else {
            format!("{address}/32")
        };
        Self {
            ip_address: Some(ip),
            vnet_subnet_resource_id: None,
            name: name.to_string(),
            action: default_action(),
            priority: DEFAULT_PRIORITY,
            tag: Some(TAG_DEFAULT.to_string()),
            description: None,
            headers: None,
        }
    }

    pub fn for_subnet(subnet_id: &str, name: &str) -> Self {
        Self {
            ip_address: None,
            vnet_subnet_resource_id: Some(subnet_id.trim().to_string()),
            name: name.to_string(),
            action: default_action(),
            priority: DEFAULT_PRIORITY,
            tag: Some(TAG_DEFAULT.to_string()),
            description: None,
            headers: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn key(&self) -> RuleKey {
        match self.vnet_subnet_resource_id.as_deref() {
            Some(subnet) if !subnet.trim().is_empty() => {
                RuleKey::Subnet(subnet.trim().to_ascii_lowercase())
            }
            _ => RuleKey::Address(
                self.ip_address
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase(),
            ),
        }
    }

    pub fn is_subnet(&self) -> bool {
        matches!(self.key(), RuleKey::Subnet(_))
    }

    pub fn is_service_tag(&self) -> bool {
        self.tag
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(TAG_SERVICE_TAG))
    }
}

impl PartialEq for IpSecurityRestrictionRule {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for IpSecurityRestrictionRule {}

impl Hash for IpSecurityRestrictionRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

fn looks_like_ipv4(s: &str) -> bool {
    s.split('.').count() == 4 && s.split('.').all(|p| p.parse::<u8>().is_ok())
}

/// Rule name bounded to `max_len` characters with `suffix` kept intact.
pub fn bounded_name(base: &str, suffix: &str, max_len: usize) -> String {
    let room = max_len.saturating_sub(suffix.chars().count());
    let mut name: String = base.chars().take(room).collect();
    name.push_str(suffix);
    name
}

/// Set of rules keyed by identity. The first rule inserted for an identity wins;
/// iteration is ordered by key so equal inputs produce equal output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<RuleKey, IpSecurityRestrictionRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a rule with the same identity is already present
    pub fn insert(&mut self, rule: IpSecurityRestrictionRule) -> bool {
        match self.rules.entry(rule.key()) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(rule);
                true
            }
        }
    }

    /// Union with another set, returning how many rules were new
    pub fn merge(&mut self, other: RuleSet) -> usize {
        let mut added = 0;
        for rule in other.rules.into_values() {
            if self.insert(rule) {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&mut self, key: &RuleKey) -> Option<IpSecurityRestrictionRule> {
        self.rules.remove(key)
    }

    /// Drop every rule whose identity appears in `other`
    pub fn subtract(&mut self, other: &RuleSet) {
        for key in other.rules.keys() {
            self.rules.remove(key);
        }
    }

    pub fn contains(&self, rule: &IpSecurityRestrictionRule) -> bool {
        self.rules.contains_key(&rule.key())
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&IpSecurityRestrictionRule) -> bool) {
        self.rules.retain(|_, r| keep(r));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpSecurityRestrictionRule> {
        self.rules.values()
    }

    pub fn to_vec(&self) -> Vec<IpSecurityRestrictionRule> {
        self.rules.values().cloned().collect()
    }

    /// Address rules that are literal IPs or CIDRs (service-tag rules excluded)
    pub fn ip_addresses(&self) -> Vec<String> {
        self.rules
            .values()
            .filter(|r| !r.is_subnet() && !r.is_service_tag())
            .filter_map(|r| r.ip_address.clone())
            .collect()
    }

    pub fn subnet_ids(&self) -> Vec<String> {
        self.rules
            .values()
            .filter_map(|r| r.vnet_subnet_resource_id.clone())
            .filter(|s| !s.trim().is_empty())
            .collect()
    }

    pub fn subnet_keys(&self) -> BTreeSet<String> {
        self.rules
            .keys()
            .filter_map(|k| match k {
                RuleKey::Subnet(s) => Some(s.clone()),
                RuleKey::Address(_) => None,
            })
            .collect()
    }
}

impl FromIterator<IpSecurityRestrictionRule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = IpSecurityRestrictionRule>>(iter: I) -> Self {
        let mut set = RuleSet::new();
        for rule in iter {
            set.insert(rule);
        }
        set
    }
}

impl IntoIterator for RuleSet {
    type Item = IpSecurityRestrictionRule;
    type IntoIter = btree_map::IntoValues<RuleKey, IpSecurityRestrictionRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ignores_name_and_case() {
        let a = IpSecurityRestrictionRule::for_address("10.0.0.1", "first");
        let mut b = IpSecurityRestrictionRule::for_address("10.0.0.1/32", "second");
        b.priority = 100;
        assert_eq!(a, b);

        let s1 = IpSecurityRestrictionRule::for_subnet("/subscriptions/S/x/Subnets/A", "a");
        let s2 = IpSecurityRestrictionRule::for_subnet("/subscriptions/s/x/subnets/a", "b");
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_subnet_wins_over_address_for_identity() {
        let mut rule = IpSecurityRestrictionRule::for_subnet("/sub/a", "a");
        rule.ip_address = Some("10.0.0.1/32".into());
        assert!(matches!(rule.key(), RuleKey::Subnet(_)));
    }

    #[test]
    fn test_set_dedupes_first_wins() {
        let mut set = RuleSet::new();
        assert!(set.insert(IpSecurityRestrictionRule::for_address("1.2.3.4", "one")));
        assert!(!set.insert(IpSecurityRestrictionRule::for_address("1.2.3.4/32", "two")));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().name, "one");
    }

    #[test]
    fn test_merge_and_subtract() {
        let mut a: RuleSet = ["1.1.1.1", "2.2.2.2"]
            .iter()
            .map(|ip| IpSecurityRestrictionRule::for_address(ip, ip))
            .collect();
        let b: RuleSet = ["2.2.2.2", "3.3.3.3"]
            .iter()
            .map(|ip| IpSecurityRestrictionRule::for_address(ip, "x"))
            .collect();
        assert_eq!(a.merge(b.clone()), 1);
        assert_eq!(a.len(), 3);
        a.subtract(&b);
        assert_eq!(a.ip_addresses(), vec!["1.1.1.1/32".to_string()]);
    }

    #[test]
    fn test_ip_addresses_skip_service_tags() {
        let mut set = RuleSet::new();
        let mut fd = IpSecurityRestrictionRule::for_address("AzureFrontDoor.Backend", "fd");
        fd.tag = Some(TAG_SERVICE_TAG.into());
        set.insert(fd);
        set.insert(IpSecurityRestrictionRule::for_subnet("/sub/a", "a"));
        assert!(set.ip_addresses().is_empty());
        assert_eq!(set.subnet_ids(), vec!["/sub/a".to_string()]);
    }

    #[test]
    fn test_bounded_name() {
        assert_eq!(bounded_name("AzureCloud.westeurope", "3", 10), "AzureClou3");
        assert_eq!(bounded_name("short", "12", 32), "short12");
    }

    #[test]
    fn test_wire_shape() {
        let rule = IpSecurityRestrictionRule::for_address("1.2.3.4", "pip");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["ipAddress"], "1.2.3.4/32");
        assert_eq!(json["action"], "Allow");
        assert!(json.get("vnetSubnetResourceId").is_none());

        let parsed: IpSecurityRestrictionRule = serde_json::from_value(serde_json::json!({
            "vnetSubnetResourceId": "/sub/a",
            "name": "a",
            "vnetTrafficTag": 0
        }))
        .unwrap();
        assert!(parsed.is_subnet());
        assert_eq!(parsed.priority, DEFAULT_PRIORITY);
    }
}
