//! Organization-defined tags: lookup, subscription scoping and rule expansion

use std::sync::Arc;

use netfence_common::rule::bounded_name;
use netfence_common::{IpSecurityRestrictionRule, Result, RuleSet, ServiceTag};
use netfence_graph::OrganizationStore;

pub struct OrgTagResolver {
    store: Arc<dyn OrganizationStore>,
}

impl OrgTagResolver {
    pub fn new(store: Arc<dyn OrganizationStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, name: &str) -> Result<Option<ServiceTag>> {
        self.store.get_tag(name.trim()).await
    }

    /// Organization name of a subscription id, if registered
    pub async fn subscription_name(&self, subscription_id: &str) -> Result<Option<String>> {
        self.store.subscription_name(subscription_id).await
    }

    /// Tags flagged mandatory for the named subscription
    pub async fn mandatory_for(&self, subscription_name: &str) -> Result<Vec<ServiceTag>> {
        Ok(self
            .store
            .list_tags()
            .await?
            .into_iter()
            .filter(|t| t.is_mandatory_for(subscription_name))
            .collect())
    }

    /// Subscription names a tag is mandatory for
    pub async fn mandatory_subscriptions(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .get(tag)
            .await?
            .map(|t| {
                t.allowed_subscriptions
                    .into_iter()
                    .filter(|s| s.is_mandatory)
                    .map(|s| s.subscription_name)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Address rules named `{tag}{n}` plus one subnet rule per listed subnet
pub fn rules_for(tag: &ServiceTag, max_name_len: usize) -> RuleSet {
    let description = format!("Organization tag {}", tag.name);
    let addresses = tag
        .address_prefixes
        .iter()
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(|(i, prefix)| {
            IpSecurityRestrictionRule::for_address(
                prefix,
                &bounded_name(&tag.name, &(i + 1).to_string(), max_name_len),
            )
        });
    let subnets = tag
        .subnet_ids
        .iter()
        .filter(|s| !s.trim().is_empty())
        .enumerate()
        .map(|(i, subnet)| {
            IpSecurityRestrictionRule::for_subnet(
                subnet,
                &bounded_name(&tag.name, &format!("-snet{}", i + 1), max_name_len),
            )
        });
    addresses
        .chain(subnets)
        .map(|r| r.with_description(description.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netfence_common::{AllowedSubscription, Subscription};
    use netfence_graph::MemoryStore;

    fn tag(name: &str, subs: &[(&str, bool)]) -> ServiceTag {
        ServiceTag {
            name: name.into(),
            address_prefixes: vec!["10.0.0.0/24".into(), "10.0.1.4".into()],
            subnet_ids: vec![
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v/subnets/ops".into(),
            ],
            allowed_subscriptions: subs
                .iter()
                .map(|(n, m)| AllowedSubscription {
                    subscription_name: n.to_string(),
                    is_mandatory: *m,
                })
                .collect(),
        }
    }

    #[test]
    fn test_rules_for_tag() {
        let rules = rules_for(&tag("AVeryLongOperationsTagNameThatOverflows", &[]), 32);
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.name.chars().count() <= 32));
        assert!(rules.ip_addresses().contains(&"10.0.1.4/32".to_string()));
        assert_eq!(rules.subnet_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_mandatory_lookup() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_subscription(&Subscription {
                id: "sub-1".into(),
                name: "Production".into(),
            })
            .await
            .unwrap();
        store
            .upsert_tag(&tag("Monitoring", &[("Production", true)]))
            .await
            .unwrap();
        store
            .upsert_tag(&tag("Jump", &[("Production", false)]))
            .await
            .unwrap();

        let resolver = OrgTagResolver::new(store);
        assert_eq!(
            resolver.subscription_name("SUB-1").await.unwrap().as_deref(),
            Some("Production")
        );
        let mandatory = resolver.mandatory_for("production").await.unwrap();
        assert_eq!(mandatory.len(), 1);
        assert_eq!(mandatory[0].name, "Monitoring");
        assert_eq!(
            resolver.mandatory_subscriptions("monitoring").await.unwrap(),
            vec!["Production"]
        );
        assert!(resolver.mandatory_subscriptions("Jump").await.unwrap().is_empty());
    }
}
