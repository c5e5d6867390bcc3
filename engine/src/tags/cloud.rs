//! Cloud-native service tags, cached process-wide

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use netfence_access::RestApi;
use netfence_common::Result;

use crate::cache::TtlCache;

const SERVICE_TAGS_API_VERSION: &str = "2023-09-01";

/// Published tag with its address prefixes (IPv4 and IPv6 mixed)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CloudServiceTag {
    pub name: String,
    pub address_prefixes: Vec<String>,
}

#[async_trait]
pub trait CloudTagSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CloudServiceTag>>;
}

#[derive(Deserialize)]
struct ServiceTagDocument {
    #[serde(default)]
    values: Vec<ServiceTagEntry>,
}

#[derive(Deserialize)]
struct ServiceTagEntry {
    name: String,
    #[serde(default)]
    properties: ServiceTagProperties,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceTagProperties {
    #[serde(default)]
    address_prefixes: Vec<String>,
}

/// Service-tag discovery endpoint of the management API
pub struct ArmServiceTagSource {
    rest: Arc<dyn RestApi>,
    url: String,
}

impl ArmServiceTagSource {
    pub fn new(
        rest: Arc<dyn RestApi>,
        management_endpoint: &str,
        subscription_id: &str,
        location: &str,
    ) -> Self {
        let url = format!(
            "{}/subscriptions/{subscription_id}/providers/Microsoft.Network/locations/{location}/serviceTags?api-version={SERVICE_TAGS_API_VERSION}",
            management_endpoint.trim_end_matches('/')
        );
        Self { rest, url }
    }
}

#[async_trait]
impl CloudTagSource for ArmServiceTagSource {
    async fn fetch(&self) -> Result<Vec<CloudServiceTag>> {
        let value = self.rest.get(&self.url).await?;
        let document: ServiceTagDocument = serde_json::from_value(value)?;
        Ok(document
            .values
            .into_iter()
            .map(|entry| CloudServiceTag {
                name: entry.name,
                address_prefixes: entry.properties.address_prefixes,
            })
            .collect())
    }
}

type TagIndex = HashMap<String, CloudServiceTag>;

/// Resolves cloud tag names to IPv4 prefixes through a TTL cache
pub struct CloudTagResolver {
    source: Arc<dyn CloudTagSource>,
    cache: TtlCache<TagIndex>,
}

impl CloudTagResolver {
    pub fn new(source: Arc<dyn CloudTagSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: TtlCache::new(ttl),
        }
    }

    async fn index(&self) -> Result<Arc<TagIndex>> {
        self.cache
            .get_or_populate(|| async {
                let tags = self.source.fetch().await?;
                info!("Loaded {} cloud service tags", tags.len());
                Ok(tags
                    .into_iter()
                    .map(|t| (t.name.to_ascii_lowercase(), t))
                    .collect())
            })
            .await
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.index().await?.contains_key(&name.trim().to_ascii_lowercase()))
    }

    /// IPv4 prefixes of a tag, `None` when the tag is unknown
    pub async fn ipv4_prefixes(&self, name: &str) -> Result<Option<Vec<String>>> {
        let index = self.index().await?;
        Ok(index
            .get(&name.trim().to_ascii_lowercase())
            .map(|tag| {
                tag.address_prefixes
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| is_ipv4(p))
                    .map(str::to_string)
                    .collect()
            }))
    }
}

fn is_ipv4(prefix: &str) -> bool {
    prefix.parse::<Ipv4Net>().is_ok() || prefix.parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloudTags;
    use netfence_access::Method;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_filters_ipv6_and_is_case_insensitive() {
        let source = FakeCloudTags::new(vec![CloudServiceTag {
            name: "AzureFrontDoor.Backend".into(),
            address_prefixes: vec![
                "13.73.248.16/29".into(),
                "2603:1030:21:7::/64".into(),
                "20.21.37.40".into(),
            ],
        }]);
        let resolver = CloudTagResolver::new(source.clone(), Duration::from_secs(60));

        let prefixes = resolver
            .ipv4_prefixes("azurefrontdoor.backend")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prefixes, vec!["13.73.248.16/29", "20.21.37.40"]);
        assert!(resolver.exists("AZUREFRONTDOOR.BACKEND").await.unwrap());
        assert!(resolver.ipv4_prefixes("Nope").await.unwrap().is_none());
        assert_eq!(source.fetches(), 1);
    }

    struct Document;

    #[async_trait]
    impl RestApi for Document {
        async fn send(&self, method: Method, url: &str, _body: Option<Value>) -> Result<Value> {
            assert_eq!(method, Method::Get);
            assert!(url.ends_with(
                "/subscriptions/sub/providers/Microsoft.Network/locations/westeurope/serviceTags?api-version=2023-09-01"
            ));
            Ok(json!({"values": [
                {"name": "Storage", "properties": {"addressPrefixes": ["20.0.0.0/16"]}},
                {"name": "Empty"}
            ]}))
        }
    }

    #[tokio::test]
    async fn test_arm_source_parses_document() {
        let source = ArmServiceTagSource::new(
            Arc::new(Document),
            "https://management.azure.com",
            "sub",
            "westeurope",
        );
        let tags = source.fetch().await.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].address_prefixes, vec!["20.0.0.0/16"]);
        assert!(tags[1].address_prefixes.is_empty());
    }
}
