//! netfence configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use netfence_access::RetryPolicy;
use netfence_common::OrganizationSettings;

use crate::kinds::ResourceKind;

const DEFAULT_CONFIG_PATH: &str = "/etc/netfence/config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetfenceConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Organization subscriptions and tags written when the store is empty
    #[serde(default)]
    pub seed: OrganizationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `compact` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            db_path: default_db_path(),
            fan_out_concurrency: default_fan_out_concurrency(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    /// Region queried for the published service-tag document
    #[serde(default = "default_service_tag_location")]
    pub service_tag_location: String,
    /// Subscription used for service-tag discovery
    #[serde(default)]
    pub service_tag_subscription: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            management_endpoint: default_management_endpoint(),
            authority: default_authority(),
            tenant_id: String::new(),
            client_id: String::new(),
            service_tag_location: default_service_tag_location(),
            service_tag_subscription: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_seconds")]
    pub base_seconds: u64,
    #[serde(default = "default_max_jitter")]
    pub max_jitter: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_seconds: default_base_seconds(),
            max_jitter: default_max_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_seconds: self.base_seconds,
            max_jitter: self.max_jitter.max(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagsConfig {
    #[serde(default = "default_cache_ttl_minutes")]
    pub cache_ttl_minutes: u64,
    /// Organization tags always requested for the main rules, keyed by resource type
    #[serde(default = "default_main_tags")]
    pub default_main_tags: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_scm_tags")]
    pub default_scm_tags: Vec<String>,
    /// Resource types that receive mandatory organization tags
    #[serde(default = "default_mandatory_resource_types")]
    pub mandatory_resource_types: Vec<String>,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_minutes: default_cache_ttl_minutes(),
            default_main_tags: default_main_tags(),
            default_scm_tags: default_scm_tags(),
            mandatory_resource_types: default_mandatory_resource_types(),
        }
    }
}

impl TagsConfig {
    pub fn main_defaults_for(&self, kind: ResourceKind) -> Vec<String> {
        self.default_main_tags
            .iter()
            .find(|(ty, _)| ty.eq_ignore_ascii_case(kind.type_name()))
            .map(|(_, tags)| tags.clone())
            .unwrap_or_default()
    }

    pub fn requires_mandatory(&self, kind: ResourceKind) -> bool {
        self.mandatory_resource_types
            .iter()
            .any(|ty| ty.eq_ignore_ascii_case(kind.type_name()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Subscription ids that may reference each other. Subscriptions missing
    /// from every group may only reference themselves.
    #[serde(default)]
    pub subscription_groups: Vec<Vec<String>>,
    /// Subnets accepted without an inventory lookup
    #[serde(default)]
    pub allowed_cross_subscription_subnets: Vec<String>,
    #[serde(default = "default_rule_name_max_len")]
    pub rule_name_max_len: usize,
    #[serde(default = "default_front_door_max_instances")]
    pub front_door_max_instances: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            subscription_groups: Vec::new(),
            allowed_cross_subscription_subnets: Vec::new(),
            rule_name_max_len: default_rule_name_max_len(),
            front_door_max_instances: default_front_door_max_instances(),
        }
    }
}

impl PolicyConfig {
    pub fn same_group(&self, a: &str, b: &str) -> bool {
        if a.eq_ignore_ascii_case(b) {
            return true;
        }
        self.subscription_groups.iter().any(|group| {
            group.iter().any(|s| s.eq_ignore_ascii_case(a))
                && group.iter().any(|s| s.eq_ignore_ascii_case(b))
        })
    }

    pub fn subnet_allow_listed(&self, subnet_id: &str) -> bool {
        self.allowed_cross_subscription_subnets
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(subnet_id.trim()))
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "compact".into()
}
fn default_db_path() -> String {
    "/var/lib/netfence/netfence.db".into()
}
fn default_fan_out_concurrency() -> usize {
    8
}
fn default_http_timeout() -> u64 {
    100
}
fn default_management_endpoint() -> String {
    "https://management.azure.com".into()
}
fn default_authority() -> String {
    "https://login.microsoftonline.com".into()
}
fn default_service_tag_location() -> String {
    "westeurope".into()
}
fn default_max_attempts() -> u32 {
    9
}
fn default_base_seconds() -> u64 {
    2
}
fn default_max_jitter() -> u32 {
    5
}
fn default_cache_ttl_minutes() -> u64 {
    24 * 60
}
fn default_main_tags() -> BTreeMap<String, Vec<String>> {
    let mut tags = BTreeMap::new();
    tags.insert(
        ResourceKind::WebSite.type_name().to_string(),
        vec!["Monitoring".to_string()],
    );
    tags
}
fn default_scm_tags() -> Vec<String> {
    vec!["Operations".into(), "JumpHost".into(), "VPN".into()]
}
fn default_mandatory_resource_types() -> Vec<String> {
    vec![ResourceKind::WebSite.type_name().to_string()]
}
fn default_rule_name_max_len() -> usize {
    32
}
fn default_front_door_max_instances() -> usize {
    8
}

/// Load configuration from file or use defaults
pub fn load_config() -> Result<NetfenceConfig> {
    let config_path =
        std::env::var("NETFENCE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&config_path).exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {config_path}"))?;
        let config: NetfenceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {config_path}"))?;
        Ok(config)
    } else {
        tracing::warn!("Config file not found at {config_path}, using defaults");
        Ok(NetfenceConfig::default())
    }
}
