//! netfence shared model
//!
//! Dependency records, restriction rules with set identity, the result
//! accumulator and the error kinds used across the workspace.

pub mod error;
pub mod model;
pub mod resource_id;
pub mod result;
pub mod rule;

pub use error::{FenceError, Result};
pub use model::{
    AllowInbound, AllowOutbound, AllowedSubscription, NetworkRestrictionSettings,
    OrganizationSettings, ResourceDependencyInformation, RestrictionSources, ServiceTag,
    Subscription,
};
pub use result::{PrintOut, ResultObject};
pub use rule::{IpSecurityRestrictionRule, RuleKey, RuleSet};
