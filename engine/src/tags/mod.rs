//! Service-tag resolvers
//!
//! - cloud: published tags from the management API, TTL cached, IPv4 only
//! - org: organization tags from the organization store, subscription scoped

pub mod cloud;
pub mod org;

pub use cloud::{ArmServiceTagSource, CloudServiceTag, CloudTagResolver, CloudTagSource};
pub use org::OrgTagResolver;
