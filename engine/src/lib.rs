//! netfence Engine — rule generation, restriction appliers and orchestration
//!
//! - Resolvers: cloud service tags (cached) and organization tags
//! - Inventory: Resource Graph metadata, subnets and deployment slots
//! - Rules: inbound/SCM/outbound rule sets computed from the dependency graph
//! - Appliers: one per resource kind, overwrite and append against live config
//! - Coordinator: validate, persist, overwrite, fan out, merge

pub mod appliers;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod inventory;
pub mod kinds;
pub mod rules;
pub mod tags;
pub mod validation;

#[cfg(test)]
mod testing;

pub use coordinator::{Completion, Coordinator, Outcome, Stage};
