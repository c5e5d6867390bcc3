//! netfence Graph Store — dependency records and organization collections
//!
//! Backends:
//! - SQLite: one table per collection, JSON documents, `json_each` reverse queries
//! - Memory: BTreeMap collections for previews and tests

mod memory;
mod sqlite;
mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DependencyStore, OrganizationStore};
