//! SQLite document store
//!
//! Each collection is a table of JSON documents keyed by business key.
//! Reverse-edge queries walk the JSON arrays with `json_each`.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use netfence_common::resource_id::document_id;
use netfence_common::{
    FenceError, ResourceDependencyInformation, Result, ServiceTag, Subscription,
};

use crate::store::{DependencyStore, OrganizationStore};

fn store_err(e: rusqlite::Error) -> FenceError {
    FenceError::Store(e.to_string())
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS dependencies (
        document_id TEXT PRIMARY KEY,
        resource_id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS org_subscriptions (
        id_key TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS org_tags (
        name_key TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dependencies_resource ON dependencies(resource_id);";

const WHERE_INBOUND: &str = "SELECT d.body FROM dependencies d
    WHERE EXISTS (SELECT 1 FROM json_each(d.body, '$.allowInbound.securityRestrictions.resourceIds') j
                  WHERE lower(trim(j.value)) = lower(trim(?1)))
       OR EXISTS (SELECT 1 FROM json_each(d.body, '$.allowInbound.scmSecurityRestrictions.resourceIds') j
                  WHERE lower(trim(j.value)) = lower(trim(?1)))
    ORDER BY d.document_id";

const WHERE_OUTBOUND: &str = "SELECT d.body FROM dependencies d
    WHERE EXISTS (SELECT 1 FROM json_each(d.body, '$.allowOutbound.resourceIds') j
                  WHERE lower(trim(j.value)) = lower(trim(?1)))
    ORDER BY d.document_id";

const WHERE_TAG: &str = "SELECT d.body FROM dependencies d
    WHERE EXISTS (SELECT 1 FROM json_each(d.body, '$.allowInbound.securityRestrictions.newDayInternalAndThirdPartyTags') j
                  WHERE lower(j.value) = lower(?1))
       OR EXISTS (SELECT 1 FROM json_each(d.body, '$.allowInbound.scmSecurityRestrictions.newDayInternalAndThirdPartyTags') j
                  WHERE lower(j.value) = lower(?1))
    ORDER BY d.document_id";

/// Dependency graph and organization collections in one SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FenceError::Store(format!("cannot create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(db_path).map_err(store_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(store_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FenceError::Store(format!("Lock error: {e}")))
    }

    fn query_records(&self, sql: &str, arg: &str) -> Result<Vec<ResourceDependencyInformation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![arg], |row| row.get::<_, String>(0))
            .map_err(store_err)?;

        let mut records = Vec::new();
        for row in rows {
            let body = row.map_err(store_err)?;
            records.push(serde_json::from_str(&body)?);
        }
        Ok(records)
    }

    fn query_bodies<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row.map_err(store_err)?)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DependencyStore for SqliteStore {
    async fn upsert(&self, record: &ResourceDependencyInformation) -> Result<()> {
        let body = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dependencies (document_id, resource_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(document_id) DO UPDATE SET
                resource_id = excluded.resource_id,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                record.document_id(),
                record.resource_id,
                body,
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(store_err)?;
        debug!("Upserted dependency record {}", record.resource_id);
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceDependencyInformation>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM dependencies WHERE document_id = ?1",
                params![document_id(resource_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(FenceError::from))
            .transpose()
    }

    async fn delete(&self, resource_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM dependencies WHERE document_id = ?1",
                params![document_id(resource_id)],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    async fn get_all(&self) -> Result<Vec<ResourceDependencyInformation>> {
        self.query_bodies("SELECT body FROM dependencies ORDER BY document_id")
    }

    async fn get_first(&self) -> Result<Option<ResourceDependencyInformation>> {
        Ok(self
            .query_bodies("SELECT body FROM dependencies ORDER BY document_id LIMIT 1")?
            .into_iter()
            .next())
    }

    async fn get_configs_where_inbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.query_records(WHERE_INBOUND, resource_id)
    }

    async fn get_configs_where_outbound(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceDependencyInformation>> {
        self.query_records(WHERE_OUTBOUND, resource_id)
    }

    async fn find_by_tag_name(&self, tag: &str) -> Result<Vec<ResourceDependencyInformation>> {
        self.query_records(WHERE_TAG, tag)
    }
}

#[async_trait]
impl OrganizationStore for SqliteStore {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.query_bodies("SELECT body FROM org_subscriptions ORDER BY id_key")
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let body = serde_json::to_string(subscription)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO org_subscriptions (id_key, body) VALUES (?1, ?2)",
            params![subscription.id.to_ascii_lowercase(), body],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_subscription(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM org_subscriptions WHERE id_key = ?1",
                params![id.to_ascii_lowercase()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    async fn list_tags(&self) -> Result<Vec<ServiceTag>> {
        self.query_bodies("SELECT body FROM org_tags ORDER BY name_key")
    }

    async fn get_tag(&self, name: &str) -> Result<Option<ServiceTag>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM org_tags WHERE name_key = ?1",
                params![name.to_ascii_lowercase()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(FenceError::from))
            .transpose()
    }

    async fn upsert_tag(&self, tag: &ServiceTag) -> Result<()> {
        let body = serde_json::to_string(tag)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO org_tags (name_key, body) VALUES (?1, ?2)",
            params![tag.name.to_ascii_lowercase(), body],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_tag(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM org_tags WHERE name_key = ?1",
                params![name.to_ascii_lowercase()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }
}
