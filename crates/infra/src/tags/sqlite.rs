//! SQLite-backed vendor tags (`vendor_tags` table).

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use wallettaser_core::{TenantId, VendorTag};

use super::{TagStoreError, VendorTagStore};
use crate::db::{from_micros, to_micros};

#[derive(Debug, Clone)]
pub struct SqliteVendorTagStore {
    pool: SqlitePool,
}

impl SqliteVendorTagStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn storage_error(operation: &str) -> impl Fn(sqlx::Error) -> TagStoreError + '_ {
    move |e| TagStoreError::Storage(format!("sqlx error in {operation}: {e}"))
}

#[async_trait]
impl VendorTagStore for SqliteVendorTagStore {
    #[instrument(skip(self, tag), fields(tenant_id = %tenant_id, vendor = %tag.vendor), err)]
    async fn upsert(&self, tenant_id: &TenantId, tag: &VendorTag) -> Result<(), TagStoreError> {
        sqlx::query(
            r#"
            INSERT INTO vendor_tags (tenant_id, vendor, classification, last_updated)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id, vendor) DO UPDATE SET
                classification = excluded.classification,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(&tag.vendor)
        .bind(tag.classification.as_str())
        .bind(to_micros(tag.last_updated))
        .execute(&self.pool)
        .await
        .map_err(storage_error("upsert_vendor_tag"))?;

        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        vendor: &str,
    ) -> Result<Option<VendorTag>, TagStoreError> {
        let row = sqlx::query(
            r#"
            SELECT vendor, classification, last_updated
            FROM vendor_tags
            WHERE tenant_id = ?1 AND vendor = ?2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(vendor)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("get_vendor_tag"))?;

        row.map(|r| row_to_tag(&r)).transpose()
    }

    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<VendorTag>, TagStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT vendor, classification, last_updated
            FROM vendor_tags
            WHERE tenant_id = ?1
            ORDER BY vendor ASC
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("list_vendor_tags"))?;

        rows.iter().map(row_to_tag).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn delete(&self, tenant_id: &TenantId, vendor: &str) -> Result<bool, TagStoreError> {
        let result = sqlx::query("DELETE FROM vendor_tags WHERE tenant_id = ?1 AND vendor = ?2")
            .bind(tenant_id.as_str())
            .bind(vendor)
            .execute(&self.pool)
            .await
            .map_err(storage_error("delete_vendor_tag"))?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_tag(row: &SqliteRow) -> Result<VendorTag, TagStoreError> {
    let decode = storage_error("decode_vendor_tag");
    let classification: String = row.try_get("classification").map_err(&decode)?;
    let last_updated: i64 = row.try_get("last_updated").map_err(&decode)?;

    Ok(VendorTag {
        vendor: row.try_get("vendor").map_err(&decode)?,
        classification: classification
            .parse()
            .map_err(|_| TagStoreError::Storage("corrupt vendor tag classification".into()))?,
        last_updated: from_micros(last_updated)
            .ok_or_else(|| TagStoreError::Storage("corrupt vendor tag timestamp".into()))?,
    })
}
