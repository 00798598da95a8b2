//! PostgreSQL overlay store implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::types::{ContentEntry, ContentRef, Link, LinkKey, OverlayRecord, Scope};

use super::{OverlayStore, StoreSnapshot};

/// PostgreSQL-backed overlay store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> OverlayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> OverlayResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> OverlayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS overlays (
                name TEXT PRIMARY KEY,
                generation BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS overlay_content (
                overlay TEXT NOT NULL REFERENCES overlays(name) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                content_ref TEXT NOT NULL,
                size BIGINT NOT NULL,
                digest TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (overlay, filename)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Links are not foreign-keyed to overlays: stale links are tolerated
        // until a redeploy acts on them.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS overlay_links (
                scope TEXT NOT NULL,
                overlay TEXT NOT NULL,
                deployment TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (scope, overlay, deployment)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_overlay_links_overlay
            ON overlay_links (overlay)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_entry(row: &PgRow) -> OverlayResult<(String, ContentEntry)> {
        let overlay: String = row.get("overlay");
        let size: i64 = row.get("size");

        let entry = ContentEntry {
            filename: row.get("filename"),
            content: ContentRef::new(row.get::<String, _>("content_ref")),
            size: u64::try_from(size)
                .map_err(|_| OverlayError::Serialisation(format!("negative size {size}")))?,
            digest: row.get("digest"),
            updated_at: row.get("updated_at"),
        };

        Ok((overlay, entry))
    }

    fn row_to_link(row: &PgRow) -> OverlayResult<Link> {
        let scope: String = row.get("scope");

        Ok(Link {
            key: LinkKey::new(
                Scope::from_key(&scope)?,
                row.get::<String, _>("overlay"),
                row.get::<String, _>("deployment"),
            ),
            enabled: row.get("enabled"),
        })
    }
}

fn to_i64(value: u64, what: &str) -> OverlayResult<i64> {
    i64::try_from(value).map_err(|_| OverlayError::Serialisation(format!("{what} out of range")))
}

#[async_trait]
impl OverlayStore for PostgresStore {
    async fn insert_overlay(&self, name: &str, created_at: DateTime<Utc>) -> OverlayResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO overlays (name, generation, created_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OverlayError::AlreadyExists(name.to_owned()));
        }

        Ok(())
    }

    async fn delete_overlay(&self, name: &str, cascade_links: bool) -> OverlayResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM overlays WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OverlayError::OverlayNotFound(name.to_owned()));
        }

        if cascade_links {
            sqlx::query("DELETE FROM overlay_links WHERE overlay = $1")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_entry(
        &self,
        overlay: &str,
        generation: u64,
        entry: &ContentEntry,
    ) -> OverlayResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE overlays SET generation = $1 WHERE name = $2")
            .bind(to_i64(generation, "generation")?)
            .bind(overlay)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OverlayError::OverlayNotFound(overlay.to_owned()));
        }

        sqlx::query(
            r#"
            INSERT INTO overlay_content (overlay, filename, content_ref, size, digest, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (overlay, filename) DO UPDATE
            SET content_ref = EXCLUDED.content_ref,
                size = EXCLUDED.size,
                digest = EXCLUDED.digest,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(overlay)
        .bind(&entry.filename)
        .bind(entry.content.as_str())
        .bind(to_i64(entry.size, "size")?)
        .bind(&entry.digest)
        .bind(entry.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_entry(
        &self,
        overlay: &str,
        generation: u64,
        filename: &str,
    ) -> OverlayResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM overlay_content WHERE overlay = $1 AND filename = $2")
            .bind(overlay)
            .bind(filename)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OverlayError::ContentNotFound {
                overlay: overlay.to_owned(),
                filename: filename.to_owned(),
            });
        }

        sqlx::query("UPDATE overlays SET generation = $1 WHERE name = $2")
            .bind(to_i64(generation, "generation")?)
            .bind(overlay)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_link(&self, link: &Link) -> OverlayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO overlay_links (scope, overlay, deployment, enabled)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (scope, overlay, deployment) DO UPDATE
            SET enabled = EXCLUDED.enabled
            "#,
        )
        .bind(link.key.scope.to_key())
        .bind(&link.key.overlay)
        .bind(&link.key.deployment)
        .bind(link.enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_link(&self, key: &LinkKey) -> OverlayResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM overlay_links
            WHERE scope = $1 AND overlay = $2 AND deployment = $3
            "#,
        )
        .bind(key.scope.to_key())
        .bind(&key.overlay)
        .bind(&key.deployment)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OverlayError::LinkNotFound {
                scope: key.scope.clone(),
                overlay: key.overlay.clone(),
                deployment: key.deployment.clone(),
            });
        }

        Ok(())
    }

    async fn load(&self) -> OverlayResult<StoreSnapshot> {
        let overlay_rows =
            sqlx::query("SELECT name, generation, created_at FROM overlays ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        let mut overlays = BTreeMap::new();
        for row in &overlay_rows {
            let name: String = row.get("name");
            let generation: i64 = row.get("generation");
            let record = OverlayRecord {
                name: name.clone(),
                generation: u64::try_from(generation).map_err(|_| {
                    OverlayError::Serialisation(format!("negative generation for {name}"))
                })?,
                created_at: row.get("created_at"),
                entries: Vec::new(),
            };
            overlays.insert(name, record);
        }

        let entry_rows = sqlx::query(
            r#"
            SELECT overlay, filename, content_ref, size, digest, updated_at
            FROM overlay_content
            ORDER BY overlay, filename
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &entry_rows {
            let (overlay, entry) = Self::row_to_entry(row)?;
            if let Some(record) = overlays.get_mut(&overlay) {
                record.entries.push(entry);
            }
        }

        let link_rows = sqlx::query(
            r#"
            SELECT scope, overlay, deployment, enabled
            FROM overlay_links
            ORDER BY overlay, scope, deployment
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let links = link_rows
            .iter()
            .map(Self::row_to_link)
            .collect::<OverlayResult<Vec<_>>>()?;

        Ok(StoreSnapshot {
            overlays: overlays.into_values().collect(),
            links,
        })
    }

    async fn ping(&self) -> OverlayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
