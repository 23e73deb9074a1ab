//! SQLite-backed [`RecordStore`], enabled with the `sqlite` feature.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use enrich_types::{EnrichError, EntityId, Result, VersionedValue};

use crate::store::RecordStore;

const COLUMNS: &str = "entity_id, attribute_id, current, approved, live, override, input_hash, \
     pipeline_version, justification, confidence, meta, created_at, updated_at";

fn store_err(e: sqlx::Error) -> EnrichError {
    EnrichError::Store(e.to_string())
}

fn to_json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn from_json_text(text: Option<String>) -> Result<Option<serde_json::Value>> {
    text.map(|t| serde_json::from_str(&t)).transpose().map_err(EnrichError::from)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EnrichError::Store(format!("bad timestamp '{text}': {e}")))
}

fn decode_row(row: &SqliteRow) -> Result<VersionedValue> {
    let meta_text: String = row.try_get("meta").map_err(store_err)?;
    let created_at: String = row.try_get("created_at").map_err(store_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(store_err)?;
    let pipeline_version: Option<i64> = row.try_get("pipeline_version").map_err(store_err)?;

    Ok(VersionedValue {
        entity_id: row.try_get("entity_id").map_err(store_err)?,
        attribute_id: row.try_get("attribute_id").map_err(store_err)?,
        current: from_json_text(row.try_get("current").map_err(store_err)?)?,
        approved: from_json_text(row.try_get("approved").map_err(store_err)?)?,
        live: from_json_text(row.try_get("live").map_err(store_err)?)?,
        override_value: from_json_text(row.try_get("override").map_err(store_err)?)?,
        input_hash: row.try_get("input_hash").map_err(store_err)?,
        pipeline_version: pipeline_version.map(|v| v as u32),
        justification: row.try_get("justification").map_err(store_err)?,
        confidence: row.try_get("confidence").map_err(store_err)?,
        meta: serde_json::from_str(&meta_text)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite:state.db`,
    /// and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS versioned_value (
                entity_id        TEXT    NOT NULL,
                attribute_id     TEXT    NOT NULL,
                current          TEXT,
                approved         TEXT,
                live             TEXT,
                override         TEXT,
                input_hash       TEXT,
                pipeline_version INTEGER,
                justification    TEXT,
                confidence       REAL,
                meta             TEXT    NOT NULL DEFAULT '{}',
                created_at       TEXT    NOT NULL,
                updated_at       TEXT    NOT NULL,
                PRIMARY KEY (entity_id, attribute_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, entity_id: &str, attribute_id: &str) -> Result<Option<VersionedValue>> {
        let sql = format!("SELECT {COLUMNS} FROM versioned_value WHERE entity_id = ? AND attribute_id = ?");
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .bind(attribute_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn get_many(
        &self,
        entity_ids: &[EntityId],
        attribute_id: &str,
    ) -> Result<HashMap<EntityId, VersionedValue>> {
        let mut found = HashMap::new();
        // Stay well under SQLite's bound-parameter limit.
        for chunk in entity_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {COLUMNS} FROM versioned_value WHERE attribute_id = ? AND entity_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(attribute_id);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(store_err)?;
            for row in &rows {
                let value = decode_row(row)?;
                found.insert(value.entity_id.clone(), value);
            }
        }
        Ok(found)
    }

    async fn put(&self, record: &VersionedValue) -> Result<()> {
        let sql = format!(
            "INSERT INTO versioned_value ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (entity_id, attribute_id) DO UPDATE SET
                current = excluded.current,
                approved = excluded.approved,
                live = excluded.live,
                override = excluded.override,
                input_hash = excluded.input_hash,
                pipeline_version = excluded.pipeline_version,
                justification = excluded.justification,
                confidence = excluded.confidence,
                meta = excluded.meta,
                updated_at = excluded.updated_at"
        );
        sqlx::query(&sql)
            .bind(&record.entity_id)
            .bind(&record.attribute_id)
            .bind(to_json_text(&record.current))
            .bind(to_json_text(&record.approved))
            .bind(to_json_text(&record.live))
            .bind(to_json_text(&record.override_value))
            .bind(&record.input_hash)
            .bind(record.pipeline_version.map(i64::from))
            .bind(&record.justification)
            .bind(record.confidence)
            .bind(serde_json::to_string(&record.meta)?)
            .bind(record.created_at.to_rfc3339())
            .bind(record.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<VersionedValue>> {
        let sql = format!("SELECT {COLUMNS} FROM versioned_value ORDER BY entity_id, attribute_id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(decode_row).collect()
    }
}
