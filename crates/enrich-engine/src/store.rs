//! Versioned attribute store.
//!
//! One [`VersionedValue`] row per (entity, attribute). [`RecordStore`] is the
//! persistence seam; [`AttributeStore`] layers the approval rules on top of it
//! and serialises read-modify-write cycles per key.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use enrich_types::{
    Attribute, AttributeId, Clock, EnrichError, EntityId, Meta, Result, SystemClock,
    VersionedValue,
};

use crate::config::DEFAULT_AUTO_APPROVE_THRESHOLD;

// ---------------------------------------------------------------------------
// RecordStore trait
// ---------------------------------------------------------------------------

/// Raw row storage keyed by (entity, attribute).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, entity_id: &str, attribute_id: &str) -> Result<Option<VersionedValue>>;

    /// Rows for `attribute_id` across many entities. Missing rows are absent from the map.
    async fn get_many(
        &self,
        entity_ids: &[EntityId],
        attribute_id: &str,
    ) -> Result<HashMap<EntityId, VersionedValue>>;

    /// Insert or replace the row for the record's key.
    async fn put(&self, record: &VersionedValue) -> Result<()>;

    /// Every stored row, ordered by (entity, attribute).
    async fn all(&self) -> Result<Vec<VersionedValue>>;
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

type RowKey = (EntityId, AttributeId);

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: RwLock<BTreeMap<RowKey, VersionedValue>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = VersionedValue>) -> Self {
        let rows = records
            .into_iter()
            .map(|r| ((r.entity_id.clone(), r.attribute_id.clone()), r))
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Load a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// A missing file yields an empty store.
    pub async fn load_snapshot(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            tracing::debug!(path = %path.display(), "No state snapshot, starting empty");
            return Ok(Self::new());
        }
        let json = tokio::fs::read_to_string(path).await?;
        let records: Vec<VersionedValue> = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), rows = records.len(), "State snapshot loaded");
        Ok(Self::from_records(records))
    }

    /// Write every row to `path` as a pretty-printed JSON array.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records = self.all().await?;
        let json = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), rows = records.len(), "State snapshot saved");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, entity_id: &str, attribute_id: &str) -> Result<Option<VersionedValue>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(entity_id.to_string(), attribute_id.to_string()))
            .cloned())
    }

    async fn get_many(
        &self,
        entity_ids: &[EntityId],
        attribute_id: &str,
    ) -> Result<HashMap<EntityId, VersionedValue>> {
        let rows = self.rows.read().await;
        Ok(entity_ids
            .iter()
            .filter_map(|id| {
                rows.get(&(id.clone(), attribute_id.to_string()))
                    .map(|row| (id.clone(), row.clone()))
            })
            .collect())
    }

    async fn put(&self, record: &VersionedValue) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(
            (record.entity_id.clone(), record.attribute_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn all(&self) -> Result<Vec<VersionedValue>> {
        let rows = self.rows.read().await;
        Ok(rows.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// AttributeStore
// ---------------------------------------------------------------------------

/// Optional metadata accompanying a computed write.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    pub input_hash: Option<String>,
    pub pipeline_version: Option<u32>,
    pub justification: Option<String>,
    pub confidence: Option<f64>,
    pub meta: Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { auto_approved: bool },
    Updated { auto_approved: bool },
    /// `current` already held the value. Only `input_hash` and
    /// `pipeline_version` may have been refreshed.
    Unchanged,
}

type LockMap = Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>;

/// Held per-key lock; removes its map entry on release when unused.
struct RowLock<'a> {
    locks: &'a LockMap,
    key: RowKey,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RowLock<'_> {
    fn drop(&mut self) {
        // Release first so the guard's clone no longer counts.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub struct AttributeStore {
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    auto_approve_threshold: f64,
    locks: LockMap,
}

impl AttributeStore {
    pub fn new(records: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, auto_approve_threshold: f64) -> Self {
        Self {
            records,
            clock,
            auto_approve_threshold,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Empty in-memory store on the system clock with the default threshold.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(SystemClock),
            DEFAULT_AUTO_APPROVE_THRESHOLD,
        )
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn auto_approve_threshold(&self) -> f64 {
        self.auto_approve_threshold
    }

    /// Acquire the per-key async lock, created on first use. The entry is
    /// dropped from the map when the last holder or waiter releases it.
    async fn lock_row(&self, entity_id: &str, attribute_id: &str) -> RowLock<'_> {
        let key: RowKey = (entity_id.to_string(), attribute_id.to_string());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        RowLock {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn held_lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn get(&self, entity_id: &str, attribute_id: &str) -> Result<Option<VersionedValue>> {
        self.records.get(entity_id, attribute_id).await
    }

    pub async fn get_many(
        &self,
        entity_ids: &[EntityId],
        attribute_id: &str,
    ) -> Result<HashMap<EntityId, VersionedValue>> {
        self.records.get_many(entity_ids, attribute_id).await
    }

    /// Override, then approved, then current.
    pub async fn effective_value(
        &self,
        entity_id: &str,
        attribute_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .get(entity_id, attribute_id)
            .await?
            .and_then(|row| row.effective_value().cloned()))
    }

    /// Record a freshly computed value, auto-approving it when the
    /// attribute's review policy allows.
    pub async fn upsert_versioned(
        &self,
        entity_id: &str,
        attribute: &Attribute,
        value: serde_json::Value,
        opts: UpsertOptions,
    ) -> Result<UpsertOutcome> {
        let _row_lock = self.lock_row(entity_id, &attribute.id).await;

        let auto_approved = attribute
            .review_policy
            .auto_approves(opts.confidence, self.auto_approve_threshold);
        let now = self.clock.now();

        let outcome = match self.records.get(entity_id, &attribute.id).await? {
            None => {
                let mut row = VersionedValue::new(entity_id, &attribute.id, now);
                row.approved = auto_approved.then(|| value.clone());
                row.current = Some(value);
                row.input_hash = opts.input_hash;
                row.pipeline_version = opts.pipeline_version;
                row.justification = opts.justification;
                row.confidence = opts.confidence;
                row.meta = opts.meta;
                self.records.put(&row).await?;
                UpsertOutcome::Created { auto_approved }
            }
            Some(mut row) if row.current.as_ref() == Some(&value) => {
                // Same value from new inputs or a newer pipeline version: the
                // value slots stay put but the cache key must follow the inputs.
                let mut refreshed = false;
                if opts.input_hash.is_some() && row.input_hash != opts.input_hash {
                    row.input_hash = opts.input_hash;
                    refreshed = true;
                }
                if opts.pipeline_version.is_some() && row.pipeline_version != opts.pipeline_version {
                    row.pipeline_version = opts.pipeline_version;
                    refreshed = true;
                }
                if refreshed {
                    self.records.put(&row).await?;
                }
                UpsertOutcome::Unchanged
            }
            Some(mut row) => {
                if auto_approved {
                    row.approved = Some(value.clone());
                }
                row.current = Some(value);
                if opts.input_hash.is_some() {
                    row.input_hash = opts.input_hash;
                }
                if opts.pipeline_version.is_some() {
                    row.pipeline_version = opts.pipeline_version;
                }
                if opts.justification.is_some() {
                    row.justification = opts.justification;
                }
                if opts.confidence.is_some() {
                    row.confidence = opts.confidence;
                }
                row.meta.extend(opts.meta);
                row.updated_at = now;
                self.records.put(&row).await?;
                UpsertOutcome::Updated { auto_approved }
            }
        };

        tracing::debug!(
            entity = %entity_id,
            attribute = %attribute.id,
            outcome = ?outcome,
            "Versioned value upserted"
        );
        Ok(outcome)
    }

    /// Set or clear (`None`) the human override. Creates the row if needed.
    pub async fn set_override(
        &self,
        entity_id: &str,
        attribute_id: &str,
        value: Option<serde_json::Value>,
    ) -> Result<VersionedValue> {
        let _row_lock = self.lock_row(entity_id, attribute_id).await;

        let now = self.clock.now();
        let mut row = self
            .records
            .get(entity_id, attribute_id)
            .await?
            .unwrap_or_else(|| VersionedValue::new(entity_id, attribute_id, now));
        row.override_value = value;
        row.updated_at = now;
        self.records.put(&row).await?;

        tracing::info!(
            entity = %entity_id,
            attribute = %attribute_id,
            cleared = row.override_value.is_none(),
            "Override updated"
        );
        Ok(row)
    }

    /// Promote the pending value (override, else current) into `approved`.
    pub async fn approve_versioned(&self, entity_id: &str, attribute_id: &str) -> Result<VersionedValue> {
        let _row_lock = self.lock_row(entity_id, attribute_id).await;

        let mut row = self
            .records
            .get(entity_id, attribute_id)
            .await?
            .ok_or_else(|| EnrichError::NotFound {
                entity: entity_id.to_string(),
                attribute: attribute_id.to_string(),
            })?;
        row.approved = row.pending_value().cloned();
        row.updated_at = self.clock.now();
        self.records.put(&row).await?;

        tracing::info!(entity = %entity_id, attribute = %attribute_id, "Value approved");
        Ok(row)
    }

    /// Approve each pair in turn. Stops at the first failure.
    pub async fn bulk_approve(&self, pairs: &[(EntityId, AttributeId)]) -> Result<usize> {
        let mut approved = 0;
        for (entity_id, attribute_id) in pairs {
            self.approve_versioned(entity_id, attribute_id).await?;
            approved += 1;
        }
        Ok(approved)
    }

    /// Seed a raw (non-computed) value as both current and approved.
    pub async fn import_value(
        &self,
        entity_id: &str,
        attribute_id: &str,
        value: serde_json::Value,
    ) -> Result<VersionedValue> {
        let _row_lock = self.lock_row(entity_id, attribute_id).await;

        let now = self.clock.now();
        let mut row = match self.records.get(entity_id, attribute_id).await? {
            Some(row) if row.current.as_ref() == Some(&value) && row.approved.as_ref() == Some(&value) => {
                return Ok(row)
            }
            Some(mut row) => {
                row.updated_at = now;
                row
            }
            None => VersionedValue::new(entity_id, attribute_id, now),
        };
        row.current = Some(value.clone());
        row.approved = Some(value);
        self.records.put(&row).await?;
        Ok(row)
    }
}
