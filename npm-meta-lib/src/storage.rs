//! Local metadata storage abstraction
//!
//! Provides a trait over the keyed table that holds notes, tags and quick
//! links per forwarding rule. Implementations include:
//! - MetaDatabase: embedded libSQL database (see `database`)
//! - MemoryStore: process-local map, for tests and throwaway deployments
//!
//! Records are independent of each other; every write is a single-record
//! upsert or delete and the last write wins.

use crate::types::{MetadataRecord, RuleId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Trait for metadata storage operations
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Retrieve the record for a rule
    ///
    /// Returns None if the rule has never been annotated.
    async fn get(&self, rule_id: RuleId) -> Result<Option<MetadataRecord>>;

    /// Insert or replace the record for `record.rule_id`
    async fn upsert(&self, record: &MetadataRecord) -> Result<()>;

    /// Delete the record for a rule
    ///
    /// Returns Ok(()) even if the record doesn't exist (idempotent).
    async fn delete(&self, rule_id: RuleId) -> Result<()>;

    /// All stored records, ordered by rule id
    async fn list_all(&self) -> Result<Vec<MetadataRecord>>;

    /// Set or clear the orphan mark of an existing record
    ///
    /// Touches nothing else. A missing record stays missing.
    async fn set_orphaned_since(
        &self,
        rule_id: RuleId,
        orphaned_since: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// In-memory metadata store
///
/// Not durable: everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RuleId, MetadataRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, rule_id: RuleId) -> Result<Option<MetadataRecord>> {
        Ok(self.records.read().await.get(&rule_id).cloned())
    }

    async fn upsert(&self, record: &MetadataRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.rule_id, record.clone());
        Ok(())
    }

    async fn delete(&self, rule_id: RuleId) -> Result<()> {
        self.records.write().await.remove(&rule_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<MetadataRecord>> {
        let mut records: Vec<MetadataRecord> =
            self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.rule_id);
        Ok(records)
    }

    async fn set_orphaned_since(
        &self,
        rule_id: RuleId,
        orphaned_since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(&rule_id) {
            record.orphaned_since = orphaned_since;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Metadata;

    /// Shared behaviour checks run against every MetadataStore implementation
    pub(crate) async fn exercise_store<S: MetadataStore>(store: &S) {
        // Missing record
        assert!(store.get(1).await.expect("get should succeed").is_none());

        // Insert and read back
        let record = MetadataRecord::new(
            1,
            Metadata::default()
                .with_note("grafana")
                .with_tag("monitoring")
                .with_link("dashboard", "http://grafana.lan"),
        );
        store.upsert(&record).await.expect("upsert should succeed");
        let loaded = store
            .get(1)
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(loaded.metadata, record.metadata);
        assert!(loaded.orphaned_since.is_none());

        // Last write wins
        let replaced = MetadataRecord::new(1, Metadata::default().with_note("loki"));
        store.upsert(&replaced).await.expect("overwrite should succeed");
        let loaded = store.get(1).await.unwrap().unwrap();
        assert_eq!(loaded.metadata.note, "loki");
        assert!(loaded.metadata.tags.is_empty());

        // Listing is ordered by rule id
        store
            .upsert(&MetadataRecord::new(7, Metadata::default()))
            .await
            .unwrap();
        store
            .upsert(&MetadataRecord::new(3, Metadata::default()))
            .await
            .unwrap();
        let ids: Vec<RuleId> = store
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.rule_id)
            .collect();
        assert_eq!(ids, vec![1, 3, 7]);

        // Orphan mark only touches the mark
        let since = Utc::now();
        store
            .set_orphaned_since(1, Some(since))
            .await
            .expect("mark should succeed");
        let marked = store.get(1).await.unwrap().unwrap();
        assert_eq!(marked.metadata.note, "loki");
        assert_eq!(
            marked.orphaned_since.map(|t| t.timestamp()),
            Some(since.timestamp())
        );
        store.set_orphaned_since(1, None).await.unwrap();
        assert!(store.get(1).await.unwrap().unwrap().orphaned_since.is_none());

        // Marking a missing record does not create it
        store.set_orphaned_since(42, Some(since)).await.unwrap();
        assert!(store.get(42).await.unwrap().is_none());

        // Delete, then delete again
        store.delete(1).await.expect("delete should succeed");
        assert!(store.get(1).await.unwrap().is_none());
        store.delete(1).await.expect("second delete should succeed");
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        exercise_store(&store).await;
    }
}
