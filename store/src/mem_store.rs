//! In-memory reference implementation of the store traits. Backs tests and
//! single-node deployments without an external database.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use oscar_lib::{ConnectionDescriptor, ExecutionRecord};

use crate::{
    AuditEntry, AuditStore, ConnectionStore, ListFilter, Page, RecordStore, StoreError,
    StoreResult,
};

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<String, ExecutionRecord>,
    connections: HashMap<String, ConnectionDescriptor>,
    audit: Vec<AuditEntry>,
}

/// Shared in-memory store implementing all three persistence traits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(record: &ExecutionRecord, filter: &ListFilter) -> bool {
    if let Some(status) = filter.status {
        if record.status != status {
            return false;
        }
    }
    if let Some(connection_id) = &filter.connection_id {
        if &record.connection_id != connection_id {
            return false;
        }
    }
    if let Some(start) = filter.start_date {
        if record.created_at < start {
            return false;
        }
    }
    if let Some(end) = filter.end_date {
        if record.created_at > end {
            return false;
        }
    }
    if let Some(keyword) = &filter.keyword {
        let keyword = keyword.to_lowercase();
        let hit = record.id.to_lowercase().contains(&keyword)
            || record.database_name.to_lowercase().contains(&keyword)
            || record.table_name.to_lowercase().contains(&keyword);
        if !hit {
            return false;
        }
    }
    true
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.clone()));
        }
        debug!(id = %record.id, "store.insert");
        inner.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.records.contains_key(&record.id) {
            return Err(StoreError::RecordNotFound(record.id.clone()));
        }
        let mut updated = record.clone();
        updated.updated_at = Utc::now();
        debug!(id = %record.id, status = %record.status, "store.update");
        inner.records.insert(record.id.clone(), updated);
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<ExecutionRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))
    }

    async fn list(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> StoreResult<(Vec<ExecutionRecord>, u64)> {
        let inner = self.inner.read().await;
        let mut matched: Vec<ExecutionRecord> = inner
            .records
            .values()
            .filter(|record| matches_filter(record, filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matched.len() as u64;
        let page = page.normalized();
        let items = matched
            .into_iter()
            .skip(page.offset())
            .take(page.size as usize)
            .collect();
        Ok((items, total))
    }

    async fn select_logs(&self, id: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(|record| record.execution_logs.clone())
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))
    }
}

#[async_trait]
impl ConnectionStore for InMemoryStore {
    async fn get(&self, id: &str) -> StoreResult<ConnectionDescriptor> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ConnectionNotFound(id.to_string()))
    }

    async fn insert(&self, connection: &ConnectionDescriptor) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        debug!(id = %connection.id, "store.insert_connection");
        inner
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<ConnectionDescriptor>> {
        let inner = self.inner.read().await;
        let mut connections: Vec<ConnectionDescriptor> =
            inner.connections.values().cloned().collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(connections)
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn insert(&self, entry: &AuditEntry) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.audit.push(entry.clone());
        Ok(())
    }

    async fn recent_by_user(
        &self,
        user: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<AuditEntry> = inner
            .audit
            .iter()
            .filter(|entry| entry.user == user && entry.created_at >= since)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditStatus;
    use chrono::Duration;
    use oscar_lib::{DdlType, ExecutionParams, ExecutionStatus};

    fn record(id: &str, database: &str, created_offset_secs: i64) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(
            id.to_string(),
            "conn-1".to_string(),
            database.to_string(),
            "orders".to_string(),
            DdlType::Fragment,
            None,
            "pt-online-schema-change --password=***".to_string(),
            ExecutionParams::default(),
            "alice".to_string(),
        );
        record.created_at = Utc::now() + Duration::seconds(created_offset_secs);
        record
    }

    #[tokio::test]
    async fn insert_get_update_roundtrip() {
        let store = InMemoryStore::new();
        let mut rec = record("exec-1", "app", 0);
        RecordStore::insert(&store, &rec).await.unwrap();
        assert!(matches!(
            RecordStore::insert(&store, &rec).await,
            Err(StoreError::Duplicate(_))
        ));

        rec.mark_running(Utc::now());
        store.update(&rec).await.unwrap();
        let loaded = RecordStore::get(&store, "exec-1").await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);

        assert!(matches!(
            RecordStore::get(&store, "missing").await,
            Err(StoreError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_orders_by_created_at_descending() {
        let store = InMemoryStore::new();
        for (id, offset) in [("exec-1", -30), ("exec-2", -20), ("exec-3", -10)] {
            RecordStore::insert(&store, &record(id, "app", offset))
                .await
                .unwrap();
        }
        let (items, total) = RecordStore::list(&store, &ListFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 3);
        let ids: Vec<&str> = items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["exec-3", "exec-2", "exec-1"]);
    }

    #[tokio::test]
    async fn list_applies_keyword_filter_and_pagination() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let database = if i % 2 == 0 { "billing" } else { "app" };
            RecordStore::insert(&store, &record(&format!("exec-{i}"), database, -i))
                .await
                .unwrap();
        }

        let filter = ListFilter {
            keyword: Some("BILLING".to_string()),
            ..Default::default()
        };
        let (items, total) = RecordStore::list(&store, &filter, Page::default())
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert!(items.iter().all(|r| r.database_name == "billing"));

        let (page_two, total) = RecordStore::list(&store, &filter, Page { page: 2, size: 2 })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page_two.len(), 1);
    }

    #[tokio::test]
    async fn audit_recent_by_user_filters_on_time_and_user() {
        let store = InMemoryStore::new();
        let mut old = AuditEntry::new("alice", "execution_create", AuditStatus::Success);
        old.created_at = Utc::now() - Duration::hours(2);
        AuditStore::insert(&store, &old).await.unwrap();
        AuditStore::insert(
            &store,
            &AuditEntry::new("alice", "execution_create", AuditStatus::Success),
        )
        .await
        .unwrap();
        AuditStore::insert(
            &store,
            &AuditEntry::new("bob", "execution_create", AuditStatus::Success),
        )
        .await
        .unwrap();

        let recent = store
            .recent_by_user("alice", Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
