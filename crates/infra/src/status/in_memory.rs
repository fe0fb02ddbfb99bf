//! In-memory status store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use sellerflow_core::Clock;

use super::{StatusPatch, StatusQuery, StatusRecord, StatusSort, StatusStore, StatusStoreError};

#[derive(Debug)]
pub struct InMemoryStatusStore {
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl InMemoryStatusStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StatusStoreError {
    StatusStoreError::Backend("status store lock poisoned".to_string())
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn upsert(&self, id: &str, patch: StatusPatch) -> Result<StatusRecord, StatusStoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| StatusRecord::new(id, patch.kind.unwrap_or_default(), now));
        record.apply(patch, now);
        Ok(record.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<StatusRecord>, StatusStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(id).cloned())
    }

    async fn query(&self, query: &StatusQuery) -> Result<Vec<StatusRecord>, StatusStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut out: Vec<StatusRecord> = records
            .values()
            .filter(|r| r.matches(&query.filter))
            .cloned()
            .collect();
        match query.sort {
            StatusSort::UpdatedDesc => {
                out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)))
            }
            StatusSort::UpdatedAsc => {
                out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
            }
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusKind, StatusState};
    use sellerflow_core::ManualClock;

    #[tokio::test]
    async fn upsert_creates_then_merges() {
        let clock = ManualClock::starting_now();
        let store = InMemoryStatusStore::new(Arc::new(clock.clone()));

        let created = store
            .upsert(
                "user-1-INIT",
                StatusPatch {
                    parent_id: Some("user-1".to_string()),
                    ..StatusPatch::job(StatusState::Pending)
                },
            )
            .await
            .unwrap();
        assert_eq!(created.kind, StatusKind::Job);

        clock.advance(chrono::Duration::seconds(3));
        let updated = store
            .upsert("user-1-INIT", StatusPatch::job(StatusState::Running))
            .await
            .unwrap();

        assert_eq!(updated.status, StatusState::Running);
        assert_eq!(updated.parent_id.as_deref(), Some("user-1"));
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_limits() {
        let clock = ManualClock::starting_now();
        let store = InMemoryStatusStore::new(Arc::new(clock.clone()));

        for (id, status) in [
            ("a", StatusState::Completed),
            ("b", StatusState::Failed),
            ("c", StatusState::Completed),
        ] {
            store.upsert(id, StatusPatch::unit(status)).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        store.upsert("a-INIT", StatusPatch::job(StatusState::Completed)).await.unwrap();

        let completed = store
            .query(&StatusQuery::units().with_status(StatusState::Completed))
            .await
            .unwrap();
        let ids: Vec<&str> = completed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let limited = store.query(&StatusQuery::units().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, "c");
    }
}
