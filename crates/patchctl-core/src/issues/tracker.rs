//! Issue tracker boundary.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::record::{IssueCategory, IssueRecord};
use crate::error::{PatchError, Result};

/// The narrow interface the duplication guard reads and writes through.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Open records of `category` created at or after `since`.
    async fn search_open(&self, category: IssueCategory, since: DateTime<Utc>) -> Result<Vec<IssueRecord>>;

    /// Create `record` and return it with its tracker id.
    async fn create(&self, record: &IssueRecord) -> Result<IssueRecord>;

    /// Refresh the body of `id` and raise its occurrence counter to
    /// `occurrence_counter` (never lowering it).
    async fn update(&self, id: &str, body: &str, occurrence_counter: u32) -> Result<IssueRecord>;
}

/// In-process tracker, used by tests and `--dry-run` style callers.
#[derive(Debug, Default)]
pub struct MemoryIssueTracker {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<IssueRecord>,
    closed: Vec<String>,
    next_id: u64,
}

impl MemoryIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing records; records without an id get one.
    pub fn with_records(records: Vec<IssueRecord>) -> Self {
        let tracker = Self::new();
        {
            let mut state = tracker.lock();
            for mut record in records {
                state.next_id += 1;
                if record.id.is_none() {
                    record.id = Some(state.next_id.to_string());
                }
                state.records.push(record);
            }
        }
        tracker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every record, open or closed.
    pub fn records(&self) -> Vec<IssueRecord> {
        self.lock().records.clone()
    }

    pub fn close(&self, id: &str) {
        self.lock().closed.push(id.to_string());
    }
}

#[async_trait]
impl IssueTracker for MemoryIssueTracker {
    async fn search_open(&self, category: IssueCategory, since: DateTime<Utc>) -> Result<Vec<IssueRecord>> {
        let state = self.lock();
        Ok(state
            .records
            .iter()
            .filter(|r| r.category == category && r.created_at >= since)
            .filter(|r| r.id.as_ref().map(|id| !state.closed.contains(id)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create(&self, record: &IssueRecord) -> Result<IssueRecord> {
        let mut state = self.lock();
        state.next_id += 1;
        let mut created = record.clone();
        created.id = Some(state.next_id.to_string());
        state.records.push(created.clone());
        Ok(created)
    }

    async fn update(&self, id: &str, body: &str, occurrence_counter: u32) -> Result<IssueRecord> {
        let mut state = self.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id.as_deref() == Some(id))
            .ok_or_else(|| PatchError::DuplicateDetection(format!("no issue with id {id}")))?;
        record.body = body.to_string();
        record.occurrence_counter = record.occurrence_counter.max(occurrence_counter);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_filters_category_window_and_closed() {
        let now = Utc::now();
        let tracker = MemoryIssueTracker::with_records(vec![
            IssueRecord::with_category("a", "", IssueCategory::Other).created_at(now),
            IssueRecord::with_category("b", "", IssueCategory::Other).created_at(now - chrono::Duration::days(2)),
            IssueRecord::with_category("c", "", IssueCategory::GitFailure).created_at(now),
        ]);
        let since = now - chrono::Duration::hours(1);
        let found = tracker.search_open(IssueCategory::Other, since).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "a");

        tracker.close(found[0].id.as_deref().unwrap());
        assert!(tracker.search_open(IssueCategory::Other, since).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_never_lowers_counter() {
        let tracker = MemoryIssueTracker::new();
        let created = tracker
            .create(&IssueRecord::with_category("x", "v1", IssueCategory::Other))
            .await
            .unwrap();
        let id = created.id.unwrap();
        let updated = tracker.update(&id, "v2", 5).await.unwrap();
        assert_eq!(updated.occurrence_counter, 5);
        let again = tracker.update(&id, "v3", 2).await.unwrap();
        assert_eq!(again.occurrence_counter, 5);
        assert_eq!(again.body, "v3");
        assert!(tracker.update("missing", "", 1).await.is_err());
    }
}
