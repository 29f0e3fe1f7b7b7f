use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use icms_core::IcmsRecord;
use tokio::sync::Mutex;

use crate::{LoadTransaction, RecordStore, StoreError};

/// In-process store for dry runs and tests. Writes are staged per
/// transaction and only become visible on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<IcmsRecord>,
    failing_batches: HashSet<usize>,
    fail_period_lookup: bool,
    fail_begin: bool,
    fail_commit: bool,
    commits: usize,
    rollbacks: usize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_rows(rows: Vec<IcmsRecord>) -> Self {
        let store = Self::default();
        store.state.lock().await.rows = rows;
        store
    }

    /// Makes `insert_batch` fail for the given batch index.
    pub async fn fail_batch(&self, batch_index: usize) {
        self.state.lock().await.failing_batches.insert(batch_index);
    }

    pub async fn fail_period_lookup(&self) {
        self.state.lock().await.fail_period_lookup = true;
    }

    pub async fn fail_begin(&self) {
        self.state.lock().await.fail_begin = true;
    }

    /// Makes `commit` fail without applying the staged writes.
    pub async fn fail_commit(&self) {
        self.state.lock().await.fail_commit = true;
    }

    pub async fn rows(&self) -> Vec<IcmsRecord> {
        self.state.lock().await.rows.clone()
    }

    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }

    pub async fn rollbacks(&self) -> usize {
        self.state.lock().await.rollbacks
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn existing_periods(&self) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_period_lookup {
            return Err(StoreError::Injected("period lookup".to_string()));
        }
        Ok(state.rows.iter().map(|r| r.period.clone()).collect())
    }

    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError> {
        if self.state.lock().await.fail_begin {
            return Err(StoreError::Injected("begin".to_string()));
        }
        Ok(Box::new(MemoryLoadTransaction {
            state: Arc::clone(&self.state),
            staged: Mutex::new(Staged::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct Staged {
    cleared: bool,
    batches: Vec<(usize, Vec<IcmsRecord>)>,
}

struct MemoryLoadTransaction {
    state: Arc<Mutex<MemoryState>>,
    staged: Mutex<Staged>,
}

#[async_trait]
impl LoadTransaction for MemoryLoadTransaction {
    async fn clear_all(&self) -> Result<u64, StoreError> {
        let existing = self.state.lock().await.rows.len() as u64;
        let mut staged = self.staged.lock().await;
        staged.cleared = true;
        staged.batches.clear();
        Ok(existing)
    }

    async fn insert_batch(&self, batch_index: usize, records: &[IcmsRecord]) -> Result<u64, StoreError> {
        if self.state.lock().await.failing_batches.contains(&batch_index) {
            return Err(StoreError::Injected(format!("batch {batch_index}")));
        }
        self.staged
            .lock()
            .await
            .batches
            .push((batch_index, records.to_vec()));
        Ok(records.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut staged = this.staged.into_inner();
        staged.batches.sort_by_key(|(index, _)| *index);
        let mut state = this.state.lock().await;
        if state.fail_commit {
            return Err(StoreError::Injected("commit".to_string()));
        }
        if staged.cleared {
            state.rows.clear();
        }
        for (_, rows) in staged.batches {
            state.rows.extend(rows);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.state.lock().await.rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(period: &str) -> IcmsRecord {
        IcmsRecord {
            region_id: 32,
            region: "ES".to_string(),
            period: period.to_string(),
            year: period[..4].parse().expect("year"),
            month: period[4..].parse().expect("month"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = MemoryRecordStore::new();
        let tx = store.begin().await.expect("begin");
        tx.insert_batch(0, &[record("202301")]).await.expect("insert");
        assert_eq!(store.row_count().await, 0);
        tx.commit().await.expect("commit");
        assert_eq!(store.row_count().await, 1);
        assert_eq!(store.commits().await, 1);
        assert_eq!(
            store.existing_periods().await.expect("periods"),
            BTreeSet::from(["202301".to_string()])
        );
    }

    #[tokio::test]
    async fn rollback_discards_clear_and_inserts() {
        let store = MemoryRecordStore::with_rows(vec![record("202212")]).await;
        let tx = store.begin().await.expect("begin");
        tx.clear_all().await.expect("clear");
        tx.insert_batch(0, &[record("202301")]).await.expect("insert");
        tx.rollback().await.expect("rollback");
        assert_eq!(store.rows().await, vec![record("202212")]);
        assert_eq!(store.rollbacks().await, 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let store = MemoryRecordStore::new();
        store.fail_batch(1).await;
        store.fail_period_lookup().await;
        assert!(store.existing_periods().await.is_err());
        let tx = store.begin().await.expect("begin");
        assert!(tx.insert_batch(0, &[record("202301")]).await.is_ok());
        assert!(tx.insert_batch(1, &[record("202302")]).await.is_err());
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let store = MemoryRecordStore::with_rows(vec![record("202212")]).await;
        store.fail_commit().await;
        let tx = store.begin().await.expect("begin");
        tx.clear_all().await.expect("clear");
        tx.insert_batch(0, &[record("202301")]).await.expect("insert");
        assert!(tx.commit().await.is_err());
        assert_eq!(store.rows().await, vec![record("202212")]);
        assert_eq!(store.commits().await, 0);

        store.fail_begin().await;
        assert!(store.begin().await.is_err());
    }
}
