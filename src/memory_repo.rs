use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::instrument;

use crate::url_repo::{InsertMappingError, UrlMapping, UrlRepository, UrlTransaction};

/// In-process [`UrlRepository`] for engines without row locking.
///
/// Row locks are per-key async mutexes held until the owning transaction ends.
/// A pending insert reserves its short code, so a concurrent insert of the same code
/// fails the way a unique index would.
#[derive(Clone, Default)]
pub struct MemoryUrlRepository {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    table: Mutex<Table>,
    row_locks: Mutex<HashMap<String, Arc<RowLock<()>>>>,
}

#[derive(Default)]
struct Table {
    rows: HashMap<String, UrlMapping>,
    reserved: HashSet<String>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, short_code: &str) -> Arc<RowLock<()>> {
        let mut row_locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(row_locks.entry(short_code.to_owned()).or_default())
    }

    fn prune_row_locks(&self) {
        let mut row_locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        row_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

impl MemoryUrlRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `mapping` directly, bypassing transactions. Replaces any row with the same code.
    pub fn insert_committed(&self, mapping: UrlMapping) {
        self.shared
            .table()
            .rows
            .insert(mapping.short_code.clone(), mapping);
    }

    /// Reads the committed row for `short_code`, ignoring locks and uncommitted writes.
    #[must_use]
    pub fn get_committed(&self, short_code: &str) -> Option<UrlMapping> {
        self.shared.table().rows.get(short_code).cloned()
    }

    #[must_use]
    pub fn committed_rows(&self) -> Vec<UrlMapping> {
        self.shared.table().rows.values().cloned().collect()
    }
}

#[async_trait]
impl UrlRepository for MemoryUrlRepository {
    async fn begin(&self) -> anyhow::Result<Box<dyn UrlTransaction>> {
        Ok(Box::new(MemoryUrlTransaction {
            shared: Arc::clone(&self.shared),
            inserts: Vec::new(),
            deletes: HashSet::new(),
            held_locks: HashMap::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn delete_expired_urls(&self, created_before: OffsetDateTime) -> anyhow::Result<u64> {
        let mut table = self.shared.table();
        let before = table.rows.len();
        table.rows.retain(|_, row| row.created_at >= created_before);
        Ok((before - table.rows.len()) as u64)
    }
}

struct MemoryUrlTransaction {
    shared: Arc<Shared>,
    inserts: Vec<UrlMapping>,
    deletes: HashSet<String>,
    held_locks: HashMap<String, OwnedMutexGuard<()>>,
}

impl MemoryUrlTransaction {
    async fn lock_row(&mut self, short_code: &str) {
        if self.held_locks.contains_key(short_code) {
            return;
        }
        let guard = self.shared.row_lock(short_code).lock_owned().await;
        self.held_locks.insert(short_code.to_owned(), guard);
    }

    /// The row for `short_code` as this transaction sees it.
    fn visible(&self, table: &Table, short_code: &str) -> Option<UrlMapping> {
        if let Some(pending) = self.inserts.iter().find(|m| m.short_code == short_code) {
            return Some(pending.clone());
        }
        if self.deletes.contains(short_code) {
            return None;
        }
        table.rows.get(short_code).cloned()
    }

    fn release(&mut self) {
        if !self.inserts.is_empty() {
            let mut table = self.shared.table();
            for mapping in self.inserts.drain(..) {
                table.reserved.remove(&mapping.short_code);
            }
        }
        self.held_locks.clear();
        self.shared.prune_row_locks();
    }
}

#[async_trait]
impl UrlTransaction for MemoryUrlTransaction {
    async fn find_by_original_url(
        &mut self,
        original_url: &str,
    ) -> anyhow::Result<Vec<UrlMapping>> {
        let table = self.shared.table();
        let mut rows: Vec<UrlMapping> = table
            .rows
            .values()
            .filter(|row| row.original_url == original_url && !self.deletes.contains(&row.short_code))
            .chain(self.inserts.iter().filter(|row| row.original_url == original_url))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn find_by_short_code_for_update(
        &mut self,
        short_code: &str,
    ) -> anyhow::Result<Option<UrlMapping>> {
        self.lock_row(short_code).await;
        let table = self.shared.table();
        Ok(self.visible(&table, short_code))
    }

    async fn short_code_exists(&mut self, short_code: &str) -> anyhow::Result<bool> {
        let table = self.shared.table();
        Ok(self.visible(&table, short_code).is_some())
    }

    async fn insert_mapping(&mut self, mapping: UrlMapping) -> Result<(), InsertMappingError> {
        let mut table = self.shared.table();
        let code = &mapping.short_code;
        let committed_elsewhere = table.rows.contains_key(code) && !self.deletes.contains(code);
        if committed_elsewhere || table.reserved.contains(code) {
            return Err(InsertMappingError::ShortCodeTaken);
        }
        table.reserved.insert(code.clone());
        drop(table);
        self.inserts.push(mapping);
        Ok(())
    }

    async fn delete_mapping(&mut self, short_code: &str) -> anyhow::Result<bool> {
        self.lock_row(short_code).await;

        if let Some(index) = self
            .inserts
            .iter()
            .position(|m| m.short_code == short_code)
        {
            let removed = self.inserts.swap_remove(index);
            self.shared.table().reserved.remove(&removed.short_code);
            return Ok(true);
        }

        let table = self.shared.table();
        let existed = table.rows.contains_key(short_code) && !self.deletes.contains(short_code);
        drop(table);
        if existed {
            self.deletes.insert(short_code.to_owned());
        }
        Ok(existed)
    }

    async fn commit(mut self: Box<Self>) -> anyhow::Result<()> {
        {
            let mut table = self.shared.table();
            for short_code in self.deletes.drain() {
                table.rows.remove(&short_code);
            }
            for mapping in self.inserts.drain(..) {
                table.reserved.remove(&mapping.short_code);
                table.rows.insert(mapping.short_code.clone(), mapping);
            }
        }
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> anyhow::Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryUrlTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;

    fn mapping(short_code: &str, original_url: &str) -> UrlMapping {
        UrlMapping {
            short_code: short_code.to_owned(),
            original_url: original_url.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let repo = MemoryUrlRepository::new();
        repo.insert_committed(mapping("old123", "https://old.example.com"));

        let mut txn = repo.begin().await.unwrap();
        txn.insert_mapping(mapping("new123", "https://new.example.com"))
            .await
            .unwrap();
        assert!(txn.delete_mapping("old123").await.unwrap());
        assert!(repo.get_committed("new123").is_none());
        assert!(repo.get_committed("old123").is_some());

        txn.commit().await.unwrap();
        assert!(repo.get_committed("new123").is_some());
        assert!(repo.get_committed("old123").is_none());
    }

    #[tokio::test]
    async fn test_drop_discards_staged_writes() {
        let repo = MemoryUrlRepository::new();
        repo.insert_committed(mapping("old123", "https://old.example.com"));

        {
            let mut txn = repo.begin().await.unwrap();
            txn.insert_mapping(mapping("new123", "https://new.example.com"))
                .await
                .unwrap();
            txn.delete_mapping("old123").await.unwrap();
        }

        assert!(repo.get_committed("new123").is_none());
        assert!(repo.get_committed("old123").is_some());

        // NOTE: the reservation must be gone too
        let mut txn = repo.begin().await.unwrap();
        txn.insert_mapping(mapping("new123", "https://new.example.com"))
            .await
            .unwrap();
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_insert_reserves_code() {
        let repo = MemoryUrlRepository::new();
        let mut first = repo.begin().await.unwrap();
        let mut second = repo.begin().await.unwrap();

        first
            .insert_mapping(mapping("AAAAAA", "https://a.example.com"))
            .await
            .unwrap();

        // NOTE: uncommitted rows are invisible to the pre-check but still conflict on insert
        assert!(!second.short_code_exists("AAAAAA").await.unwrap());
        assert!(matches!(
            second
                .insert_mapping(mapping("AAAAAA", "https://b.example.com"))
                .await,
            Err(InsertMappingError::ShortCodeTaken)
        ));

        first.commit().await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(
            repo.get_committed("AAAAAA").unwrap().original_url,
            "https://a.example.com"
        );
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_holder_finishes() {
        let repo = MemoryUrlRepository::new();
        repo.insert_committed(mapping("Ab3dE9", "https://example.com"));

        let mut holder = repo.begin().await.unwrap();
        holder
            .find_by_short_code_for_update("Ab3dE9")
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let repo = repo.clone();
            async move {
                let mut txn = repo.begin().await.unwrap();
                let row = txn.find_by_short_code_for_update("Ab3dE9").await.unwrap();
                txn.commit().await.unwrap();
                row
            }
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        holder.delete_mapping("Ab3dE9").await.unwrap();
        holder.commit().await.unwrap();

        // NOTE: the waiter observes the holder's committed delete
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_original_url_sees_own_writes() {
        let repo = MemoryUrlRepository::new();
        let mut older = mapping("older1", "https://example.com");
        older.created_at -= time::Duration::hours(1);
        repo.insert_committed(older);

        let mut txn = repo.begin().await.unwrap();
        txn.insert_mapping(mapping("newer1", "https://example.com"))
            .await
            .unwrap();
        let codes: Vec<_> = txn
            .find_by_original_url("https://example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.short_code)
            .collect();
        assert_eq!(codes, ["newer1", "older1"]);

        txn.delete_mapping("older1").await.unwrap();
        assert_eq!(
            txn.find_by_original_url("https://example.com")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_expired_urls() {
        let repo = MemoryUrlRepository::new();
        let now = OffsetDateTime::now_utc();
        let mut stale = mapping("stale1", "https://stale.example.com");
        stale.created_at = now - time::Duration::hours(30);
        repo.insert_committed(stale);
        repo.insert_committed(mapping("fresh1", "https://fresh.example.com"));

        let deleted = repo
            .delete_expired_urls(now - time::Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(repo.committed_rows().len(), 1);
        assert!(repo.get_committed("fresh1").is_some());
    }
}
