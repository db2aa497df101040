//! Read/write-through cache over the allow-list store
//!
//! Reads are answered from an in-memory [`Snapshot`] once it has been loaded;
//! before that every read goes to the backend. Writes always go to the backend
//! first and then await a full snapshot reload, so a caller that awaited a
//! mutation sees its effect on the very next read.
//!
//! Concurrency:
//! - the snapshot is an `Arc` swapped under a short `RwLock`, readers never see a partial set
//! - reloads are serialized, the installed snapshot is always the latest complete state
//! - query failures are logged and turned into `false` / empty results

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::{fold_name, normalize_name};
use crate::storage::{AllowEntry, Store};
use crate::{Error, Result};

/// Immutable copy of the allow-list table
#[derive(Debug, Default)]
pub struct Snapshot {
    names: Vec<String>,
    folded: HashSet<String>,
}

impl Snapshot {
    /// `names` must already be in backend order
    pub fn new(names: Vec<String>) -> Self {
        let folded = names.iter().map(|n| fold_name(n)).collect();
        Self { names, folded }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.folded.contains(&fold_name(name))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Per-name results of [`Repository::add_batch`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub added: usize,
    /// Already on the list (case-insensitively)
    pub present: usize,
    /// Rejected by [`normalize_name`] before reaching the store
    pub invalid: usize,
    pub failed: usize,
}

pub struct Repository {
    store: Arc<dyn Store>,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Repository {
    /// Wrap a store. The snapshot starts cold; call [`Repository::refresh`] to warm it.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn is_warm(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn install(&self, next: Option<Arc<Snapshot>>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    // ========== Reads ==========

    /// Membership from memory only. `None` while the snapshot is cold.
    pub fn contains_cached(&self, name: &str) -> Option<bool> {
        self.current().map(|snapshot| snapshot.contains(name))
    }

    /// Case-insensitive membership test
    pub async fn contains(&self, name: &str) -> bool {
        if let Some(hit) = self.contains_cached(name) {
            return hit;
        }

        tracing::debug!("Snapshot cold, asking the backend about {}", name);
        match self.store.exists(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("Failed to check {} against the whitelist: {}", name, e);
                false
            }
        }
    }

    /// All names ordered by name
    pub async fn list_all(&self) -> Vec<String> {
        if let Some(snapshot) = self.current() {
            return snapshot.names().to_vec();
        }

        match self.store.names().await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!("Failed to list the whitelist: {}", e);
                Vec::new()
            }
        }
    }

    /// Names with their insertion time, always read from the backend
    pub async fn entries(&self) -> Vec<AllowEntry> {
        match self.store.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to list whitelist entries: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        if let Some(snapshot) = self.current() {
            return snapshot.is_empty();
        }

        match self.store.any().await {
            Ok(any) => !any,
            Err(e) => {
                tracing::error!("Failed to check for whitelist rows: {}", e);
                true
            }
        }
    }

    pub async fn len(&self) -> usize {
        if let Some(snapshot) = self.current() {
            return snapshot.len();
        }

        match self.store.count().await {
            Ok(count) => count as usize,
            Err(e) => {
                tracing::error!("Failed to count the whitelist: {}", e);
                0
            }
        }
    }

    // ========== Writes ==========

    /// Insert unless present; `true` only when a row was created
    pub async fn add(&self, name: &str) -> bool {
        let Ok(name) = normalize_name(name) else {
            tracing::warn!("Refusing to add invalid name {:?}", name);
            return false;
        };
        match self.store.insert(name).await {
            Ok(created) => {
                if created {
                    self.refresh_after_write().await;
                }
                created
            }
            Err(e) => {
                tracing::error!("Failed to add {} to the whitelist: {}", name, e);
                false
            }
        }
    }

    /// Insert many names with the same uniqueness check as [`Repository::add`],
    /// reloading the snapshot once at the end.
    pub async fn add_batch<I, S>(&self, names: I) -> BatchOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcome = BatchOutcome::default();
        for name in names {
            let Ok(name) = normalize_name(name.as_ref()) else {
                tracing::warn!("Skipping invalid name {:?}", name.as_ref());
                outcome.invalid += 1;
                continue;
            };
            match self.store.insert(name).await {
                Ok(true) => outcome.added += 1,
                Ok(false) => outcome.present += 1,
                Err(e) => {
                    tracing::error!("Failed to add {} to the whitelist: {}", name, e);
                    outcome.failed += 1;
                }
            }
        }
        if outcome.added > 0 {
            self.refresh_after_write().await;
        }
        outcome
    }

    /// Delete by case-insensitive match; `true` when a row was removed
    pub async fn remove(&self, name: &str) -> bool {
        let Ok(name) = normalize_name(name) else {
            return false;
        };
        match self.store.delete(name).await {
            Ok(removed) => {
                if removed {
                    self.refresh_after_write().await;
                }
                removed
            }
            Err(e) => {
                tracing::error!("Failed to remove {} from the whitelist: {}", name, e);
                false
            }
        }
    }

    pub async fn clear(&self) -> bool {
        match self.store.delete_all().await {
            Ok(removed) => {
                tracing::info!("Cleared {} whitelist entries", removed);
                self.refresh_after_write().await;
                true
            }
            Err(e) => {
                tracing::error!("Failed to clear the whitelist: {}", e);
                false
            }
        }
    }

    async fn refresh_after_write(&self) {
        // The write itself is durable; a failed reload only costs the warm cache.
        if let Err(e) = self.refresh().await {
            tracing::warn!("Whitelist changed but the cache could not be reloaded: {}", e);
        }
    }

    // ========== Snapshot ==========

    /// Reload the whole table into a fresh snapshot.
    ///
    /// On failure the snapshot is dropped so reads fall back to the backend
    /// rather than serving a set known to be behind.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let started = Instant::now();

        match self.store.names().await {
            Ok(names) => {
                let snapshot = Snapshot::new(names);
                tracing::debug!(
                    "Whitelist snapshot reloaded: {} names in {:?}",
                    snapshot.len(),
                    started.elapsed()
                );
                self.install(Some(Arc::new(snapshot)));
                Ok(())
            }
            Err(e) => {
                self.install(None);
                Err(e)
            }
        }
    }

    pub async fn shutdown(&self) {
        self.install(None);
        self.store.close().await;
    }
}

/// Refuse to hand out a repository that was never built.
pub fn require(repository: Option<&Arc<Repository>>) -> Result<&Arc<Repository>> {
    repository.ok_or(Error::NotReady)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendKind, SqliteStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn repository() -> Repository {
        Repository::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    /// Wraps a real store, counts backend reads and can be told to fail
    struct Flaky {
        inner: SqliteStore,
        fail: AtomicBool,
        reads: AtomicUsize,
    }

    impl Flaky {
        fn new() -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                fail: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            }
        }

        fn check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Task("backend offline".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for Flaky {
        fn kind(&self) -> BackendKind {
            BackendKind::Sqlite
        }
        async fn insert(&self, username: &str) -> Result<bool> {
            self.check()?;
            self.inner.insert(username).await
        }
        async fn delete(&self, username: &str) -> Result<bool> {
            self.check()?;
            self.inner.delete(username).await
        }
        async fn exists(&self, username: &str) -> Result<bool> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.exists(username).await
        }
        async fn names(&self) -> Result<Vec<String>> {
            self.check()?;
            self.inner.names().await
        }
        async fn entries(&self) -> Result<Vec<AllowEntry>> {
            self.check()?;
            self.inner.entries().await
        }
        async fn delete_all(&self) -> Result<u64> {
            self.check()?;
            self.inner.delete_all().await
        }
        async fn any(&self) -> Result<bool> {
            self.check()?;
            self.inner.any().await
        }
        async fn count(&self) -> Result<u64> {
            self.check()?;
            self.inner.count().await
        }
        async fn close(&self) {}
    }

    #[test]
    fn test_snapshot_membership_ignores_case() {
        let snapshot = Snapshot::new(vec!["Alice".to_string(), "bob".to_string()]);
        assert!(snapshot.contains("ALICE"));
        assert!(snapshot.contains("Bob"));
        assert!(!snapshot.contains("carol"));
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_add_visible_under_other_case() {
        let repo = repository();
        repo.refresh().await.unwrap();

        assert!(repo.add("Steve").await);
        assert_eq!(repo.contains_cached("sTEVE"), Some(true));
        assert!(repo.contains("STEVE").await);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let repo = repository();
        repo.refresh().await.unwrap();

        assert!(repo.add("Alex").await);
        assert!(!repo.add("alex").await);
        assert_eq!(repo.store().count().await.unwrap(), 1);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_then_absent() {
        let repo = repository();
        repo.refresh().await.unwrap();
        repo.add("Notch").await;

        assert!(repo.remove("NOTCH").await);
        assert!(!repo.contains("notch").await);
        assert!(!repo.remove("notch").await);
    }

    #[tokio::test]
    async fn test_accented_names_never_reach_the_store() {
        let repo = repository();
        repo.refresh().await.unwrap();

        assert!(!repo.add("Émile").await);
        assert!(!repo.add("émile").await);
        assert_eq!(repo.store().count().await.unwrap(), 0);
        assert!(!repo.remove("émile").await);
        assert!(!repo.contains("émile").await);

        // membership and the unique index agree for every accepted name
        assert!(repo.add("Emile_1").await);
        assert!(!repo.add("EMILE_1").await);
        assert_eq!(repo.store().count().await.unwrap(), 1);
        assert!(repo.remove("emile_1").await);
        assert!(!repo.contains("Emile_1").await);
        assert_eq!(repo.contains_cached("emile_1"), Some(false));
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let repo = repository();
        repo.refresh().await.unwrap();
        for name in ["a1", "b2", "c3"] {
            repo.add(name).await;
        }

        assert!(repo.clear().await);
        assert!(repo.is_empty().await);
        assert!(repo.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_all_is_ordered() {
        let repo = repository();
        repo.refresh().await.unwrap();
        for name in ["zed", "Amy", "bob"] {
            repo.add(name).await;
        }

        assert_eq!(repo.list_all().await, vec!["Amy", "bob", "zed"]);
    }

    #[tokio::test]
    async fn test_cold_reads_fall_back_to_backend() {
        let store = Arc::new(Flaky::new());
        store.inner.insert("Early").await.unwrap();
        let repo = Repository::new(store.clone());

        assert!(!repo.is_warm());
        assert_eq!(repo.contains_cached("early"), None);
        assert!(repo.contains("early").await);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(repo.list_all().await, vec!["Early"]);
        assert!(!repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_warm_reads_never_touch_backend() {
        let store = Arc::new(Flaky::new());
        store.inner.insert("Warm").await.unwrap();
        let repo = Repository::new(store.clone());
        repo.refresh().await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            assert!(repo.contains("warm").await);
            assert!(!repo.contains("cold").await);
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_become_false() {
        let store = Arc::new(Flaky::new());
        let repo = Repository::new(store.clone());
        store.fail.store(true, Ordering::SeqCst);

        assert!(!repo.add("x").await);
        assert!(!repo.remove("x").await);
        assert!(!repo.clear().await);
        assert!(!repo.contains("x").await);
        assert!(repo.is_empty().await);

        let outcome = repo.add_batch(["x", "y"]).await;
        assert_eq!(outcome, BatchOutcome { added: 0, present: 0, invalid: 0, failed: 2 });
    }

    #[tokio::test]
    async fn test_add_batch_counts_duplicates() {
        let repo = repository();
        repo.add("Alice").await;

        let outcome = repo
            .add_batch(vec!["alice".to_string(), "Bob".to_string(), "BOB".to_string(), " ".to_string()])
            .await;
        assert_eq!(outcome, BatchOutcome { added: 1, present: 2, invalid: 1, failed: 0 });
        assert!(repo.is_warm());
        assert_eq!(repo.list_all().await, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_failed_refresh_drops_snapshot() {
        let store = Arc::new(Flaky::new());
        let repo = Repository::new(store.clone());
        repo.refresh().await.unwrap();
        assert!(repo.is_warm());

        store.fail.store(true, Ordering::SeqCst);
        assert!(repo.refresh().await.is_err());
        assert!(!repo.is_warm());
    }

    #[tokio::test]
    async fn test_awaited_add_is_read_back_from_other_task() {
        let repo = Arc::new(repository());
        repo.refresh().await.unwrap();

        let writer = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.add("X").await })
        };
        assert!(writer.await.unwrap());

        let reader = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.contains("x").await })
        };
        assert!(reader.await.unwrap());
    }

    #[test]
    fn test_require_missing_repository() {
        assert!(matches!(require(None), Err(Error::NotReady)));
    }
}
