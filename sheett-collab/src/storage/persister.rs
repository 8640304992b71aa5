//! Local durability for one client-side store.
//!
//! [`Persister`] is the synchronous snapshot/delta API over a shared
//! [`DocumentStore`]. [`AutoSave`] runs it in the background: every local or
//! merged patch is recorded, patches arriving within the debounce window are
//! coalesced into one delta, and failed writes are retried with exponential
//! backoff. When retries run out the pending changes stay in memory and the
//! status channel reports [`PersistStatus::MemoryOnly`]; mutation is never
//! blocked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sheett_core::{lock_store, MergeableStore, Patch, SharedStore, Snapshot};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::rocks::{DocumentMetadata, DocumentStore, LoadedDocument, StoreError};

/// Storage a [`Persister`] writes through.
pub trait DocumentStorage: Send + Sync {
    fn load_document(&self, doc_id: &str, replica_id: &str) -> Result<Option<LoadedDocument>, StoreError>;
    fn store_patch(&self, doc_id: &str, version: u64, patch: &Patch) -> Result<u64, StoreError>;
    fn checkpoint(
        &self,
        doc_id: &str,
        snapshot: &Snapshot,
        covers_version: u64,
    ) -> Result<DocumentMetadata, StoreError>;
    /// Flush buffered writes to disk.
    fn sync(&self) -> Result<(), StoreError>;
}

impl DocumentStorage for DocumentStore {
    fn load_document(&self, doc_id: &str, replica_id: &str) -> Result<Option<LoadedDocument>, StoreError> {
        DocumentStore::load_document(self, doc_id, replica_id)
    }

    fn store_patch(&self, doc_id: &str, version: u64, patch: &Patch) -> Result<u64, StoreError> {
        DocumentStore::store_patch(self, doc_id, version, patch)
    }

    fn checkpoint(
        &self,
        doc_id: &str,
        snapshot: &Snapshot,
        covers_version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        DocumentStore::checkpoint(self, doc_id, snapshot, covers_version)
    }

    fn sync(&self) -> Result<(), StoreError> {
        DocumentStore::sync(self)
    }
}

/// Receives every patch applied to a store so it can be persisted.
pub trait PatchSink: Send + Sync {
    fn record(&self, patch: &Patch);
}

/// Auto-save tuning.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Quiet period before pending patches are written
    pub debounce: Duration,
    /// Retries per write before falling back to memory-only mode
    pub max_retries: u32,
    /// First retry delay; doubles on every attempt
    pub retry_base_delay: Duration,
    /// Upper bound for any retry delay, including memory-only mode
    pub max_retry_delay: Duration,
    /// Write a snapshot after this many deltas (0 = only on shutdown)
    pub checkpoint_every: u64,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(30),
            checkpoint_every: 100,
        }
    }
}

impl PersisterConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(10),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(50),
            checkpoint_every: 4,
        }
    }
}

/// Latest outcome reported by [`AutoSave`].
#[derive(Debug, Clone, PartialEq)]
pub enum PersistStatus {
    Idle,
    /// Pending changes written up to this delta version
    Saved { version: u64 },
    /// Snapshot written; deltas up to `version` compacted
    Checkpointed { version: u64 },
    /// Storage kept failing; `pending` changes are held in memory only
    MemoryOnly { error: StoreError, pending: usize },
}

/// Snapshot/delta persistence for a single document id.
pub struct Persister {
    storage: Arc<dyn DocumentStorage>,
    doc_id: String,
    version: AtomicU64,
}

impl Persister {
    pub fn new(storage: Arc<dyn DocumentStorage>, doc_id: impl Into<String>) -> Self {
        Self {
            storage,
            doc_id: doc_id.into(),
            version: AtomicU64::new(0),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Highest delta version written or loaded.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Restore the store, or `None` if nothing was ever saved.
    ///
    /// `replica_id` is only used when no snapshot exists yet; a snapshot
    /// restores the replica id it was written with.
    pub fn load(&self, replica_id: &str) -> Result<Option<MergeableStore>, StoreError> {
        match self.storage.load_document(&self.doc_id, replica_id)? {
            Some(loaded) => {
                self.version.fetch_max(loaded.version, Ordering::SeqCst);
                log::debug!(
                    "Loaded {} (v{}, {} deltas replayed)",
                    self.doc_id,
                    loaded.version,
                    loaded.replayed_deltas
                );
                Ok(Some(loaded.store))
            }
            None => Ok(None),
        }
    }

    /// Append one patch to the delta log. Returns its version.
    pub fn save(&self, patch: &Patch) -> Result<u64, StoreError> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.storage.store_patch(&self.doc_id, version, patch)?;
        Ok(version)
    }

    /// Write a snapshot covering every delta saved so far and compact.
    pub fn checkpoint(&self, snapshot: &Snapshot) -> Result<DocumentMetadata, StoreError> {
        self.storage.checkpoint(&self.doc_id, snapshot, self.version())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.storage.sync()
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        if let Err(e) = self.storage.sync() {
            log::error!("Failed to flush storage for {}: {e}", self.doc_id);
        }
    }
}

/// Patches recorded but not yet written.
#[derive(Default)]
struct Pending {
    patch: Mutex<Patch>,
    notify: Notify,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, Patch> {
        self.patch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self) -> Patch {
        std::mem::take(&mut *self.lock()).coalesce()
    }

    /// Put a failed batch back in front of anything recorded since.
    fn restore(&self, batch: Patch) -> usize {
        let mut pending = self.lock();
        let newer = std::mem::replace(&mut *pending, batch);
        pending.extend(newer);
        pending.len()
    }
}

impl PatchSink for Pending {
    fn record(&self, patch: &Patch) {
        if patch.is_empty() {
            return;
        }
        self.lock().extend(patch.clone());
        self.notify.notify_one();
    }
}

/// Background debounced saver for one store.
pub struct AutoSave {
    pending: Arc<Pending>,
    persister: Arc<Persister>,
    store: SharedStore,
    config: PersisterConfig,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<PersistStatus>,
    task: Option<JoinHandle<()>>,
}

impl AutoSave {
    /// Start the background task. Must be called inside a tokio runtime.
    pub fn spawn(persister: Arc<Persister>, store: SharedStore, config: PersisterConfig) -> Self {
        let pending = Arc::new(Pending::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(PersistStatus::Idle);

        let task = tokio::spawn(run_auto_save(
            pending.clone(),
            persister.clone(),
            store.clone(),
            config.clone(),
            status_tx,
            shutdown_rx,
        ));

        Self {
            pending,
            persister,
            store,
            config,
            shutdown_tx,
            status_rx,
            task: Some(task),
        }
    }

    /// Record a patch for the next write.
    pub fn record(&self, patch: &Patch) {
        self.pending.record(patch);
    }

    /// A sink handle that feeds this auto-saver.
    pub fn sink(&self) -> Arc<dyn PatchSink> {
        self.pending.clone()
    }

    pub fn status(&self) -> watch::Receiver<PersistStatus> {
        self.status_rx.clone()
    }

    /// Number of changes recorded but not yet written.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the task, write what is pending and checkpoint.
    pub async fn shutdown(mut self) -> Result<(), StoreError> {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Auto-save task for {} failed: {e}", self.persister.doc_id());
            }
        }

        let batch = self.pending.take();
        if !batch.is_empty() {
            if let Err(e) = save_with_retry(&self.persister, &batch, &self.config).await {
                self.pending.restore(batch);
                return Err(e);
            }
        }

        let snapshot = lock_store(&self.store).snapshot();
        let persister = self.persister.clone();
        tokio::task::spawn_blocking(move || persister.checkpoint(&snapshot))
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))??;
        self.persister.flush()
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        if self.task.is_none() {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let batch = self.pending.take();
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.persister.save(&batch) {
            log::error!(
                "Dropping {} unsaved changes for {}: {e}",
                batch.len(),
                self.persister.doc_id()
            );
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Delay before retry `attempt`, capped at `max_retry_delay`.
fn retry_delay(config: &PersisterConfig, attempt: u32) -> Duration {
    backoff(config.retry_base_delay, attempt).min(config.max_retry_delay)
}

async fn save_with_retry(
    persister: &Arc<Persister>,
    batch: &Patch,
    config: &PersisterConfig,
) -> Result<u64, StoreError> {
    let mut attempt = 0;
    loop {
        let p = persister.clone();
        let patch = batch.clone();
        let result = tokio::task::spawn_blocking(move || p.save(&patch))
            .await
            .unwrap_or_else(|e| Err(StoreError::DatabaseError(e.to_string())));
        match result {
            Ok(version) => return Ok(version),
            Err(e) if attempt < config.max_retries => {
                let delay = retry_delay(config, attempt);
                attempt += 1;
                log::warn!(
                    "Save of {} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                    persister.doc_id(),
                    config.max_retries
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_auto_save(
    pending: Arc<Pending>,
    persister: Arc<Persister>,
    store: SharedStore,
    config: PersisterConfig,
    status_tx: watch::Sender<PersistStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut since_checkpoint = 0u64;
    let mut retry_after: Option<Duration> = None;
    let mut failures = 0u32;

    loop {
        let retry = async move {
            match retry_after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = pending.notify.notified() => {}
            _ = retry => {}
            _ = shutdown_rx.changed() => break,
        }

        // Trailing debounce: everything recorded in the window goes in one delta.
        tokio::select! {
            _ = tokio::time::sleep(config.debounce) => {}
            _ = shutdown_rx.changed() => break,
        }

        let batch = pending.take();
        if batch.is_empty() {
            continue;
        }

        match save_with_retry(&persister, &batch, &config).await {
            Ok(version) => {
                retry_after = None;
                failures = 0;
                since_checkpoint += 1;
                status_tx.send_replace(PersistStatus::Saved { version });
            }
            Err(error) => {
                let held = pending.restore(batch);
                failures += 1;
                let delay = retry_delay(&config, config.max_retries + failures);
                retry_after = Some(delay);
                log::error!(
                    "Storage unavailable for {}, keeping {held} changes in memory: {error}",
                    persister.doc_id()
                );
                status_tx.send_replace(PersistStatus::MemoryOnly {
                    error,
                    pending: held,
                });
                continue;
            }
        }

        if config.checkpoint_every > 0 && since_checkpoint >= config.checkpoint_every {
            let snapshot = lock_store(&store).snapshot();
            let p = persister.clone();
            match tokio::task::spawn_blocking(move || p.checkpoint(&snapshot)).await {
                Ok(Ok(meta)) => {
                    since_checkpoint = 0;
                    log::debug!("Checkpointed {} at v{}", meta.doc_id, meta.snapshot_version);
                    status_tx.send_replace(PersistStatus::Checkpointed {
                        version: meta.snapshot_version,
                    });
                }
                Ok(Err(e)) => log::warn!("Checkpoint of {} failed: {e}", persister.doc_id()),
                Err(e) => log::error!("Checkpoint task for {} failed: {e}", persister.doc_id()),
            }
        }
    }

    log::debug!("Auto-save for {} stopped", persister.doc_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use sheett_core::MergeableStore;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn open_storage() -> (TempDir, Arc<DocumentStore>) {
        let dir = TempDir::new().unwrap();
        let storage = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, Arc::new(storage))
    }

    #[test]
    fn test_load_empty_is_none() {
        let (_dir, storage) = open_storage();
        let persister = Persister::new(storage, "spreadsheetStore-s1");
        assert!(persister.load("r").unwrap().is_none());
        assert_eq!(persister.version(), 0);
    }

    #[test]
    fn test_save_then_load_in_new_persister() {
        let (_dir, storage) = open_storage();
        let mut store = MergeableStore::with_replica("spreadsheetStore-s1", "A");

        {
            let persister = Persister::new(storage.clone(), "spreadsheetStore-s1");
            assert_eq!(persister.save(&store.set_value("name", "Budget")).unwrap(), 1);
            assert_eq!(persister.save(&store.set_cell("cells", "0-0", "value", 3.0)).unwrap(), 2);
        }

        let persister = Persister::new(storage, "spreadsheetStore-s1");
        let restored = persister.load("B").unwrap().unwrap();
        assert_eq!(restored.visible_values(), store.visible_values());
        assert_eq!(restored.visible_tables(), store.visible_tables());
        assert_eq!(persister.version(), 2);
        // Next write continues after the loaded version.
        assert_eq!(persister.save(&Patch::new()).unwrap(), 3);
    }

    #[test]
    fn test_checkpoint_compacts_and_keeps_replica() {
        let (_dir, storage) = open_storage();
        let persister = Persister::new(storage.clone(), "doc");
        let mut store = MergeableStore::with_replica("doc", "A");
        persister.save(&store.set_value("name", "Budget")).unwrap();
        persister.save(&store.set_value("name", "Budget v2")).unwrap();

        let meta = persister.checkpoint(&store.snapshot()).unwrap();
        assert_eq!(meta.snapshot_version, 2);
        assert!(storage.load_all_deltas("doc").unwrap().is_empty());

        let restored = persister.load("other").unwrap().unwrap();
        assert_eq!(restored.replica_id(), "A");
        assert_eq!(restored.get_value("name").and_then(|v| v.as_str()), Some("Budget v2"));
        assert_eq!(restored.counter(), store.counter());
    }

    #[tokio::test]
    async fn test_auto_save_coalesces_and_shutdown_checkpoints() {
        let (_dir, storage) = open_storage();
        let persister = Arc::new(Persister::new(storage.clone(), "doc"));
        let shared: SharedStore = Arc::new(Mutex::new(MergeableStore::with_replica("doc", "A")));
        let auto = AutoSave::spawn(persister.clone(), shared.clone(), PersisterConfig::for_testing());
        let mut status = auto.status();

        for i in 0..5 {
            let patch = lock_store(&shared).set_cell("cells", "0-0", "value", i as f64);
            auto.record(&patch);
        }

        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| matches!(s, PersistStatus::Saved { .. })))
            .await
            .unwrap()
            .unwrap();
        // Five edits of one field in one window collapse into one delta.
        let deltas = storage.load_all_deltas("doc").unwrap();
        assert_eq!(deltas.len(), 1);

        let patch = lock_store(&shared).set_value("name", "Budget");
        auto.sink().record(&patch);
        auto.shutdown().await.unwrap();

        assert!(storage.load_all_deltas("doc").unwrap().is_empty());
        let restored = Persister::new(storage, "doc").load("x").unwrap().unwrap();
        assert_eq!(restored.get_value("name").and_then(|v| v.as_str()), Some("Budget"));
        assert_eq!(restored.get_cell("cells", "0-0", "value").and_then(|v| v.as_f64()), Some(4.0));
    }

    #[tokio::test]
    async fn test_drop_flushes_pending() {
        let (_dir, storage) = open_storage();
        let persister = Arc::new(Persister::new(storage.clone(), "doc"));
        let shared: SharedStore = Arc::new(Mutex::new(MergeableStore::with_replica("doc", "A")));
        let config = PersisterConfig {
            debounce: Duration::from_secs(60),
            ..PersisterConfig::for_testing()
        };
        let auto = AutoSave::spawn(persister, shared.clone(), config);

        let patch = lock_store(&shared).set_value("description", "Q1 plan");
        auto.record(&patch);
        assert_eq!(auto.pending_len(), 1);
        drop(auto);

        let restored = Persister::new(storage, "doc").load("x").unwrap().unwrap();
        assert_eq!(
            restored.get_value("description").and_then(|v| v.as_str()),
            Some("Q1 plan")
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff(base, 0), Duration::from_millis(10));
        assert_eq!(backoff(base, 3), Duration::from_millis(80));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = PersisterConfig::default();
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(200));
        // 100ms * 2^16 would be close to two hours.
        assert_eq!(retry_delay(&config, 16), Duration::from_secs(30));
        assert_eq!(retry_delay(&config, u32::MAX), Duration::from_secs(30));
    }

    /// Storage that refuses every write while `failing` is set.
    struct FlakyStorage {
        inner: Arc<DocumentStore>,
        failing: AtomicBool,
    }

    impl FlakyStorage {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::DatabaseError("disk unavailable".into()));
            }
            Ok(())
        }
    }

    impl DocumentStorage for FlakyStorage {
        fn load_document(&self, doc_id: &str, replica_id: &str) -> Result<Option<LoadedDocument>, StoreError> {
            self.inner.load_document(doc_id, replica_id)
        }

        fn store_patch(&self, doc_id: &str, version: u64, patch: &Patch) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.store_patch(doc_id, version, patch)
        }

        fn checkpoint(
            &self,
            doc_id: &str,
            snapshot: &Snapshot,
            covers_version: u64,
        ) -> Result<DocumentMetadata, StoreError> {
            self.check()?;
            self.inner.checkpoint(doc_id, snapshot, covers_version)
        }

        fn sync(&self) -> Result<(), StoreError> {
            self.inner.sync()
        }
    }

    #[tokio::test]
    async fn test_failing_storage_falls_back_to_memory_and_recovers() {
        let (_dir, storage) = open_storage();
        let flaky = Arc::new(FlakyStorage {
            inner: storage.clone(),
            failing: AtomicBool::new(true),
        });
        let persister = Arc::new(Persister::new(flaky.clone(), "doc"));
        let shared: SharedStore = Arc::new(Mutex::new(MergeableStore::with_replica("doc", "A")));
        let config = PersisterConfig {
            retry_base_delay: Duration::from_millis(20),
            max_retry_delay: Duration::from_millis(200),
            checkpoint_every: 0,
            ..PersisterConfig::for_testing()
        };
        let auto = AutoSave::spawn(persister, shared.clone(), config);
        let mut status = auto.status();

        let patch = lock_store(&shared).set_cell("cells", "0-0", "value", "kept");
        auto.record(&patch);

        let memory_only = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| matches!(s, PersistStatus::MemoryOnly { .. })),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(matches!(
            memory_only,
            PersistStatus::MemoryOnly { pending: 1, error: StoreError::DatabaseError(_) }
        ));
        assert_eq!(auto.pending_len(), 1);
        assert!(storage.load_all_deltas("doc").unwrap().is_empty());

        // Mutations keep working while storage is down.
        let patch = lock_store(&shared).set_value("name", "Budget");
        auto.record(&patch);
        assert_eq!(
            lock_store(&shared).get_value("name").and_then(|v| v.as_str()),
            Some("Budget")
        );

        flaky.failing.store(false, Ordering::SeqCst);
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| matches!(s, PersistStatus::Saved { .. })),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(auto.pending_len(), 0);

        let restored = Persister::new(storage, "doc").load("x").unwrap().unwrap();
        assert_eq!(restored.get_cell("cells", "0-0", "value").and_then(|v| v.as_str()), Some("kept"));
        assert_eq!(restored.get_value("name").and_then(|v| v.as_str()), Some("Budget"));
        drop(auto);
    }
}
