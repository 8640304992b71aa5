//! Client-side document sessions.
//!
//! A [`DocumentSession`] owns everything one open store needs on a client:
//! the shared store, its auto-saver and its synchronizer. Every local
//! mutation goes through [`DocumentSession::mutate`], which records the
//! patch for persistence and streams it to the room.
//!
//! A [`SessionRegistry`] holds the sessions of one signed-in user. Its
//! stores are registered in a [`StoreRegistry`], and every spreadsheet it
//! opens or creates is listed in the user's own store
//! (`userStore-<userId>`), which syncs like any other document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sheett_core::spreadsheet::{now_millis, CELLS_TABLE};
use sheett_core::{
    lock_store, CellEdited, CellId, CellRecord, CellValue, CollaboratorRole, CoreError,
    MergeableStore, Patch, SharedStore, SpreadsheetExt, SpreadsheetSummary, StoreId,
    StoreRegistry, SubscriptionId, UserStoreExt,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ConnectionState, SyncConfig, SyncError, SyncEvent, Synchronizer};
use crate::storage::{AutoSave, DocumentStore, PersistStatus, Persister, PersisterConfig, StoreError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Session for {0} is closed")]
    Closed(String),
}

/// Everything needed to open sessions for one signed-in user.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Externally authenticated user id
    pub user_id: String,
    /// Display name announced to other peers
    pub name: String,
    pub sync: SyncConfig,
    pub persister: PersisterConfig,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, sync: SyncConfig) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            sync,
            persister: PersisterConfig::default(),
        }
    }
}

/// One open store on a client.
pub struct DocumentSession {
    doc_id: String,
    store_id: StoreId,
    user_id: String,
    store: SharedStore,
    sync: Synchronizer,
    autosave: Option<AutoSave>,
}

impl DocumentSession {
    /// Load the local copy (or start empty) and start syncing.
    ///
    /// `doc_id` must be a spreadsheet or user store id. Opening a
    /// spreadsheet registers the user as a viewer unless it already has a
    /// role.
    pub async fn open(
        config: &SessionConfig,
        doc_id: &str,
        storage: Arc<DocumentStore>,
    ) -> Result<Self, SessionError> {
        let store_id = StoreId::parse(doc_id)?;
        let persister = Arc::new(Persister::new(storage, doc_id));
        let replica_id = Uuid::new_v4().to_string();

        let loader = persister.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&replica_id).map(|s| (s, replica_id)))
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))??;
        let mut store = match loaded {
            (Some(store), _) => store,
            (None, replica_id) => MergeableStore::with_replica(doc_id, replica_id),
        };
        log::info!("Opened {doc_id} as replica {} for {}", store.replica_id(), config.user_id);

        let joined = match &store_id {
            StoreId::Spreadsheet(_) => store.ensure_collaborator(&config.user_id, CollaboratorRole::Viewer),
            StoreId::User(_) => Patch::new(),
        };
        let store: SharedStore = Arc::new(std::sync::Mutex::new(store));

        let autosave = AutoSave::spawn(persister, store.clone(), config.persister.clone());
        let mut sync = Synchronizer::new(
            doc_id,
            config.user_id.clone(),
            config.name.clone(),
            store.clone(),
            config.sync.clone(),
        );
        sync.set_patch_sink(autosave.sink());
        sync.start();

        let session = Self {
            doc_id: doc_id.to_string(),
            store_id,
            user_id: config.user_id.clone(),
            store,
            sync,
            autosave: Some(autosave),
        };
        session.commit(&joined);
        Ok(session)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The shared store. Do not hold its lock across an await.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Run a local mutation, then persist and stream its patch.
    pub fn mutate<F>(&self, f: F) -> Patch
    where
        F: FnOnce(&mut MergeableStore) -> Patch,
    {
        let patch = f(&mut lock_store(&self.store));
        self.commit(&patch);
        patch
    }

    fn commit(&self, patch: &Patch) {
        if patch.is_empty() {
            return;
        }
        if let Some(autosave) = &self.autosave {
            autosave.record(patch);
        }
        self.sync.send_patch(patch);
    }

    /// Value of a cell, `None` if unset or deleted.
    pub fn get_cell(&self, cell_id: &str) -> Result<Option<CellValue>, SessionError> {
        let cell_id = CellId::parse(cell_id)?;
        Ok(lock_store(&self.store)
            .get_cell(CELLS_TABLE, &cell_id.to_string(), sheett_core::spreadsheet::field::VALUE)
            .cloned())
    }

    /// Write one field of a cell row.
    ///
    /// Writing `value` also stamps the bookkeeping fields.
    pub fn set_cell(
        &self,
        cell_id: &str,
        field: &str,
        value: impl Into<CellValue>,
    ) -> Result<Patch, SessionError> {
        let cell_id = CellId::parse(cell_id)?;
        let value = value.into();
        let user_id = self.user_id.clone();
        Ok(self.mutate(|store| {
            if field == sheett_core::spreadsheet::field::VALUE {
                store.write_cell(&cell_id, value, &user_id, now_millis())
            } else {
                store.set_cell(CELLS_TABLE, &cell_id.to_string(), field, value)
            }
        }))
    }

    pub fn clear_cell(&self, cell_id: &str) -> Result<Patch, SessionError> {
        let cell_id = CellId::parse(cell_id)?;
        Ok(self.mutate(|store| store.clear_cell(&cell_id)))
    }

    /// Apply an edit event coming from the grid.
    pub fn apply_cell_edit(&self, edit: &CellEdited) -> Result<Patch, SessionError> {
        let cell_id = CellId::parse(&edit.cell_id)?;
        let user_id = self.user_id.clone();
        Ok(self.mutate(|store| store.write_cell(&cell_id, edit.value.clone(), &user_id, now_millis())))
    }

    /// Flat records for the grid.
    pub fn cell_records(&self) -> Vec<CellRecord> {
        lock_store(&self.store).cell_records()
    }

    pub fn summary(&self) -> SpreadsheetSummary {
        lock_store(&self.store).summary()
    }

    pub fn rename(&self, name: &str) -> Patch {
        self.mutate(|store| store.rename(name, now_millis()))
    }

    pub fn set_description(&self, description: &str) -> Patch {
        self.mutate(|store| store.set_description(description, now_millis()))
    }

    pub fn role(&self) -> Option<CollaboratorRole> {
        lock_store(&self.store).collaborator_role(&self.user_id)
    }

    /// Call `listener` whenever the row-id set of `table` changes, for
    /// local and remote changes alike. It must not touch the store.
    pub fn subscribe_row_ids<F>(&self, table: &str, listener: F) -> SubscriptionId
    where
        F: FnMut(&str) + Send + 'static,
    {
        lock_store(&self.store).subscribe_row_ids(table, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock_store(&self.store).unsubscribe(id)
    }

    pub async fn try_lock(&self, cell_id: &str) -> Result<(), SessionError> {
        let cell_id = CellId::parse(cell_id)?;
        Ok(self.sync.try_lock(&cell_id.to_string()).await?)
    }

    pub fn unlock(&self, cell_id: &str) -> Result<bool, SessionError> {
        let cell_id = CellId::parse(cell_id)?;
        Ok(self.sync.unlock(&cell_id.to_string()))
    }

    pub fn lock_holder(&self, cell_id: &str) -> Option<String> {
        self.sync.lock_holder(cell_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sync.state()
    }

    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> Result<(), SessionError> {
        Ok(self.sync.wait_for_state(target, limit).await?)
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.sync.take_event_rx()
    }

    /// Persistence status, including the memory-only warning.
    pub fn persist_status(&self) -> Option<watch::Receiver<PersistStatus>> {
        self.autosave.as_ref().map(AutoSave::status)
    }

    /// Release owned locks, close the connection and flush to disk.
    pub async fn close(mut self) -> Result<(), SessionError> {
        for cell_id in self.sync.owned_locks() {
            self.sync.unlock(&cell_id);
        }
        self.sync.close().await;
        if let Some(autosave) = self.autosave.take() {
            autosave.shutdown().await?;
        }
        log::info!("Closed {} for {}", self.doc_id, self.user_id);
        Ok(())
    }
}

/// Open sessions of one user, keyed by store id.
pub struct SessionRegistry {
    config: SessionConfig,
    storage: Arc<DocumentStore>,
    sessions: HashMap<String, DocumentSession>,
    stores: StoreRegistry,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, storage: Arc<DocumentStore>) -> Self {
        Self {
            config,
            storage,
            sessions: HashMap::new(),
            stores: StoreRegistry::new(),
        }
    }

    /// Id of the signed-in user's own store.
    pub fn user_store_id(&self) -> String {
        StoreId::User(self.config.user_id.clone()).to_string()
    }

    async fn open_session(&mut self, doc_id: &str) -> Result<&mut DocumentSession, SessionError> {
        if !self.sessions.contains_key(doc_id) {
            let session = DocumentSession::open(&self.config, doc_id, self.storage.clone()).await?;
            self.stores.register(session.store().clone());
            self.sessions.insert(doc_id.to_string(), session);
        }
        self.sessions
            .get_mut(doc_id)
            .ok_or_else(|| SessionError::Closed(doc_id.to_string()))
    }

    /// The open session for `doc_id`, opening it if needed.
    ///
    /// A spreadsheet is also listed in the user's store.
    pub async fn open(&mut self, doc_id: &str) -> Result<&mut DocumentSession, SessionError> {
        let store_id = StoreId::parse(doc_id)?;
        self.open_session(doc_id).await?;
        if let StoreId::Spreadsheet(id) = &store_id {
            self.list_spreadsheet(id).await?;
        }
        self.open_session(doc_id).await
    }

    async fn list_spreadsheet(&mut self, spreadsheet_id: &str) -> Result<(), SessionError> {
        let user_store_id = self.user_store_id();
        let user = self.open_session(&user_store_id).await?;
        let listed = lock_store(user.store())
            .spreadsheet_ids()
            .iter()
            .any(|id| id == spreadsheet_id);
        if !listed {
            user.mutate(|store| store.join_spreadsheet(spreadsheet_id));
        }
        Ok(())
    }

    /// Create a spreadsheet owned by the user, list it and open it.
    /// Returns the new spreadsheet id.
    pub async fn create_spreadsheet(&mut self, name: &str, description: &str) -> Result<String, SessionError> {
        let user_store_id = self.user_store_id();
        let user = self.open_session(&user_store_id).await?;
        let mut id = String::new();
        user.mutate(|store| {
            let (new_id, patch) = store.add_spreadsheet();
            id = new_id;
            patch
        });

        let doc_id = StoreId::Spreadsheet(id.clone()).to_string();
        let owner = self.config.user_id.clone();
        let session = self.open_session(&doc_id).await?;
        session.mutate(|store| store.create_spreadsheet(&id, name, description, &owner, now_millis()));
        log::info!("Created spreadsheet {id} for {owner}");
        Ok(id)
    }

    /// Ids of the spreadsheets the user created or joined.
    pub async fn spreadsheet_ids(&mut self) -> Result<Vec<String>, SessionError> {
        let user_store_id = self.user_store_id();
        let user = self.open_session(&user_store_id).await?;
        let ids = lock_store(user.store()).spreadsheet_ids();
        Ok(ids)
    }

    /// Close the spreadsheet's session and drop it from the user's list.
    /// Its canonical copy in the room is left alone.
    pub async fn remove_spreadsheet(&mut self, spreadsheet_id: &str) -> Result<(), SessionError> {
        let doc_id = StoreId::Spreadsheet(spreadsheet_id.to_string()).to_string();
        self.close(&doc_id).await?;
        let user_store_id = self.user_store_id();
        let user = self.open_session(&user_store_id).await?;
        user.mutate(|store| store.remove_spreadsheet(spreadsheet_id));
        Ok(())
    }

    pub fn get(&self, doc_id: &str) -> Option<&DocumentSession> {
        self.sessions.get(doc_id)
    }

    /// The registered store of an open session.
    pub fn store(&self, doc_id: &str) -> Option<SharedStore> {
        self.stores.get(doc_id)
    }

    /// Close one session. Returns false if it was not open.
    pub async fn close(&mut self, doc_id: &str) -> Result<bool, SessionError> {
        self.stores.close(doc_id);
        match self.sessions.remove(doc_id) {
            Some(session) => {
                session.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every session; the first error is returned after all tried.
    pub async fn close_all(&mut self) -> Result<(), SessionError> {
        self.stores.clear();
        let mut first_error = None;
        for (doc_id, session) in self.sessions.drain() {
            if let Err(e) = session.close().await {
                log::error!("Closing {doc_id} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Ids of the open stores, sorted.
    pub fn doc_ids(&self) -> Vec<String> {
        self.stores.ids()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use sheett_core::spreadsheet::field;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn offline_config(user_id: &str) -> SessionConfig {
        let mut config = SessionConfig::new(user_id, user_id, SyncConfig::for_testing("ws://127.0.0.1:1"));
        config.persister = PersisterConfig::for_testing();
        config
    }

    fn storage(dir: &TempDir) -> Arc<DocumentStore> {
        Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap())
    }

    #[tokio::test]
    async fn test_open_registers_viewer() {
        let dir = TempDir::new().unwrap();
        let session = DocumentSession::open(&offline_config("u1"), "spreadsheetStore-s1", storage(&dir))
            .await
            .unwrap();
        assert_eq!(session.role(), Some(CollaboratorRole::Viewer));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_role_is_kept() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let config = offline_config("u1");

        let session = DocumentSession::open(&config, "spreadsheetStore-s1", storage.clone()).await.unwrap();
        session.mutate(|store| store.add_collaborator("u1", CollaboratorRole::Owner));
        session.close().await.unwrap();

        let session = DocumentSession::open(&config, "spreadsheetStore-s1", storage).await.unwrap();
        assert_eq!(session.role(), Some(CollaboratorRole::Owner));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cells_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let config = offline_config("u1");

        let session = DocumentSession::open(&config, "spreadsheetStore-s1", storage.clone()).await.unwrap();
        session.set_cell("0-0", field::VALUE, "hello").unwrap();
        session.set_cell("1-2", field::VALUE, 42.0).unwrap();
        session.close().await.unwrap();

        let session = DocumentSession::open(&config, "spreadsheetStore-s1", storage).await.unwrap();
        assert_eq!(session.get_cell("0-0").unwrap(), Some(CellValue::from("hello")));
        assert_eq!(session.get_cell("1-2").unwrap(), Some(CellValue::from(42.0)));
        assert_eq!(session.cell_records().len(), 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_cell_id_fails_at_call_site() {
        let dir = TempDir::new().unwrap();
        let session = DocumentSession::open(&offline_config("u1"), "spreadsheetStore-s1", storage(&dir))
            .await
            .unwrap();
        assert!(matches!(
            session.set_cell("nope", field::VALUE, "x"),
            Err(SessionError::Core(CoreError::InvalidCellId(_)))
        ));
        assert!(session.get_cell("").is_err());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_row_ids_fires_on_new_cell() {
        let dir = TempDir::new().unwrap();
        let session = DocumentSession::open(&offline_config("u1"), "spreadsheetStore-s1", storage(&dir))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        session.subscribe_row_ids(CELLS_TABLE, move |_| *counter.lock().unwrap() += 1);

        session.set_cell("0-0", field::VALUE, "a").unwrap();
        session.set_cell("0-0", field::VALUE, "b").unwrap();
        session.set_cell("0-1", field::VALUE, "c").unwrap();
        assert_eq!(*seen.lock().unwrap(), 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_lock_and_release_on_close() {
        let dir = TempDir::new().unwrap();
        let session = DocumentSession::open(&offline_config("u1"), "spreadsheetStore-s1", storage(&dir))
            .await
            .unwrap();

        session.try_lock("3-4").await.unwrap();
        assert_eq!(session.lock_holder("3-4").as_deref(), Some("u1"));
        assert!(session.unlock("3-4").unwrap());
        assert!(!session.unlock("3-4").unwrap());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_store_id() {
        let dir = TempDir::new().unwrap();
        let result = DocumentSession::open(&offline_config("u1"), "doc-1", storage(&dir)).await;
        assert!(matches!(
            result,
            Err(SessionError::Core(CoreError::InvalidStoreId(ref id))) if id == "doc-1"
        ));
    }

    #[tokio::test]
    async fn test_user_store_has_no_collaborators() {
        let dir = TempDir::new().unwrap();
        let session = DocumentSession::open(&offline_config("u1"), "userStore-u1", storage(&dir))
            .await
            .unwrap();
        assert_eq!(session.store_id(), &StoreId::User("u1".into()));
        assert_eq!(session.role(), None);
        assert!(lock_store(session.store()).row_ids("collaborators").is_empty());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_reuses_open_sessions() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(offline_config("u1"), storage(&dir));

        registry.open("spreadsheetStore-1").await.unwrap().rename("Budget");
        assert_eq!(
            registry.open("spreadsheetStore-1").await.unwrap().summary().name.as_deref(),
            Some("Budget")
        );
        registry.open("spreadsheetStore-2").await.unwrap();
        // Two spreadsheets plus the user's own store.
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.doc_ids(),
            vec!["spreadsheetStore-1", "spreadsheetStore-2", "userStore-u1"]
        );
        assert!(registry.store("spreadsheetStore-1").is_some());

        assert!(registry.close("spreadsheetStore-1").await.unwrap());
        assert!(!registry.close("spreadsheetStore-1").await.unwrap());
        assert!(registry.store("spreadsheetStore-1").is_none());
        registry.close_all().await.unwrap();
        assert!(registry.is_empty());
        assert!(registry.doc_ids().is_empty());
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_store_id() {
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::new(offline_config("u1"), storage(&dir));
        assert!(matches!(
            registry.open("sheet-1").await,
            Err(SessionError::Core(CoreError::InvalidStoreId(_)))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_user_store_lists_created_and_joined_spreadsheets() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let mut registry = SessionRegistry::new(offline_config("u1"), storage.clone());

        let created = registry.create_spreadsheet("Budget", "Q1 plan").await.unwrap();
        let doc_id = format!("spreadsheetStore-{created}");
        let session = registry.get(&doc_id).unwrap();
        assert_eq!(session.role(), Some(CollaboratorRole::Owner));
        assert_eq!(session.summary().name.as_deref(), Some("Budget"));
        assert_eq!(session.summary().id.as_deref(), Some(created.as_str()));

        registry.open("spreadsheetStore-shared").await.unwrap();
        registry.open("spreadsheetStore-shared").await.unwrap();
        let mut ids = registry.spreadsheet_ids().await.unwrap();
        ids.sort();
        let mut expected = vec![created.clone(), "shared".to_string()];
        expected.sort();
        assert_eq!(ids, expected);
        registry.close_all().await.unwrap();

        // The list is persisted with the user's store.
        let mut registry = SessionRegistry::new(offline_config("u1"), storage);
        assert_eq!(registry.spreadsheet_ids().await.unwrap().len(), 2);
        registry.remove_spreadsheet(&created).await.unwrap();
        assert_eq!(registry.spreadsheet_ids().await.unwrap(), vec!["shared".to_string()]);
        registry.close_all().await.unwrap();
    }
}
