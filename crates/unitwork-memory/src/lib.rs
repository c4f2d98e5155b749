//! In-memory storage backend.
//!
//! [`MemoryBackend`] implements the engine's outbound
//! [`StorageBackend`](unitwork_core::StorageBackend) contract against plain
//! process memory: a committed store shared between handles, a per-handle
//! transaction working copy, per-type sequences for generated keys, and
//! uniqueness enforcement on insert.
//!
//! Cloning a handle shares the committed store, so sessions opened from
//! clones observe each other's commits — the way separate connections to one
//! database do. Transactions stage on a working copy: `begin` clones the
//! committed state, `commit` publishes it back (failing when a row inserted
//! in the transaction was committed concurrently by another handle), and
//! `rollback` drops the copy. Concurrent non-conflicting writers are
//! last-writer-wins; this is a test and demo backend, not a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use unitwork_core::{
    BackendError, EntitySnapshot, FieldMap, Identity, MetadataCatalog, StorageBackend, Value,
};

/// One stored row: scalar fields plus owning association identity lists.
#[derive(Debug, Clone, Default)]
struct StoredRow {
    fields: FieldMap,
    links: BTreeMap<String, Vec<Identity>>,
}

/// Tables, sequences, and the operation log.
#[derive(Debug, Clone, Default)]
struct Store {
    tables: HashMap<String, HashMap<Identity, StoredRow>>,
    sequences: HashMap<String, i64>,
    /// Human-readable log of executed write operations, in order.
    log: Vec<String>,
}

impl Store {
    fn row(&self, entity_type: &str, identity: &Identity) -> Option<&StoredRow> {
        self.tables.get(entity_type)?.get(identity)
    }
}

/// An in-memory storage backend handle.
pub struct MemoryBackend {
    catalog: Arc<MetadataCatalog>,
    shared: Arc<Mutex<Store>>,
    /// Working copy while a transaction is open.
    tx: Option<Store>,
    /// Keys inserted by the open transaction, checked for conflicts at
    /// commit.
    tx_inserted: Vec<(String, Identity)>,
}

impl MemoryBackend {
    /// Create a backend with an empty committed store.
    pub fn new(catalog: Arc<MetadataCatalog>) -> Self {
        Self {
            catalog,
            shared: Arc::new(Mutex::new(Store::default())),
            tx: None,
            tx_inserted: Vec::new(),
        }
    }

    /// Number of committed rows for an entity type.
    pub fn committed_count(&self, entity_type: &str) -> usize {
        self.shared
            .lock()
            .expect("store lock poisoned")
            .tables
            .get(entity_type)
            .map_or(0, HashMap::len)
    }

    /// The committed field map of a row, if present.
    pub fn committed_row(&self, entity_type: &str, identity: &Identity) -> Option<FieldMap> {
        self.shared
            .lock()
            .expect("store lock poisoned")
            .row(entity_type, identity)
            .map(|r| r.fields.clone())
    }

    /// The committed association identity list of a row.
    pub fn committed_links(
        &self,
        entity_type: &str,
        identity: &Identity,
        relation: &str,
    ) -> Vec<Identity> {
        self.shared
            .lock()
            .expect("store lock poisoned")
            .row(entity_type, identity)
            .and_then(|r| r.links.get(relation).cloned())
            .unwrap_or_default()
    }

    /// The committed write-operation log, oldest first.
    pub fn operation_log(&self) -> Vec<String> {
        self.shared.lock().expect("store lock poisoned").log.clone()
    }

    fn working(&mut self) -> Result<&mut Store, BackendError> {
        self.tx
            .as_mut()
            .ok_or_else(|| BackendError::transaction("no open transaction"))
    }

    fn next_sequence(store: &mut Store, entity_type: &str) -> i64 {
        let counter = store.sequences.entry(entity_type.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

impl Clone for MemoryBackend {
    /// A clone shares the committed store but has its own transaction
    /// state.
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            shared: Arc::clone(&self.shared),
            tx: None,
            tx_inserted: Vec::new(),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn begin(&mut self) -> Result<(), BackendError> {
        if self.tx.is_some() {
            return Err(BackendError::transaction("transaction already open"));
        }
        let committed = self.shared.lock().expect("store lock poisoned").clone();
        self.tx = Some(committed);
        self.tx_inserted.clear();
        tracing::trace!("Memory transaction opened");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let working = self
            .tx
            .take()
            .ok_or_else(|| BackendError::transaction("no open transaction"))?;
        let inserted = std::mem::take(&mut self.tx_inserted);

        let mut committed = self.shared.lock().expect("store lock poisoned");
        for (entity_type, identity) in &inserted {
            if committed.row(entity_type, identity).is_some() {
                return Err(BackendError::constraint(format!(
                    "row {entity_type}{identity} was inserted concurrently"
                )));
            }
        }
        *committed = working;
        tracing::trace!("Memory transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        if self.tx.take().is_none() {
            return Err(BackendError::transaction("no open transaction"));
        }
        self.tx_inserted.clear();
        tracing::trace!("Memory transaction rolled back");
        Ok(())
    }

    fn fetch_by_identity(
        &mut self,
        entity_type: &str,
        identity: &Identity,
    ) -> Result<Option<FieldMap>, BackendError> {
        if let Some(working) = &self.tx {
            return Ok(working.row(entity_type, identity).map(|r| r.fields.clone()));
        }
        Ok(self
            .shared
            .lock()
            .expect("store lock poisoned")
            .row(entity_type, identity)
            .map(|r| r.fields.clone()))
    }

    fn execute_insert(&mut self, snapshot: &EntitySnapshot) -> Result<Identity, BackendError> {
        let meta = self
            .catalog
            .entity(&snapshot.entity_type)
            .map_err(|e| BackendError::constraint(e.to_string()))?
            .clone();

        let mut fields = snapshot.fields.clone();
        let identity = match &snapshot.identity {
            Some(identity) => identity.clone(),
            None => {
                // Generated keys are single-component integer sequences.
                let store = self.working()?;
                let value = Value::Int(Self::next_sequence(store, &snapshot.entity_type));
                let key_field = meta
                    .key()
                    .fields()
                    .first()
                    .ok_or_else(|| BackendError::constraint("entity type has no key"))?;
                fields.insert(key_field.name().to_string(), value.clone());
                Identity::from_value(value).expect("sequence value is non-null")
            }
        };

        let entity_type = snapshot.entity_type.clone();
        let store = self.working()?;
        let table = store.tables.entry(entity_type.clone()).or_default();
        if table.contains_key(&identity) {
            return Err(BackendError::constraint(format!(
                "duplicate row {entity_type}{identity}"
            )));
        }
        table.insert(
            identity.clone(),
            StoredRow {
                fields,
                links: snapshot.links.clone(),
            },
        );
        store.log.push(format!("insert {entity_type}{identity}"));
        self.tx_inserted.push((entity_type, identity.clone()));
        Ok(identity)
    }

    fn execute_update(&mut self, snapshot: &EntitySnapshot) -> Result<(), BackendError> {
        let identity = snapshot
            .identity
            .clone()
            .ok_or_else(|| BackendError::missing_row("update without identity"))?;

        let entity_type = snapshot.entity_type.clone();
        let store = self.working()?;
        let Some(row) = store
            .tables
            .get_mut(&entity_type)
            .and_then(|t| t.get_mut(&identity))
        else {
            return Err(BackendError::missing_row(format!(
                "no row {entity_type}{identity}"
            )));
        };
        row.fields = snapshot.fields.clone();
        row.links = snapshot.links.clone();
        store.log.push(format!("update {entity_type}{identity}"));
        Ok(())
    }

    fn execute_delete(
        &mut self,
        entity_type: &str,
        identity: &Identity,
    ) -> Result<(), BackendError> {
        let store = self.working()?;
        let removed = store
            .tables
            .get_mut(entity_type)
            .and_then(|t| t.remove(identity));
        if removed.is_none() {
            return Err(BackendError::missing_row(format!(
                "no row {entity_type}{identity}"
            )));
        }
        store.log.push(format!("delete {entity_type}{identity}"));
        Ok(())
    }
}
