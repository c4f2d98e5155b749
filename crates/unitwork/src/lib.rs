//! unitwork: a metadata-driven persistence session and unit-of-work engine.
//!
//! The engine keeps an in-memory identity map per session, tracks changes
//! for transactional flush, and synchronizes both sides of bidirectional
//! associations through a single entry point. Storage is an external
//! collaborator behind the [`StorageBackend`] trait; entity shapes come from
//! an immutable [`MetadataCatalog`] built once at startup.
//!
//! # Quick start
//!
//! ```ignore
//! let catalog = Arc::new(
//!     MetadataCatalog::builder()
//!         .entity(/* ... */)
//!         .build()?,
//! );
//! let engine = Engine::new(catalog.clone(), MemoryBackend::new(catalog));
//!
//! let mut session = engine.open_session();
//! session.begin_transaction()?;
//! session.save(&employee)?;
//! session.commit()?;
//! session.close();
//!
//! engine.shutdown();
//! ```

pub use unitwork_core::{
    BackendError, BackendErrorKind, CatalogBuilder, Entity, EntityId, EntityMeta, EntityRef,
    EntitySnapshot, Error, FieldMap, FieldMeta, FieldType, Identity, KeyField, KeyShape,
    MetadataCatalog, RelationKind, RelationshipMeta, Result, StorageBackend, Value, entity_id,
};
pub use unitwork_session::{
    ChangeRecord, ChangeTracker, EntityKey, EntityState, FlushPlan, IdentityMap, QueryExecutor,
    RelationshipSynchronizer, Session, SessionConfig,
};

use std::sync::Arc;

/// A caller-owned catalog + backend pair with explicit lifecycle.
///
/// The engine is created once, hands out sessions (each session gets its own
/// backend handle cloned from the engine's), and is shut down explicitly.
/// There is no global state: dropping the engine releases its handle, and
/// sessions already open keep working until closed.
pub struct Engine<B: StorageBackend + Clone> {
    catalog: Arc<MetadataCatalog>,
    backend: B,
}

impl<B: StorageBackend + Clone> Engine<B> {
    /// Create an engine over a built catalog and a backend handle.
    pub fn new(catalog: Arc<MetadataCatalog>, backend: B) -> Self {
        tracing::debug!(entity_types = catalog.len(), "Engine created");
        Self { catalog, backend }
    }

    /// The shared metadata catalog.
    pub fn catalog(&self) -> &Arc<MetadataCatalog> {
        &self.catalog
    }

    /// Open a session with default configuration.
    pub fn open_session(&self) -> Session<B> {
        Session::new(self.catalog.clone(), self.backend.clone())
    }

    /// Open a session with custom configuration.
    pub fn open_session_with_config(&self, config: SessionConfig) -> Session<B> {
        Session::with_config(self.catalog.clone(), self.backend.clone(), config)
    }

    /// Shut the engine down, releasing its backend handle.
    pub fn shutdown(self) {
        tracing::debug!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct NullBackend;

    impl StorageBackend for NullBackend {
        fn begin(&mut self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
        fn commit(&mut self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
        fn rollback(&mut self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
        fn fetch_by_identity(
            &mut self,
            _entity_type: &str,
            _identity: &Identity,
        ) -> std::result::Result<Option<FieldMap>, BackendError> {
            Ok(None)
        }
        fn execute_insert(
            &mut self,
            _snapshot: &EntitySnapshot,
        ) -> std::result::Result<Identity, BackendError> {
            Err(BackendError::transaction("null backend"))
        }
        fn execute_update(
            &mut self,
            _snapshot: &EntitySnapshot,
        ) -> std::result::Result<(), BackendError> {
            Err(BackendError::transaction("null backend"))
        }
        fn execute_delete(
            &mut self,
            _entity_type: &str,
            _identity: &Identity,
        ) -> std::result::Result<(), BackendError> {
            Err(BackendError::transaction("null backend"))
        }
    }

    fn catalog() -> Arc<MetadataCatalog> {
        Arc::new(
            MetadataCatalog::builder()
                .entity(EntityMeta::new(
                    "employee",
                    KeyShape::single("nss", FieldType::Text),
                    vec![FieldMeta::new("nss", FieldType::Text)],
                ))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_engine_opens_independent_sessions() {
        let engine = Engine::new(catalog(), NullBackend);

        let mut first = engine.open_session();
        let mut second = engine.open_session();

        // Each session has its own identity map: the same missing row is
        // checked independently.
        let identity = Identity::from_value(Value::from("12345678A")).unwrap();
        assert!(first.get("employee", &identity).unwrap().is_none());
        assert!(second.get("employee", &identity).unwrap().is_none());

        first.close();
        second.close();
        engine.shutdown();
    }

    #[test]
    fn test_engine_session_config_passthrough() {
        let engine = Engine::new(catalog(), NullBackend);
        let session = engine.open_session_with_config(SessionConfig {
            auto_begin: true,
            snapshot_on_load: false,
        });
        assert!(session.config().auto_begin);
        assert!(!session.config().snapshot_on_load);
        session.close();
    }
}
