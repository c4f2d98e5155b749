//! By-identifier query surface.
//!
//! Lookups resolve through the session's identity map first and fall back to
//! the storage backend on a miss. Anything beyond by-identifier access
//! (filters, aggregates) is the backend collaborator's business and has no
//! surface here.

use crate::session::Session;
use unitwork_core::{EntityRef, Identity, Result, StorageBackend, Value};

/// Executes by-identifier lookups against a session.
pub struct QueryExecutor<'a, B: StorageBackend> {
    session: &'a mut Session<B>,
}

impl<'a, B: StorageBackend> QueryExecutor<'a, B> {
    /// Wrap a session.
    pub fn new(session: &'a mut Session<B>) -> Self {
        Self { session }
    }

    /// Find an entity by identity; absent rows are `Ok(None)`.
    pub fn find_by_id(
        &mut self,
        entity_type: &str,
        identity: &Identity,
    ) -> Result<Option<EntityRef>> {
        self.session.get(entity_type, identity)
    }

    /// Find an entity by identity, failing with
    /// [`EntityNotFound`](unitwork_core::Error::EntityNotFound) when absent.
    pub fn require_by_id(&mut self, entity_type: &str, identity: &Identity) -> Result<EntityRef> {
        self.session.load(entity_type, identity)
    }

    /// Convenience: find by raw key components, validating them against the
    /// catalog's key shape first.
    pub fn find_by_components(
        &mut self,
        entity_type: &str,
        components: Vec<Value>,
    ) -> Result<Option<EntityRef>> {
        let identity = self.session.identity(entity_type, components)?;
        self.session.get(entity_type, &identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unitwork_core::{
        BackendError, Entity, EntityMeta, EntitySnapshot, FieldMap, FieldMeta, FieldType,
        KeyShape, MetadataCatalog,
    };

    struct SingleRowBackend {
        fetches: usize,
    }

    impl StorageBackend for SingleRowBackend {
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
            identity: &Identity,
        ) -> std::result::Result<Option<FieldMap>, BackendError> {
            self.fetches += 1;
            if identity.components() == [Value::from("12345678Z")] {
                let entity = Entity::new("employee")
                    .field("nss", "12345678Z")
                    .field("salary", 1500.0);
                return Ok(Some(entity.fields().clone()));
            }
            Ok(None)
        }

        fn execute_insert(
            &mut self,
            _snapshot: &EntitySnapshot,
        ) -> std::result::Result<Identity, BackendError> {
            Err(BackendError::transaction("read-only backend"))
        }
        fn execute_update(
            &mut self,
            _snapshot: &EntitySnapshot,
        ) -> std::result::Result<(), BackendError> {
            Err(BackendError::transaction("read-only backend"))
        }
        fn execute_delete(
            &mut self,
            _entity_type: &str,
            _identity: &Identity,
        ) -> std::result::Result<(), BackendError> {
            Err(BackendError::transaction("read-only backend"))
        }
    }

    fn catalog() -> Arc<MetadataCatalog> {
        Arc::new(
            MetadataCatalog::builder()
                .entity(EntityMeta::new(
                    "employee",
                    KeyShape::single("nss", FieldType::Text),
                    vec![
                        FieldMeta::new("nss", FieldType::Text),
                        FieldMeta::new("salary", FieldType::Double).nullable(true),
                    ],
                ))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_find_by_id_caches_in_identity_map() {
        let mut session = Session::new(catalog(), SingleRowBackend { fetches: 0 });
        let identity = Identity::from_value(Value::from("12345678Z")).unwrap();

        let first = session.query().find_by_id("employee", &identity).unwrap().unwrap();
        let second = session.query().find_by_id("employee", &identity).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(session.backend().fetches, 1);
    }

    #[test]
    fn test_require_by_id_distinguishes_absent() {
        let mut session = Session::new(catalog(), SingleRowBackend { fetches: 0 });
        let missing = Identity::from_value(Value::from("00000000X")).unwrap();

        assert!(session.query().find_by_id("employee", &missing).unwrap().is_none());
        let err = session.query().require_by_id("employee", &missing).unwrap_err();
        assert!(matches!(err, unitwork_core::Error::EntityNotFound { .. }));
    }

    #[test]
    fn test_find_by_components_validates_shape() {
        let mut session = Session::new(catalog(), SingleRowBackend { fetches: 0 });

        let found = session
            .query()
            .find_by_components("employee", vec![Value::from("12345678Z")])
            .unwrap();
        assert!(found.is_some());

        let err = session
            .query()
            .find_by_components("employee", vec![Value::Int(3)])
            .unwrap_err();
        assert!(matches!(err, unitwork_core::Error::InvalidIdentity { .. }));
    }
}
