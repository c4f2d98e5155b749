//! Dynamic entity records.
//!
//! An [`Entity`] is an instance of a catalog-declared entity type: a type
//! name plus a map of field values. Entities never reference other entities
//! directly; the association graph is owned by the session layer, which keeps
//! entity ownership acyclic. Each instance carries a process-unique
//! [`EntityId`] so the session can track it before the storage backend has
//! assigned a database identity.

use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Field name to value map, ordered for stable iteration and snapshots.
pub type FieldMap = BTreeMap<String, Value>;

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for one in-memory entity instance.
///
/// Distinct from the database identity: two instances representing the same
/// row in different sessions have different `EntityId`s, and a new instance
/// has an `EntityId` before it has any database identity at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    fn next() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An entity instance: declared type name plus field values.
#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    entity_type: String,
    fields: FieldMap,
    detached: bool,
}

impl Entity {
    /// Create an empty entity of the given type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            id: EntityId::next(),
            entity_type: entity_type.into(),
            fields: FieldMap::new(),
            detached: false,
        }
    }

    /// Create an entity from an existing field map (e.g. a fetched row).
    pub fn from_fields(entity_type: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: EntityId::next(),
            entity_type: entity_type.into(),
            fields,
            detached: false,
        }
    }

    /// Builder-style field assignment, for constructing entities inline.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Wrap this entity in a shared handle.
    pub fn into_ref(self) -> EntityRef {
        Arc::new(RwLock::new(self))
    }

    /// The instance handle.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The declared entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Read a field value (`None` when the field was never set).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field value, returning the previous one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Remove a field value.
    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// The full field map.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Whether a closing session has released this instance.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Mark this instance as released. Called by the session on close; a
    /// detached instance can no longer be saved.
    pub fn mark_detached(&mut self) {
        self.detached = true;
    }
}

/// Shared handle to an entity instance.
///
/// The same handle is returned for repeated lookups of one identity within a
/// session, so a modification through any handle is visible through all of
/// them.
pub type EntityRef = Arc<RwLock<Entity>>;

/// Read an entity's `EntityId` through its handle.
pub fn entity_id(entity: &EntityRef) -> EntityId {
    entity.read().expect("entity lock poisoned").id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_are_unique() {
        let a = Entity::new("employee");
        let b = Entity::new("employee");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_builder_fields() {
        let e = Entity::new("employee")
            .field("nss", "12345678A")
            .field("salary", 1500.0);
        assert_eq!(e.get("nss"), Some(&Value::from("12345678A")));
        assert_eq!(e.get("salary"), Some(&Value::Double(1500.0)));
        assert_eq!(e.get("missing"), None);
    }

    #[test]
    fn test_set_returns_previous() {
        let mut e = Entity::new("employee").field("salary", 1500.0);
        let old = e.set("salary", 2000.0);
        assert_eq!(old, Some(Value::Double(1500.0)));
        assert_eq!(e.get("salary"), Some(&Value::Double(2000.0)));
    }

    #[test]
    fn test_shared_handle_visibility() {
        let handle = Entity::new("employee").field("name", "Oscar").into_ref();
        let other = Arc::clone(&handle);

        handle.write().unwrap().set("name", "Cristina");

        assert_eq!(
            other.read().unwrap().get("name"),
            Some(&Value::from("Cristina"))
        );
    }

    #[test]
    fn test_detached_marker() {
        let mut e = Entity::new("employee");
        assert!(!e.is_detached());
        e.mark_detached();
        assert!(e.is_detached());
    }
}
