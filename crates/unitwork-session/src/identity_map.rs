//! Identity Map: one in-memory instance per primary key.
//!
//! The identity map guarantees that within a session, a given
//! (entity type, identity) pair resolves to at most one entity instance.
//! Registration is the *only* path by which an instance becomes visible to
//! later lookups, which is how the uniqueness invariant is enforced:
//!
//! - **Uniqueness**: the same key always returns the same handle
//! - **Cache**: a registered row is never re-fetched from the backend
//! - **Consistency**: a change made through one handle is visible through
//!   every handle for that key
//!
//! Lookups are pure; the map never touches the storage backend.

use crate::EntityKey;
use std::collections::HashMap;
use std::sync::Arc;
use unitwork_core::{EntityId, EntityRef, Error, Result, entity_id};

/// Per-session map from entity key to the single registered instance.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, (EntityId, EntityRef)>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up the registered instance for a key.
    ///
    /// Returns a clone of the stored handle, so modifications are shared.
    pub fn lookup(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).map(|(_, entity)| Arc::clone(entity))
    }

    /// Look up the instance handle id for a key.
    pub fn lookup_id(&self, key: &EntityKey) -> Option<EntityId> {
        self.entries.get(key).map(|(id, _)| *id)
    }

    /// Register an instance under a key.
    ///
    /// Re-registering the same instance is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateIdentity`] if a *different* instance is already
    /// registered under the key.
    pub fn register(&mut self, key: EntityKey, entity: EntityRef) -> Result<()> {
        if let Some((_, existing)) = self.entries.get(&key) {
            if Arc::ptr_eq(existing, &entity) {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity {
                entity_type: key.entity_type().to_string(),
                reason: format!(
                    "identity {} is already bound to a different instance",
                    key.identity()
                ),
            });
        }

        tracing::trace!(key = %key, "Registering entity in identity map");
        let id = entity_id(&entity);
        self.entries.insert(key, (id, entity));
        Ok(())
    }

    /// Remove an entry. Returns `true` when something was evicted.
    ///
    /// Used when an entity is removed and when the session closes.
    pub fn evict(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Check whether a key is registered.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
