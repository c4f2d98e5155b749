//! The Session: public façade of the unit of work.
//!
//! A session owns one identity map, one change tracker, one relationship
//! synchronizer, and one storage backend handle for its lifetime. It moves
//! through a small state machine: open without a transaction, open inside a
//! transaction, closed. Every mutating operation (`save`, `remove`, field
//! and relationship mutation) requires an open transaction; lookups do not.
//!
//! Commit triggers flush: the change tracker computes the operation list,
//! owning references are materialized into the payloads, and the operations
//! go to the backend in dependency order inside the backend transaction.
//!
//! Sessions are single-threaded by contract. Multiple sessions may coexist,
//! each with independent in-memory state; the same row may therefore be
//! represented by distinct instances in different sessions, and no
//! cross-session consistency is provided.

use crate::EntityKey;
use crate::change_tracker::{ChangeTracker, EntityState};
use crate::flush::FlushPlan;
use crate::identity_map::IdentityMap;
use crate::query::QueryExecutor;
use crate::relations::RelationshipSynchronizer;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    Entity, EntityId, EntityRef, EntitySnapshot, Error, Identity, MetadataCatalog, RelationKind,
    Result, StorageBackend, Value, entity_id,
};

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Implicitly open a transaction on the first mutating operation instead
    /// of failing with `NoActiveTransaction`.
    pub auto_begin: bool,
    /// Capture a JSON baseline when entities are loaded so silent field
    /// mutations are detected at flush. With this off, only fields changed
    /// through `set_field` (or explicitly marked) are updated.
    pub snapshot_on_load: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: false,
            snapshot_on_load: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Active,
}

/// What a flush did to the tracked set, journaled so a rollback after a
/// flush can restore pre-flush tracking state (the backend transaction
/// undoes the rows; this undoes the promotions).
enum FlushedChange {
    Inserted {
        id: EntityId,
        /// Key fields the flush filled in from a backend-assigned identity.
        written_key_fields: Vec<String>,
    },
    Updated {
        id: EntityId,
        prior_snapshot: Option<Vec<u8>>,
        prior_dirty: BTreeSet<String>,
    },
    Deleted {
        entity: EntityRef,
    },
}

/// The central unit-of-work manager.
pub struct Session<B: StorageBackend> {
    catalog: Arc<MetadataCatalog>,
    backend: B,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    relations: RelationshipSynchronizer,
    /// Keys removed in this session and not yet flushed; lookups see them
    /// as absent without consulting the backend.
    removed_keys: HashSet<EntityKey>,
    /// Promotions applied by flushes of the open transaction.
    flush_journal: Vec<FlushedChange>,
    tx: TxState,
    config: SessionConfig,
}

impl<B: StorageBackend> Session<B> {
    /// Open a session over a catalog and a backend handle.
    pub fn new(catalog: Arc<MetadataCatalog>, backend: B) -> Self {
        Self::with_config(catalog, backend, SessionConfig::default())
    }

    /// Open a session with custom configuration.
    pub fn with_config(catalog: Arc<MetadataCatalog>, backend: B, config: SessionConfig) -> Self {
        Self {
            relations: RelationshipSynchronizer::new(catalog.clone()),
            catalog,
            backend,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            removed_keys: HashSet::new(),
            flush_journal: Vec::new(),
            tx: TxState::Idle,
            config,
        }
    }

    /// The shared metadata catalog.
    pub fn catalog(&self) -> &Arc<MetadataCatalog> {
        &self.catalog
    }

    /// The underlying backend handle.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx == TxState::Active
    }

    /// Whether any insert, update, or delete is pending.
    pub fn has_pending_changes(&self) -> bool {
        self.tracker.has_changes()
    }

    /// Build a validated identity for an entity type from raw components.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownEntityType`] or [`Error::InvalidIdentity`].
    pub fn identity(&self, entity_type: &str, components: Vec<Value>) -> Result<Identity> {
        let meta = self.catalog.entity(entity_type)?;
        Identity::new(components, meta.key())
    }

    /// A by-identifier query surface over this session.
    pub fn query(&mut self) -> QueryExecutor<'_, B> {
        QueryExecutor::new(self)
    }

    // ========================================================================
    // Transaction boundary
    // ========================================================================

    /// Open a transaction. Opening while one is active is a no-op.
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.tx == TxState::Active {
            return Ok(());
        }
        self.backend.begin()?;
        self.tx = TxState::Active;
        tracing::debug!("Transaction opened");
        Ok(())
    }

    /// Flush pending changes, then commit the backend transaction.
    ///
    /// A failure at either step triggers an implicit rollback before the
    /// error surfaces.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        if self.tx != TxState::Active {
            return Err(Error::NoActiveTransaction);
        }

        if let Err(err) = self.flush() {
            self.rollback_internal();
            return Err(err);
        }
        if let Err(err) = self.backend.commit() {
            self.rollback_internal();
            return Err(Error::Backend(err));
        }

        self.flush_journal.clear();
        self.tx = TxState::Idle;
        tracing::debug!("Transaction committed");
        Ok(())
    }

    /// Discard pending change records and roll back the backend transaction.
    ///
    /// NEW entities are evicted from the identity map — they never existed
    /// durably. REMOVED entities become visible again. Field values of
    /// managed entities are left as-is: original values are not reloaded,
    /// and a caller wanting pristine state discards the session.
    pub fn rollback(&mut self) -> Result<()> {
        if self.tx != TxState::Active {
            return Err(Error::NoActiveTransaction);
        }
        self.rollback_internal();
        Ok(())
    }

    fn rollback_internal(&mut self) {
        if let Err(err) = self.backend.rollback() {
            tracing::warn!(error = %err, "Backend rollback failed");
        }

        // Undo flush promotions first: the backend transaction discarded
        // the rows, so the corresponding tracking state must revert too.
        let journal = std::mem::take(&mut self.flush_journal);
        for change in journal.into_iter().rev() {
            match change {
                FlushedChange::Inserted {
                    id,
                    written_key_fields,
                } => {
                    if let Some(record) = self.tracker.record(id) {
                        let entity = record.entity().clone();
                        if let Ok(Some(key)) = self.key_of(&entity) {
                            self.identity_map.evict(&key);
                        }
                        let mut guard = entity.write().expect("entity lock poisoned");
                        for field in &written_key_fields {
                            guard.unset(field);
                        }
                    }
                    self.tracker.demote_to_new(id);
                }
                FlushedChange::Updated {
                    id,
                    prior_snapshot,
                    prior_dirty,
                } => {
                    self.tracker.restore_baseline(id, prior_snapshot, prior_dirty);
                }
                FlushedChange::Deleted { entity } => {
                    self.tracker
                        .mark_managed(&entity, self.config.snapshot_on_load);
                    if let Ok(Some(key)) = self.key_of(&entity) {
                        let _ = self.identity_map.register(key, entity.clone());
                    }
                }
            }
        }

        let outcome = self.tracker.rollback();
        for entity in &outcome.dropped_new {
            if let Ok(Some(key)) = self.key_of(entity) {
                self.identity_map.evict(&key);
            }
        }
        for entity in &outcome.restored {
            if let Ok(Some(key)) = self.key_of(entity) {
                let _ = self.identity_map.register(key, entity.clone());
            }
        }
        self.removed_keys.clear();
        self.tx = TxState::Idle;
        tracing::debug!("Transaction rolled back");
    }

    /// Close the session: every tracked entity becomes detached, the
    /// identity map and change tracker are cleared, and an open transaction
    /// is rolled back.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(mut self) {
        if self.tx == TxState::Active {
            self.rollback_internal();
        }
        self.tracker.detach_all();
        self.identity_map.clear();
        self.relations.clear();
        self.removed_keys.clear();
        tracing::debug!("Session closed");
    }

    fn ensure_tx(&mut self) -> Result<()> {
        if self.tx == TxState::Active {
            return Ok(());
        }
        if self.config.auto_begin {
            return self.begin_transaction();
        }
        Err(Error::NoActiveTransaction)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get an entity by identity: identity map first, then the backend.
    ///
    /// Never fails for "not found" — returns `Ok(None)`. An entity removed
    /// in this session reads as absent before commit.
    #[tracing::instrument(level = "trace", skip(self, identity))]
    pub fn get(&mut self, entity_type: &str, identity: &Identity) -> Result<Option<EntityRef>> {
        let meta = self.catalog.entity(entity_type)?.clone();
        if identity.arity() != meta.key().arity() {
            return Err(Error::InvalidIdentity {
                reason: format!(
                    "'{}' keys have {} component(s), got {}",
                    entity_type,
                    meta.key().arity(),
                    identity.arity()
                ),
            });
        }

        let key = EntityKey::new(entity_type, identity.clone());
        if let Some(existing) = self.identity_map.lookup(&key) {
            tracing::trace!(key = %key, "Identity map hit");
            return Ok(Some(existing));
        }
        if self.removed_keys.contains(&key) {
            return Ok(None);
        }

        let Some(row) = self.backend.fetch_by_identity(entity_type, identity)? else {
            return Ok(None);
        };

        let entity = Entity::from_fields(entity_type, row).into_ref();
        self.identity_map.register(key, entity.clone())?;
        self.tracker.mark_managed(&entity, self.config.snapshot_on_load);
        tracing::trace!(entity_type, "Loaded entity from backend");
        Ok(Some(entity))
    }

    /// Get an entity by identity, failing when absent.
    ///
    /// # Errors
    ///
    /// [`Error::EntityNotFound`] when neither the session nor the backend
    /// knows the identity.
    pub fn load(&mut self, entity_type: &str, identity: &Identity) -> Result<EntityRef> {
        self.get(entity_type, identity)?
            .ok_or_else(|| Error::EntityNotFound {
                entity_type: entity_type.to_string(),
                identity: identity.clone(),
            })
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Schedule an entity for insertion, registering its identity when one
    /// is already assigned and cascading through save-flagged associations.
    ///
    /// Entities without an assigned key register in the identity map at
    /// flush, once the backend has assigned one.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateIdentity`] for detached instances or identities
    /// bound to another instance; [`Error::StaleEntity`] for entities
    /// removed in this session; [`Error::NoActiveTransaction`] outside a
    /// transaction.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn save(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_tx()?;

        let (id, entity_type, detached) = {
            let guard = entity.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string(), guard.is_detached())
        };
        let meta = self.catalog.entity(&entity_type)?.clone();

        if detached {
            return Err(Error::DuplicateIdentity {
                entity_type,
                reason: "instance is detached from a closed session".to_string(),
            });
        }
        if self.tracker.state(id) == Some(EntityState::Removed) {
            return Err(Error::StaleEntity {
                entity_type,
                reason: "a removed entity may not be saved again in this session".to_string(),
            });
        }

        let identity = {
            let guard = entity.read().expect("entity lock poisoned");
            meta.identity_of(&guard)?
        };
        if let Some(identity) = identity {
            self.identity_map
                .register(EntityKey::new(entity_type.clone(), identity), entity.clone())?;
        }

        self.tracker.mark_new(entity)?;
        let cascaded = self.relations.cascade_from(&mut self.tracker, entity)?;
        for target in cascaded {
            self.register_provisional(&target)?;
        }

        tracing::debug!(entity = %id, entity_type = %entity_type, "Entity scheduled for insert");
        Ok(())
    }

    /// Save several entities at once.
    pub fn save_all<'a, I>(&mut self, entities: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a EntityRef>,
    {
        for entity in entities {
            self.save(entity)?;
        }
        Ok(())
    }

    /// Write a field value and mark it dirty in one step.
    ///
    /// The field must be declared, the value must satisfy its type and
    /// nullability, and key fields of tracked entities are immutable.
    #[tracing::instrument(level = "trace", skip(self, entity, value))]
    pub fn set_field(
        &mut self,
        entity: &EntityRef,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.ensure_tx()?;
        let value = value.into();

        let (id, entity_type) = {
            let guard = entity.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string())
        };
        let meta = self.catalog.entity(&entity_type)?.clone();
        let Some(field_meta) = meta.field(field) else {
            return Err(Error::UnknownField {
                entity_type,
                field: field.to_string(),
            });
        };

        if meta.is_key_field(field) && self.tracker.state(id).is_some() {
            return Err(Error::InvalidIdentity {
                reason: format!("the identity of a tracked '{entity_type}' entity is immutable"),
            });
        }
        if value.is_null() && !field_meta.is_nullable() {
            return Err(Error::TypeMismatch {
                expected: format!("{:?}", field_meta.field_type()),
                actual: "NULL".to_string(),
                context: format!("field '{field}' of '{entity_type}'"),
            });
        }
        if !value.matches(field_meta.field_type()) {
            return Err(Error::TypeMismatch {
                expected: format!("{:?}", field_meta.field_type()),
                actual: value.type_name().to_string(),
                context: format!("field '{field}' of '{entity_type}'"),
            });
        }

        entity
            .write()
            .expect("entity lock poisoned")
            .set(field, value);
        if self.tracker.state(id) == Some(EntityState::Managed) {
            self.tracker.mark_dirty(id, field)?;
        }
        Ok(())
    }

    /// Add an association from the owning side, synchronizing the inverse
    /// side and cascading to new targets. See
    /// [`RelationshipSynchronizer::add_association`].
    pub fn add_association(
        &mut self,
        owner: &EntityRef,
        relation: &str,
        target: &EntityRef,
    ) -> Result<()> {
        self.ensure_tx()?;
        let cascaded = self
            .relations
            .add_association(&mut self.tracker, owner, relation, target)?;
        for entity in cascaded {
            self.register_provisional(&entity)?;
        }
        Ok(())
    }

    /// Remove an association from the owning side, synchronizing the
    /// inverse side.
    pub fn remove_association(
        &mut self,
        owner: &EntityRef,
        relation: &str,
        target: &EntityRef,
    ) -> Result<()> {
        self.ensure_tx()?;
        self.relations
            .remove_association(&mut self.tracker, owner, relation, target)
    }

    /// The in-memory view of an association, from either side. An untouched
    /// association reads as empty.
    pub fn associations(&self, entity: &EntityRef, relation: &str) -> Result<Vec<EntityRef>> {
        self.relations.associations_of(entity, relation)
    }

    /// Schedule a managed entity for deletion and hide it from lookups.
    ///
    /// # Errors
    ///
    /// [`Error::StaleEntity`] unless the entity is MANAGED.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_tx()?;

        let (id, entity_type) = {
            let guard = entity.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string())
        };

        if self.tracker.state(id) != Some(EntityState::Managed) {
            return Err(Error::StaleEntity {
                entity_type,
                reason: "only a managed entity can be removed".to_string(),
            });
        }

        let meta = self.catalog.entity(&entity_type)?.clone();
        let identity = {
            let guard = entity.read().expect("entity lock poisoned");
            meta.identity_of(&guard)?
        }
        .ok_or_else(|| Error::InvalidIdentity {
            reason: format!("managed '{entity_type}' entity has no identity"),
        })?;

        self.tracker.mark_removed(id)?;
        let key = EntityKey::new(entity_type, identity);
        self.identity_map.evict(&key);
        self.removed_keys.insert(key);
        tracing::debug!(entity = %id, "Entity scheduled for delete");
        Ok(())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Send pending changes to the backend in dependency order.
    ///
    /// The first failing operation aborts the remainder and surfaces as a
    /// [`Error::Flush`] wrapping the cause, with no in-memory promotion: no
    /// NEW entity becomes MANAGED, so the flush may be retried after the
    /// cause is fixed. Only after every operation succeeds are states
    /// promoted, backend-assigned identities written back and registered,
    /// and baselines refreshed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        let plan = FlushPlan::compute(&self.tracker, &self.relations, &self.catalog)?;
        if plan.is_empty() {
            return Ok(());
        }
        self.ensure_tx()?;

        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Executing flush plan"
        );

        let mut assigned: HashMap<EntityId, Identity> = HashMap::new();

        for &id in &plan.inserts {
            let snapshot = self.build_snapshot(id, &assigned).map_err(Error::flush)?;
            match self.backend.execute_insert(&snapshot) {
                Ok(identity) => {
                    assigned.insert(id, identity);
                }
                Err(err) => return Err(Error::flush(err.into())),
            }
        }

        for &id in &plan.updates {
            let snapshot = self.build_snapshot(id, &assigned).map_err(Error::flush)?;
            if let Err(err) = self.backend.execute_update(&snapshot) {
                return Err(Error::flush(err.into()));
            }
        }

        for op in &plan.deletes {
            if let Err(err) = self.backend.execute_delete(&op.entity_type, &op.identity) {
                return Err(Error::flush(err.into()));
            }
        }

        // Every operation succeeded; promote in-memory state, journaling
        // each promotion so a later rollback can undo it.
        for &id in &plan.inserts {
            let Some(record) = self.tracker.record(id) else {
                continue;
            };
            let entity = record.entity().clone();
            let entity_type = record.entity_type().to_string();
            let meta = self.catalog.entity(&entity_type)?.clone();

            let mut written_key_fields = Vec::new();
            if let Some(identity) = assigned.get(&id) {
                {
                    let mut guard = entity.write().expect("entity lock poisoned");
                    for (key_field, component) in
                        meta.key().fields().iter().zip(identity.components())
                    {
                        let missing = guard
                            .get(key_field.name())
                            .is_none_or(Value::is_null);
                        if missing {
                            guard.set(key_field.name().to_string(), component.clone());
                            written_key_fields.push(key_field.name().to_string());
                        }
                    }
                }
                self.identity_map
                    .register(EntityKey::new(entity_type, identity.clone()), entity)?;
            }
            self.tracker
                .promote_after_flush(id, self.config.snapshot_on_load);
            self.flush_journal.push(FlushedChange::Inserted {
                id,
                written_key_fields,
            });
        }

        for &id in &plan.updates {
            let prior = self.tracker.record(id).map(|record| {
                (
                    record.snapshot_bytes().map(<[u8]>::to_vec),
                    record.dirty_fields().clone(),
                )
            });
            self.tracker
                .promote_after_flush(id, self.config.snapshot_on_load);
            if let Some((prior_snapshot, prior_dirty)) = prior {
                self.flush_journal.push(FlushedChange::Updated {
                    id,
                    prior_snapshot,
                    prior_dirty,
                });
            }
        }

        for op in &plan.deletes {
            if let Some(record) = self.tracker.drop_record(op.entity_id) {
                self.flush_journal.push(FlushedChange::Deleted {
                    entity: record.entity().clone(),
                });
            }
            self.relations.remove_entity(op.entity_id);
            self.removed_keys
                .remove(&EntityKey::new(op.entity_type.clone(), op.identity.clone()));
        }

        tracing::debug!("Flush complete");
        Ok(())
    }

    /// Build the persistable snapshot of one tracked entity, resolving
    /// owning references to identities (including identities assigned by
    /// the backend earlier in the same flush).
    fn build_snapshot(
        &self,
        id: EntityId,
        assigned: &HashMap<EntityId, Identity>,
    ) -> Result<EntitySnapshot> {
        let record = self.tracker.record(id).ok_or_else(|| Error::StaleEntity {
            entity_type: String::new(),
            reason: format!("entity {id} vanished from the change tracker"),
        })?;
        let meta = self.catalog.entity(record.entity_type())?.clone();
        let entity = record.entity().clone();

        let mut fields = entity
            .read()
            .expect("entity lock poisoned")
            .fields()
            .clone();

        for rel in meta
            .relationships()
            .iter()
            .filter(|r| r.is_owning() && r.kind().is_to_one() && !r.join_field_names().is_empty())
        {
            let Some(target_id) = self.relations.to_one_target(id, rel.name()) else {
                continue;
            };
            let identity = self.identity_for(target_id, assigned)?.ok_or_else(|| {
                Error::InvalidIdentity {
                    reason: format!(
                        "target of relationship '{}' has no identity at flush",
                        rel.name()
                    ),
                }
            })?;
            for (field, component) in rel.join_field_names().iter().zip(identity.components()) {
                fields.insert(field.clone(), component.clone());
            }
        }

        let mut links = BTreeMap::new();
        for rel in meta
            .relationships()
            .iter()
            .filter(|r| r.is_owning() && r.kind() == RelationKind::ManyToMany)
        {
            let targets = self.relations.targets(id, rel.name());
            if targets.is_empty() {
                continue;
            }
            let mut identities = Vec::with_capacity(targets.len());
            for &target in targets {
                let identity = self.identity_for(target, assigned)?.ok_or_else(|| {
                    Error::InvalidIdentity {
                        reason: format!(
                            "target of relationship '{}' has no identity at flush",
                            rel.name()
                        ),
                    }
                })?;
                identities.push(identity);
            }
            links.insert(rel.name().to_string(), identities);
        }

        let identity = match assigned.get(&id) {
            Some(identity) => Some(identity.clone()),
            None => {
                let guard = entity.read().expect("entity lock poisoned");
                meta.identity_of(&guard)?
            }
        };

        Ok(EntitySnapshot {
            entity_type: record.entity_type().to_string(),
            identity,
            fields,
            links,
        })
    }

    fn identity_for(
        &self,
        id: EntityId,
        assigned: &HashMap<EntityId, Identity>,
    ) -> Result<Option<Identity>> {
        if let Some(identity) = assigned.get(&id) {
            return Ok(Some(identity.clone()));
        }
        let entity = self
            .relations
            .handle(id)
            .cloned()
            .or_else(|| self.tracker.record(id).map(|r| r.entity().clone()));
        let Some(entity) = entity else {
            return Ok(None);
        };
        let guard = entity.read().expect("entity lock poisoned");
        let meta = self.catalog.entity(guard.entity_type())?.clone();
        meta.identity_of(&guard)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether this instance is tracked by the session.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.tracker.state(entity_id(entity)).is_some()
    }

    /// The lifecycle state of an instance, `Detached` for instances released
    /// by a closed session, `None` for instances this session never saw.
    pub fn entity_state(&self, entity: &EntityRef) -> Option<EntityState> {
        if let Some(state) = self.tracker.state(entity_id(entity)) {
            return Some(state);
        }
        if entity.read().expect("entity lock poisoned").is_detached() {
            return Some(EntityState::Detached);
        }
        None
    }

    /// Whether an instance has pending changes (insert, update, or delete).
    pub fn is_modified(&self, entity: &EntityRef) -> bool {
        let id = entity_id(entity);
        match self.tracker.state(id) {
            Some(EntityState::New | EntityState::Removed) => true,
            Some(EntityState::Managed) => self.tracker.is_update_pending(id),
            _ => false,
        }
    }

    /// The names of fields changed since an entity's baseline.
    pub fn changed_fields(&self, entity: &EntityRef) -> Vec<String> {
        self.tracker.changed_fields(entity_id(entity))
    }

    fn key_of(&self, entity: &EntityRef) -> Result<Option<EntityKey>> {
        let guard = entity.read().expect("entity lock poisoned");
        let meta = self.catalog.entity(guard.entity_type())?.clone();
        Ok(meta
            .identity_of(&guard)?
            .map(|identity| EntityKey::new(guard.entity_type(), identity)))
    }

    fn register_provisional(&mut self, entity: &EntityRef) -> Result<()> {
        if let Some(key) = self.key_of(entity)? {
            self.identity_map.register(key, entity.clone())?;
        }
        Ok(())
    }
}
