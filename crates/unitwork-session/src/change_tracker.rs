//! Change tracking and dirty detection.
//!
//! The tracker records the lifecycle state of every entity the session
//! touches, plus a snapshot-based dirty check: a JSON baseline of the field
//! map is captured when an entity becomes managed, and an entity is
//! update-pending when a field was explicitly marked dirty or its current
//! state differs from the baseline.
//!
//! Lifecycle states and transitions, per entity, per session:
//!
//! - NEW → MANAGED on successful flush (an insert was issued)
//! - MANAGED gains a dirty flag when fields change after registration
//! - MANAGED → REMOVED on `remove`; a removed entity may not be saved again
//! - any → DETACHED when the session closes

use std::collections::{BTreeMap, BTreeSet};
use unitwork_core::{EntityId, EntityRef, Error, FieldMap, Result, entity_id};

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Pending INSERT.
    New,
    /// Loaded from or flushed to the backend; the session's copy is
    /// authoritative until commit.
    Managed,
    /// Pending DELETE; already evicted from the identity map.
    Removed,
    /// Released by a closed session; no longer tracked.
    Detached,
}

/// One tracked entity: handle, state, dirty-field set, baseline snapshot.
pub struct ChangeRecord {
    entity: EntityRef,
    entity_type: String,
    state: EntityState,
    dirty: BTreeSet<String>,
    snapshot: Option<Vec<u8>>,
}

impl ChangeRecord {
    /// The tracked entity handle.
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// The entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Fields explicitly marked dirty since the last snapshot.
    pub fn dirty_fields(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Whether a baseline snapshot was captured.
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// The raw baseline snapshot, if captured.
    pub fn snapshot_bytes(&self) -> Option<&[u8]> {
        self.snapshot.as_deref()
    }

    fn current_fields(&self) -> FieldMap {
        self.entity
            .read()
            .expect("entity lock poisoned")
            .fields()
            .clone()
    }
}

/// What a rollback did to the tracked set, so the session can repair the
/// identity map.
pub struct RollbackOutcome {
    /// NEW entities whose records were dropped; they never existed durably.
    pub dropped_new: Vec<EntityRef>,
    /// REMOVED entities restored to MANAGED; they must become visible again.
    pub restored: Vec<EntityRef>,
}

/// Per-session record of entity lifecycle states and pending changes.
#[derive(Default)]
pub struct ChangeTracker {
    // BTreeMap keyed by creation-ordered ids keeps iteration deterministic.
    records: BTreeMap<EntityId, ChangeRecord>,
}

impl ChangeTracker {
    /// Create a new empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an entity as NEW (pending insert).
    ///
    /// Tracking an already NEW or MANAGED entity is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::StaleEntity`] when the entity was removed in this session; a
    /// removed entity may not be saved again.
    pub fn mark_new(&mut self, entity: &EntityRef) -> Result<()> {
        let id = entity_id(entity);

        if let Some(record) = self.records.get(&id) {
            return match record.state {
                EntityState::Removed => Err(Error::StaleEntity {
                    entity_type: record.entity_type.clone(),
                    reason: "a removed entity may not be saved again in this session".to_string(),
                }),
                _ => Ok(()),
            };
        }

        let entity_type = entity
            .read()
            .expect("entity lock poisoned")
            .entity_type()
            .to_string();
        tracing::trace!(entity = %id, entity_type = %entity_type, "Tracking entity as NEW");

        self.records.insert(
            id,
            ChangeRecord {
                entity: entity.clone(),
                entity_type,
                state: EntityState::New,
                dirty: BTreeSet::new(),
                snapshot: None,
            },
        );
        Ok(())
    }

    /// Track an entity as MANAGED (loaded from the backend), optionally
    /// capturing a baseline snapshot for automatic dirty detection.
    pub fn mark_managed(&mut self, entity: &EntityRef, take_snapshot: bool) {
        let id = entity_id(entity);
        let guard = entity.read().expect("entity lock poisoned");
        let entity_type = guard.entity_type().to_string();
        let snapshot = if take_snapshot {
            Some(serde_json::to_vec(guard.fields()).unwrap_or_default())
        } else {
            None
        };
        drop(guard);

        tracing::trace!(entity = %id, entity_type = %entity_type, "Tracking entity as MANAGED");

        self.records.insert(
            id,
            ChangeRecord {
                entity: entity.clone(),
                entity_type,
                state: EntityState::Managed,
                dirty: BTreeSet::new(),
                snapshot,
            },
        );
    }

    /// Record an explicit field change on a managed entity.
    ///
    /// Marking a NEW entity is a no-op (the whole entity is inserted).
    ///
    /// # Errors
    ///
    /// [`Error::StaleEntity`] for untracked or removed entities.
    pub fn mark_dirty(&mut self, id: EntityId, field: impl Into<String>) -> Result<()> {
        let Some(record) = self.records.get_mut(&id) else {
            return Err(Error::StaleEntity {
                entity_type: String::new(),
                reason: format!("entity {id} is not tracked by this session"),
            });
        };

        match record.state {
            EntityState::New => Ok(()),
            EntityState::Managed => {
                record.dirty.insert(field.into());
                Ok(())
            }
            EntityState::Removed | EntityState::Detached => Err(Error::StaleEntity {
                entity_type: record.entity_type.clone(),
                reason: "cannot modify a removed entity".to_string(),
            }),
        }
    }

    /// Transition a managed entity to REMOVED (pending delete).
    ///
    /// # Errors
    ///
    /// [`Error::StaleEntity`] unless the entity is currently MANAGED.
    pub fn mark_removed(&mut self, id: EntityId) -> Result<()> {
        let Some(record) = self.records.get_mut(&id) else {
            return Err(Error::StaleEntity {
                entity_type: String::new(),
                reason: format!("entity {id} is not tracked by this session"),
            });
        };

        if record.state != EntityState::Managed {
            return Err(Error::StaleEntity {
                entity_type: record.entity_type.clone(),
                reason: "only a managed entity can be removed".to_string(),
            });
        }

        record.state = EntityState::Removed;
        record.dirty.clear();
        tracing::trace!(entity = %id, "Entity marked REMOVED");
        Ok(())
    }

    /// The state of a tracked entity, if any.
    pub fn state(&self, id: EntityId) -> Option<EntityState> {
        self.records.get(&id).map(|r| r.state)
    }

    /// The full record of a tracked entity.
    pub fn record(&self, id: EntityId) -> Option<&ChangeRecord> {
        self.records.get(&id)
    }

    /// Iterate over all records in creation order.
    pub fn records(&self) -> impl Iterator<Item = (EntityId, &ChangeRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Refresh the baseline snapshot of an entity to its current state.
    pub fn refresh_snapshot(&mut self, id: EntityId) {
        if let Some(record) = self.records.get_mut(&id) {
            let fields = record.current_fields();
            record.snapshot = Some(serde_json::to_vec(&fields).unwrap_or_default());
        }
    }

    /// Whether an entity has pending update work: explicitly dirty fields,
    /// or a current state differing from its baseline snapshot. Entities
    /// tracked without a snapshot rely on explicit marks alone.
    pub fn is_update_pending(&self, id: EntityId) -> bool {
        let Some(record) = self.records.get(&id) else {
            return false;
        };
        if record.state != EntityState::Managed {
            return false;
        }
        if !record.dirty.is_empty() {
            return true;
        }
        let Some(snapshot) = &record.snapshot else {
            return false;
        };
        let current = serde_json::to_vec(&record.current_fields()).unwrap_or_default();
        current != *snapshot
    }

    /// Field names whose values differ from the baseline snapshot, plus any
    /// explicitly marked fields. With no snapshot, only explicit marks are
    /// reported.
    pub fn changed_fields(&self, id: EntityId) -> Vec<String> {
        let Some(record) = self.records.get(&id) else {
            return Vec::new();
        };

        let mut changed: BTreeSet<String> = record.dirty.clone();

        if let Some(snapshot) = &record.snapshot {
            let original: serde_json::Value =
                serde_json::from_slice(snapshot).unwrap_or(serde_json::Value::Null);
            let current = record.current_fields();
            let current_json =
                serde_json::to_value(&current).unwrap_or(serde_json::Value::Null);

            for name in current.keys() {
                if original.get(name) != current_json.get(name) {
                    changed.insert(name.clone());
                }
            }
            // Fields present in the baseline but unset since then.
            if let serde_json::Value::Object(orig_map) = &original {
                for name in orig_map.keys() {
                    if !current.contains_key(name) {
                        changed.insert(name.clone());
                    }
                }
            }
        }

        changed.into_iter().collect()
    }

    /// Promote an entity after its flush operation succeeded: NEW becomes
    /// MANAGED, the dirty set clears, and the baseline refreshes when
    /// snapshots are in use.
    pub fn promote_after_flush(&mut self, id: EntityId, take_snapshot: bool) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = EntityState::Managed;
            record.dirty.clear();
            if take_snapshot {
                let fields = record.current_fields();
                record.snapshot = Some(serde_json::to_vec(&fields).unwrap_or_default());
            }
        }
    }

    /// Drop a record entirely (after a flushed delete).
    pub fn drop_record(&mut self, id: EntityId) -> Option<ChangeRecord> {
        self.records.remove(&id)
    }

    /// Revert a promoted insert: the entity becomes NEW again with no
    /// baseline. Used when the surrounding transaction rolls back after a
    /// flush already ran.
    pub fn demote_to_new(&mut self, id: EntityId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = EntityState::New;
            record.dirty.clear();
            record.snapshot = None;
        }
    }

    /// Restore a pre-flush baseline and dirty set on a managed entity, so a
    /// rolled-back update is detected as pending again.
    pub fn restore_baseline(
        &mut self,
        id: EntityId,
        snapshot: Option<Vec<u8>>,
        dirty: BTreeSet<String>,
    ) {
        if let Some(record) = self.records.get_mut(&id) {
            record.snapshot = snapshot;
            record.dirty = dirty;
        }
    }

    /// Discard pending work: NEW records are dropped, REMOVED records revert
    /// to MANAGED, dirty flags clear. Managed entities keep their current
    /// in-memory field values; original values are not reloaded.
    pub fn rollback(&mut self) -> RollbackOutcome {
        let mut outcome = RollbackOutcome {
            dropped_new: Vec::new(),
            restored: Vec::new(),
        };

        self.records.retain(|_, record| match record.state {
            EntityState::New => {
                outcome.dropped_new.push(record.entity.clone());
                false
            }
            EntityState::Removed => {
                record.state = EntityState::Managed;
                record.dirty.clear();
                outcome.restored.push(record.entity.clone());
                true
            }
            _ => {
                record.dirty.clear();
                true
            }
        });

        tracing::debug!(
            dropped_new = outcome.dropped_new.len(),
            restored = outcome.restored.len(),
            "Change tracker rolled back"
        );
        outcome
    }

    /// Detach every tracked entity (marking the instances) and clear the
    /// tracker. Called when the session closes.
    pub fn detach_all(&mut self) {
        for record in self.records.values() {
            record
                .entity
                .write()
                .expect("entity lock poisoned")
                .mark_detached();
        }
        self.records.clear();
    }

    /// Whether any insert, update, or delete is pending.
    pub fn has_changes(&self) -> bool {
        self.records.iter().any(|(id, r)| {
            matches!(r.state, EntityState::New | EntityState::Removed)
                || self.is_update_pending(*id)
        })
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
