//! Relationship synchronization and cascade-on-save.
//!
//! Every association edit goes through a single entry point here. The
//! synchronizer applies the forward edge and, for bidirectional
//! relationships, the inverse edge in one atomic step — callers never mutate
//! the two collections independently, so touching both endpoints of an
//! association and saving them cannot produce a duplicate join row.
//!
//! The association graph is owned by the session, keyed by instance handle.
//! Entities themselves never reference each other, which keeps ownership
//! acyclic; owning to-one references are materialized into join fields and
//! owning many-to-many state into identity lists at flush time.

use crate::change_tracker::{ChangeTracker, EntityState};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    EntityId, EntityRef, Error, MetadataCatalog, RelationshipMeta, Result, entity_id,
};

/// Enforces bidirectional consistency and cascade-on-save for associations.
pub struct RelationshipSynchronizer {
    catalog: Arc<MetadataCatalog>,
    /// Handles for every entity that appears in an association.
    handles: BTreeMap<EntityId, EntityRef>,
    /// Adjacency: entity -> relationship name -> targets in insertion order.
    edges: BTreeMap<EntityId, BTreeMap<String, Vec<EntityId>>>,
}

impl RelationshipSynchronizer {
    /// Create a synchronizer over a catalog.
    pub fn new(catalog: Arc<MetadataCatalog>) -> Self {
        Self {
            catalog,
            handles: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Add an association from the owning side.
    ///
    /// Steps, in order:
    /// 1. the relationship must be declared on the owner's type,
    /// 2. the caller must be on the owning side,
    /// 3. the target is added to the owner's reference/collection
    ///    (idempotently; a to-one reference is replaced),
    /// 4. for bidirectional relationships the inverse entry is applied in
    ///    the same step, exactly once,
    /// 5. with cascade-on-save, an untracked target is marked NEW so it is
    ///    inserted in the same flush.
    ///
    /// Returns the entities newly marked NEW by cascade, so the caller can
    /// register their identities.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownRelationship`], [`Error::NotOwningSide`],
    /// [`Error::TypeMismatch`] for a target of the wrong entity type, and
    /// [`Error::StaleEntity`] when cascade reaches a removed entity.
    #[tracing::instrument(level = "debug", skip(self, tracker, owner, target))]
    pub fn add_association(
        &mut self,
        tracker: &mut ChangeTracker,
        owner: &EntityRef,
        relation: &str,
        target: &EntityRef,
    ) -> Result<Vec<EntityRef>> {
        let (owner_id, rel) = self.owning_relationship(owner, relation)?;
        let (target_id, target_type) = {
            let guard = target.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string())
        };

        if target_type != rel.target() {
            return Err(Error::TypeMismatch {
                expected: rel.target().to_string(),
                actual: target_type,
                context: format!("relationship '{relation}'"),
            });
        }

        // A to-one reference is replaced, and the displaced target's inverse
        // entry is withdrawn so both views stay consistent.
        if rel.kind().is_to_one() {
            let previous = self.targets(owner_id, relation).to_vec();
            for old in previous {
                if old != target_id {
                    self.remove_edge(owner_id, relation, old);
                    if let Some(inverse) = rel.inverse_name() {
                        self.remove_edge(old, inverse, owner_id);
                    }
                }
            }
        }

        let added = self.push_unique(owner_id, relation, target_id);
        if let Some(inverse) = rel.inverse_name() {
            self.push_unique(target_id, inverse, owner_id);
        }

        self.handles.insert(owner_id, owner.clone());
        self.handles.insert(target_id, target.clone());

        // An owning-side relationship change makes a managed owner dirty, so
        // the new association state is written at the next flush.
        if added && tracker.state(owner_id) == Some(EntityState::Managed) {
            tracker.mark_dirty(owner_id, relation)?;
        }

        let mut cascaded = Vec::new();
        if rel.cascades_on_save() && tracker.state(target_id).is_none() {
            if target.read().expect("entity lock poisoned").is_detached() {
                return Err(Error::DuplicateIdentity {
                    entity_type: rel.target().to_string(),
                    reason: "cascade reached a detached instance".to_string(),
                });
            }
            tracker.mark_new(target)?;
            cascaded.push(target.clone());
        }

        tracing::debug!(
            owner = %owner_id,
            target = %target_id,
            added,
            cascaded = !cascaded.is_empty(),
            "Association added"
        );
        Ok(cascaded)
    }

    /// Remove an association from the owning side.
    ///
    /// Withdraws the forward entry and, for bidirectional relationships, the
    /// inverse entry in the same step. Removing an absent pair is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownRelationship`] and [`Error::NotOwningSide`] as for
    /// [`add_association`](Self::add_association).
    pub fn remove_association(
        &mut self,
        tracker: &mut ChangeTracker,
        owner: &EntityRef,
        relation: &str,
        target: &EntityRef,
    ) -> Result<()> {
        let (owner_id, rel) = self.owning_relationship(owner, relation)?;
        let target_id = entity_id(target);

        let removed = self.remove_edge(owner_id, relation, target_id);
        if let Some(inverse) = rel.inverse_name() {
            self.remove_edge(target_id, inverse, owner_id);
        }

        if removed && tracker.state(owner_id) == Some(EntityState::Managed) {
            tracker.mark_dirty(owner_id, relation)?;
        }

        tracing::debug!(owner = %owner_id, target = %target_id, removed, "Association removed");
        Ok(())
    }

    /// The in-memory view of an association, from either side.
    ///
    /// An association that was never touched reads as empty.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownRelationship`] when the entity's type does not
    /// declare the relationship.
    pub fn associations_of(&self, entity: &EntityRef, relation: &str) -> Result<Vec<EntityRef>> {
        let (id, entity_type) = {
            let guard = entity.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string())
        };
        let meta = self.catalog.entity(&entity_type)?.clone();
        if meta.find_relationship(relation).is_none() {
            return Err(Error::UnknownRelationship {
                entity_type,
                relation: relation.to_string(),
            });
        }

        Ok(self
            .targets(id, relation)
            .iter()
            .filter_map(|t| self.handles.get(t).cloned())
            .collect())
    }

    /// Raw target ids for an association (empty when never touched).
    pub fn targets(&self, id: EntityId, relation: &str) -> &[EntityId] {
        self.edges
            .get(&id)
            .and_then(|rels| rels.get(relation))
            .map_or(&[], Vec::as_slice)
    }

    /// The single target of a to-one association, if set.
    pub fn to_one_target(&self, id: EntityId, relation: &str) -> Option<EntityId> {
        self.targets(id, relation).first().copied()
    }

    /// The handle of an entity known to the association graph.
    pub fn handle(&self, id: EntityId) -> Option<&EntityRef> {
        self.handles.get(&id)
    }

    /// Walk cascade-flagged owning associations from a saved root, marking
    /// every reachable untracked entity NEW. Returns the newly marked
    /// entities.
    ///
    /// # Errors
    ///
    /// [`Error::StaleEntity`] when the cascade reaches a removed entity.
    pub fn cascade_from(
        &mut self,
        tracker: &mut ChangeTracker,
        root: &EntityRef,
    ) -> Result<Vec<EntityRef>> {
        let root_id = entity_id(root);
        self.handles.entry(root_id).or_insert_with(|| root.clone());

        let mut newly_tracked = Vec::new();
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut stack = vec![root_id];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(entity) = self.handles.get(&id).cloned() else {
                continue;
            };
            let entity_type = entity
                .read()
                .expect("entity lock poisoned")
                .entity_type()
                .to_string();
            let meta = self.catalog.entity(&entity_type)?.clone();

            for rel in meta
                .relationships()
                .iter()
                .filter(|r| r.is_owning() && r.cascades_on_save())
            {
                for target_id in self.targets(id, rel.name()).to_vec() {
                    let Some(target) = self.handles.get(&target_id).cloned() else {
                        continue;
                    };
                    if tracker.state(target_id).is_none() {
                        if target.read().expect("entity lock poisoned").is_detached() {
                            return Err(Error::DuplicateIdentity {
                                entity_type: rel.target().to_string(),
                                reason: "cascade reached a detached instance".to_string(),
                            });
                        }
                        tracker.mark_new(&target)?;
                        newly_tracked.push(target);
                    } else if tracker.state(target_id) == Some(EntityState::Removed) {
                        return Err(Error::StaleEntity {
                            entity_type: rel.target().to_string(),
                            reason: "cascade reached an entity removed in this session"
                                .to_string(),
                        });
                    }
                    stack.push(target_id);
                }
            }
        }

        if !newly_tracked.is_empty() {
            tracing::debug!(
                root = %root_id,
                cascaded = newly_tracked.len(),
                "Cascade-on-save tracked new entities"
            );
        }
        Ok(newly_tracked)
    }

    /// Drop an entity from the graph: its handle, its outgoing edges, and
    /// every edge pointing at it. Used after a flushed delete.
    pub fn remove_entity(&mut self, id: EntityId) {
        self.handles.remove(&id);
        self.edges.remove(&id);
        for rels in self.edges.values_mut() {
            for list in rels.values_mut() {
                list.retain(|t| *t != id);
            }
        }
    }

    /// Clear the whole graph. Called when the session closes.
    pub fn clear(&mut self) {
        self.handles.clear();
        self.edges.clear();
    }

    fn owning_relationship(
        &self,
        owner: &EntityRef,
        relation: &str,
    ) -> Result<(EntityId, RelationshipMeta)> {
        let (owner_id, owner_type) = {
            let guard = owner.read().expect("entity lock poisoned");
            (guard.id(), guard.entity_type().to_string())
        };
        let meta = self.catalog.entity(&owner_type)?.clone();
        let Some(rel) = meta.find_relationship(relation) else {
            return Err(Error::UnknownRelationship {
                entity_type: owner_type,
                relation: relation.to_string(),
            });
        };
        if !rel.is_owning() {
            return Err(Error::NotOwningSide {
                entity_type: owner_type,
                relation: relation.to_string(),
            });
        }
        Ok((owner_id, rel.clone()))
    }

    fn push_unique(&mut self, from: EntityId, relation: &str, to: EntityId) -> bool {
        let list = self
            .edges
            .entry(from)
            .or_default()
            .entry(relation.to_string())
            .or_default();
        if list.contains(&to) {
            return false;
        }
        list.push(to);
        true
    }

    fn remove_edge(&mut self, from: EntityId, relation: &str, to: EntityId) -> bool {
        let Some(list) = self.edges.get_mut(&from).and_then(|rels| rels.get_mut(relation)) else {
            return false;
        };
        let before = list.len();
        list.retain(|t| *t != to);
        before != list.len()
    }
}
