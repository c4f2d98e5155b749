//! Flush planning: dependency-ordered inserts, updates, and deletes.
//!
//! The plan is computed from the change tracker and the association graph:
//!
//! - **Inserts** for NEW entities, ordered so a required reference target is
//!   inserted before the entity referencing it (a topological order over
//!   owning references between NEW entities).
//! - **Updates** for dirty MANAGED entities, order-independent.
//! - **Deletes** for REMOVED entities in reverse dependency order, so
//!   dependents go before their targets and referential constraints on the
//!   backend hold.
//!
//! Non-required references participate in the ordering as soft constraints:
//! they are honored when possible and dropped when they alone would make the
//! order unsatisfiable. A cycle of strictly required references has no valid
//! order and is an error.

use crate::change_tracker::{ChangeTracker, EntityState};
use crate::relations::RelationshipSynchronizer;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use unitwork_core::{EntityId, Error, Identity, MetadataCatalog, RelationKind, Result};

/// A pending delete, with the identity captured at planning time.
#[derive(Debug, Clone)]
pub struct DeleteOp {
    /// The tracked instance.
    pub entity_id: EntityId,
    /// The declared entity type name.
    pub entity_type: String,
    /// The row identity to delete.
    pub identity: Identity,
}

/// An ordered set of operations to apply to the storage backend.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Entities to insert, dependency targets first.
    pub inserts: Vec<EntityId>,
    /// Entities to update, in no particular order.
    pub updates: Vec<EntityId>,
    /// Rows to delete, dependents first.
    pub deletes: Vec<DeleteOp>,
}

impl FlushPlan {
    /// Check whether the plan has no operations.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of operations.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Compute the plan for the session's current pending changes.
    ///
    /// # Errors
    ///
    /// [`Error::CyclicDependency`] when required references between new (or
    /// removed) entities form a cycle, and catalog or identity errors for
    /// inconsistent records.
    pub fn compute(
        tracker: &ChangeTracker,
        relations: &RelationshipSynchronizer,
        catalog: &MetadataCatalog,
    ) -> Result<FlushPlan> {
        let mut new_ids: BTreeSet<EntityId> = BTreeSet::new();
        let mut removed_ids: BTreeSet<EntityId> = BTreeSet::new();
        let mut updates: Vec<EntityId> = Vec::new();

        for (id, record) in tracker.records() {
            match record.state() {
                EntityState::New => {
                    new_ids.insert(id);
                }
                EntityState::Removed => {
                    removed_ids.insert(id);
                }
                EntityState::Managed => {
                    if tracker.is_update_pending(id) {
                        updates.push(id);
                    }
                }
                EntityState::Detached => {}
            }
        }

        let inserts = ordered(&new_ids, tracker, relations, catalog)?;

        let mut delete_order = ordered(&removed_ids, tracker, relations, catalog)?;
        delete_order.reverse();
        let mut deletes = Vec::with_capacity(delete_order.len());
        for id in delete_order {
            let record = tracker.record(id).expect("planned id is tracked");
            let meta = catalog.entity(record.entity_type())?.clone();
            let guard = record.entity().read().expect("entity lock poisoned");
            let identity = meta.identity_of(&guard)?.ok_or_else(|| Error::InvalidIdentity {
                reason: format!(
                    "removed '{}' entity has no identity to delete by",
                    record.entity_type()
                ),
            })?;
            deletes.push(DeleteOp {
                entity_id: id,
                entity_type: record.entity_type().to_string(),
                identity,
            });
        }

        let plan = FlushPlan {
            inserts,
            updates,
            deletes,
        };
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            "Flush plan computed"
        );
        Ok(plan)
    }
}

/// Precedence edge: `target` must be flushed before `referrer`.
type Edge = (EntityId, EntityId);

/// Collect reference edges between entities of one pending set.
///
/// Hard edges come from required owning to-one references; soft edges from
/// optional to-one references and many-to-many links.
fn reference_edges(
    ids: &BTreeSet<EntityId>,
    tracker: &ChangeTracker,
    relations: &RelationshipSynchronizer,
    catalog: &MetadataCatalog,
) -> Result<(Vec<Edge>, Vec<Edge>)> {
    let mut hard = Vec::new();
    let mut soft = Vec::new();

    for &id in ids {
        let record = tracker.record(id).expect("planned id is tracked");
        let meta = catalog.entity(record.entity_type())?.clone();

        for rel in meta.relationships().iter().filter(|r| r.is_owning()) {
            match rel.kind() {
                RelationKind::OneToOne | RelationKind::ManyToOne => {
                    for &target in relations.targets(id, rel.name()) {
                        if ids.contains(&target) && target != id {
                            if rel.is_required() {
                                hard.push((target, id));
                            } else {
                                soft.push((target, id));
                            }
                        }
                    }
                }
                RelationKind::ManyToMany => {
                    for &target in relations.targets(id, rel.name()) {
                        if ids.contains(&target) && target != id {
                            soft.push((target, id));
                        }
                    }
                }
                RelationKind::OneToMany => {}
            }
        }
    }

    Ok((hard, soft))
}

/// Order a pending set by its reference edges, dropping soft constraints
/// when they alone prevent an order, and failing on required-reference
/// cycles.
fn ordered(
    ids: &BTreeSet<EntityId>,
    tracker: &ChangeTracker,
    relations: &RelationshipSynchronizer,
    catalog: &MetadataCatalog,
) -> Result<Vec<EntityId>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let (hard, soft) = reference_edges(ids, tracker, relations, catalog)?;

    let mut all = hard.clone();
    all.extend_from_slice(&soft);
    if let Ok(order) = topo_sort(ids, &all) {
        return Ok(order);
    }

    tracing::debug!("Soft reference constraints form a cycle; retrying with required edges only");
    match topo_sort(ids, &hard) {
        Ok(order) => Ok(order),
        Err(remainder) => {
            let path = cycle_path(&remainder, &hard);
            let members = path
                .iter()
                .filter_map(|id| tracker.record(*id))
                .map(|r| r.entity_type().to_string())
                .collect();
            Err(Error::CyclicDependency { members })
        }
    }
}

/// Kahn's algorithm with a deterministic ready queue.
///
/// Returns `Err` with the nodes left inside cycles.
fn topo_sort(
    nodes: &BTreeSet<EntityId>,
    edges: &[Edge],
) -> std::result::Result<Vec<EntityId>, BTreeSet<EntityId>> {
    let mut indegree: BTreeMap<EntityId, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut outgoing: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
    let mut seen: HashSet<Edge> = HashSet::new();

    for &(from, to) in edges {
        if nodes.contains(&from) && nodes.contains(&to) && seen.insert((from, to)) {
            outgoing.entry(from).or_default().push(to);
            *indegree.get_mut(&to).expect("node present") += 1;
        }
    }

    let mut ready: BTreeSet<EntityId> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        if let Some(successors) = outgoing.get(&next) {
            for succ in successors {
                let d = indegree.get_mut(succ).expect("node present");
                *d -= 1;
                if *d == 0 {
                    ready.insert(*succ);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        Err(nodes.iter().copied().filter(|n| !order.contains(n)).collect())
    }
}

/// Extract one concrete cycle path from a set of nodes known to contain one.
fn cycle_path(nodes: &BTreeSet<EntityId>, edges: &[Edge]) -> Vec<EntityId> {
    let mut outgoing: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
    for &(from, to) in edges {
        if nodes.contains(&from) && nodes.contains(&to) {
            outgoing.entry(from).or_default().push(to);
        }
    }

    let mut visited: HashSet<EntityId> = HashSet::new();
    let mut stack: HashSet<EntityId> = HashSet::new();
    let mut path: Vec<EntityId> = Vec::new();

    fn dfs(
        node: EntityId,
        outgoing: &BTreeMap<EntityId, Vec<EntityId>>,
        visited: &mut HashSet<EntityId>,
        stack: &mut HashSet<EntityId>,
        path: &mut Vec<EntityId>,
    ) -> bool {
        visited.insert(node);
        stack.insert(node);
        path.push(node);

        if let Some(successors) = outgoing.get(&node) {
            for &succ in successors {
                if !visited.contains(&succ) {
                    if dfs(succ, outgoing, visited, stack, path) {
                        return true;
                    }
                } else if stack.contains(&succ) {
                    path.push(succ);
                    return true;
                }
            }
        }

        stack.remove(&node);
        path.pop();
        false
    }

    for &node in nodes {
        if !visited.contains(&node)
            && dfs(node, &outgoing, &mut visited, &mut stack, &mut path)
        {
            return path;
        }
    }
    nodes.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unitwork_core::{
        Entity, EntityMeta, EntityRef, FieldMeta, FieldType, KeyShape, MetadataCatalog,
        RelationshipMeta, entity_id,
    };

    fn catalog() -> Arc<MetadataCatalog> {
        let department = EntityMeta::new(
            "department",
            KeyShape::single("id", FieldType::Int),
            vec![
                FieldMeta::new("id", FieldType::Int),
                FieldMeta::new("name", FieldType::Text).nullable(true),
            ],
        );

        let employee = EntityMeta::new(
            "employee",
            KeyShape::single("nss", FieldType::Text),
            vec![
                FieldMeta::new("nss", FieldType::Text),
                FieldMeta::new("department_id", FieldType::Int).nullable(true),
                FieldMeta::new("mentor_nss", FieldType::Text).nullable(true),
            ],
        )
        .relationship(
            RelationshipMeta::new("department", "department", RelationKind::ManyToOne)
                .join_field("department_id")
                .required(true),
        )
        .relationship(
            RelationshipMeta::new("mentor", "employee", RelationKind::ManyToOne)
                .join_field("mentor_nss"),
        );

        Arc::new(
            MetadataCatalog::builder()
                .entity(department)
                .entity(employee)
                .build()
                .unwrap(),
        )
    }

    fn department(id: i64) -> EntityRef {
        Entity::new("department").field("id", id).into_ref()
    }

    fn employee(nss: &str) -> EntityRef {
        Entity::new("employee").field("nss", nss).into_ref()
    }

    #[test]
    fn test_required_target_inserted_first() {
        let cat = catalog();
        let mut tracker = ChangeTracker::new();
        let mut sync = RelationshipSynchronizer::new(cat.clone());

        // Save the employee before the department it requires.
        let e = employee("12345678A");
        let d = department(1);
        tracker.mark_new(&e).unwrap();
        tracker.mark_new(&d).unwrap();
        sync.add_association(&mut tracker, &e, "department", &d).unwrap();

        let plan = FlushPlan::compute(&tracker, &sync, &cat).unwrap();

        assert_eq!(plan.inserts, vec![entity_id(&d), entity_id(&e)]);
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let cat = catalog();
        let mut tracker = ChangeTracker::new();
        let mut sync = RelationshipSynchronizer::new(cat.clone());

        let e = employee("12345678A");
        let d = department(1);
        tracker.mark_managed(&d, true);
        tracker.mark_managed(&e, true);
        sync.add_association(&mut tracker, &e, "department", &d).unwrap();

        tracker.mark_removed(entity_id(&d)).unwrap();
        tracker.mark_removed(entity_id(&e)).unwrap();

        let plan = FlushPlan::compute(&tracker, &sync, &cat).unwrap();

        assert_eq!(plan.deletes.len(), 2);
        // The employee references the department, so it is deleted first.
        assert_eq!(plan.deletes[0].entity_id, entity_id(&e));
        assert_eq!(plan.deletes[1].entity_id, entity_id(&d));
        assert_eq!(plan.deletes[1].entity_type, "department");
    }

    #[test]
    fn test_required_self_cycle_is_rejected() {
        let mut tracker = ChangeTracker::new();

        // Required references both ways between two new employees cannot be
        // ordered.
        let cat2 = Arc::new(
            MetadataCatalog::builder()
                .entity(
                    EntityMeta::new(
                        "employee",
                        KeyShape::single("nss", FieldType::Text),
                        vec![
                            FieldMeta::new("nss", FieldType::Text),
                            FieldMeta::new("mentor_nss", FieldType::Text),
                        ],
                    )
                    .relationship(
                        RelationshipMeta::new("mentor", "employee", RelationKind::ManyToOne)
                            .join_field("mentor_nss")
                            .required(true),
                    ),
                )
                .build()
                .unwrap(),
        );
        let mut sync2 = RelationshipSynchronizer::new(cat2.clone());

        let a = employee("11111111A");
        let b = employee("22222222B");
        tracker.mark_new(&a).unwrap();
        tracker.mark_new(&b).unwrap();
        sync2.add_association(&mut tracker, &a, "mentor", &b).unwrap();
        sync2.add_association(&mut tracker, &b, "mentor", &a).unwrap();

        let err = FlushPlan::compute(&tracker, &sync2, &cat2).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert!(err.to_string().contains("employee"));
    }

    #[test]
    fn test_optional_cycle_falls_back_to_some_order() {
        let cat = catalog();
        let mut tracker = ChangeTracker::new();
        let mut sync = RelationshipSynchronizer::new(cat.clone());

        // "mentor" is optional; a mutual pair still gets an insert order.
        let a = employee("11111111A");
        let b = employee("22222222B");
        tracker.mark_new(&a).unwrap();
        tracker.mark_new(&b).unwrap();
        sync.add_association(&mut tracker, &a, "mentor", &b).unwrap();
        sync.add_association(&mut tracker, &b, "mentor", &a).unwrap();

        let plan = FlushPlan::compute(&tracker, &sync, &cat).unwrap();
        assert_eq!(plan.inserts.len(), 2);
    }

    #[test]
    fn test_dirty_managed_entity_is_planned_as_update() {
        let cat = catalog();
        let tracker_sync = RelationshipSynchronizer::new(cat.clone());
        let mut tracker = ChangeTracker::new();

        let e = employee("12345678Z");
        tracker.mark_managed(&e, true);
        e.write().unwrap().set("nss", "12345678Z");
        e.write().unwrap().set("department_id", 4);

        let plan = FlushPlan::compute(&tracker, &tracker_sync, &cat).unwrap();
        assert_eq!(plan.updates, vec![entity_id(&e)]);
        assert!(plan.inserts.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_clean_session_has_empty_plan() {
        let cat = catalog();
        let sync = RelationshipSynchronizer::new(cat.clone());
        let mut tracker = ChangeTracker::new();

        let e = employee("12345678Z");
        tracker.mark_managed(&e, true);

        let plan = FlushPlan::compute(&tracker, &sync, &cat).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }
}
