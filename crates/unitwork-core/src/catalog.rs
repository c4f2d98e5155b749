//! Entity metadata catalog.
//!
//! The catalog is the single source of truth for entity shapes: primary key
//! shape, persistent fields, and relationship descriptors. It is built once
//! by an external mapping loader through [`CatalogBuilder`], validated, and
//! immutable afterwards — sessions share it behind an `Arc` and query it per
//! entity type as types are first encountered.
//!
//! Metadata is explicit configuration: there is no reflection and no mapping
//! file parsing in this crate.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::identity::{Identity, KeyShape};
use crate::value::FieldType;
use std::collections::HashMap;
use std::sync::Arc;

/// The cardinality of a relationship between two entity types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationKind {
    /// One-to-one: an employee has one vehicle.
    OneToOne,
    /// Many-to-one: many employees belong to one department.
    #[default]
    ManyToOne,
    /// One-to-many: one department has many employees.
    OneToMany,
    /// Many-to-many: employees take part in many projects.
    ManyToMany,
}

impl RelationKind {
    /// True for relationships referencing a single target (to-one).
    pub const fn is_to_one(&self) -> bool {
        matches!(self, RelationKind::OneToOne | RelationKind::ManyToOne)
    }

    /// True for relationships referencing a collection (to-many).
    pub const fn is_to_many(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Metadata for one persistent field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    name: String,
    field_type: FieldType,
    nullable: bool,
}

impl FieldMeta {
    /// Create a non-nullable field descriptor.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// Set nullability.
    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared type.
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Whether NULL is a legal stored value.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Metadata for one named association on an entity type.
///
/// Exactly one side of a bidirectional association is the owning side: the
/// side whose state is written to the storage backend. The other side is
/// derived — readable in memory, synchronized by the engine, never written
/// independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipMeta {
    name: String,
    kind: RelationKind,
    target: String,
    owning: bool,
    inverse: Option<String>,
    cascade_save: bool,
    required: bool,
    join_fields: Vec<String>,
    eager: bool,
}

impl RelationshipMeta {
    /// Create a relationship descriptor. Owning by default; mark the derived
    /// side of a bidirectional pair with `.owning(false)`.
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            owning: true,
            inverse: None,
            cascade_save: false,
            required: false,
            join_fields: Vec::new(),
            eager: false,
        }
    }

    /// Set the owning-side indicator.
    #[must_use]
    pub fn owning(mut self, value: bool) -> Self {
        self.owning = value;
        self
    }

    /// Declare the inverse field name on the target type, making the
    /// association bidirectional.
    #[must_use]
    pub fn inverse(mut self, field: impl Into<String>) -> Self {
        self.inverse = Some(field.into());
        self
    }

    /// Enable cascade-on-save: saving the owner also saves new targets.
    #[must_use]
    pub fn cascade_save(mut self, value: bool) -> Self {
        self.cascade_save = value;
        self
    }

    /// Mark a to-one reference as non-nullable. Required references drive
    /// insert ordering: the target must be inserted before the owner.
    #[must_use]
    pub fn required(mut self, value: bool) -> Self {
        self.required = value;
        self
    }

    /// Declare the owner-side field(s) holding the target's key, in the
    /// target key's component order.
    #[must_use]
    pub fn join_fields(mut self, fields: Vec<String>) -> Self {
        self.join_fields = fields;
        self
    }

    /// Single join field convenience.
    #[must_use]
    pub fn join_field(mut self, field: impl Into<String>) -> Self {
        self.join_fields = vec![field.into()];
        self
    }

    /// Mark a collection as eagerly fetched. Recorded as metadata; an
    /// uninitialized collection otherwise reads as empty.
    #[must_use]
    pub fn eager(mut self, value: bool) -> Self {
        self.eager = value;
        self
    }

    /// The relationship field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cardinality.
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// The target entity type name.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether this is the owning side.
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    /// The inverse field name on the target type, if bidirectional.
    pub fn inverse_name(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    /// Whether save cascades from the owner to targets.
    pub fn cascades_on_save(&self) -> bool {
        self.cascade_save
    }

    /// Whether the reference is non-nullable.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// The owner-side join fields (empty for to-many relationships).
    pub fn join_field_names(&self) -> &[String] {
        &self.join_fields
    }

    /// Whether the collection is marked for eager fetching.
    pub fn is_eager(&self) -> bool {
        self.eager
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    name: String,
    key: KeyShape,
    fields: Vec<FieldMeta>,
    relationships: Vec<RelationshipMeta>,
}

impl EntityMeta {
    /// Create an entity descriptor. `fields` must include the key fields.
    pub fn new(name: impl Into<String>, key: KeyShape, fields: Vec<FieldMeta>) -> Self {
        Self {
            name: name.into(),
            key,
            fields,
            relationships: Vec::new(),
        }
    }

    /// Attach a relationship descriptor.
    #[must_use]
    pub fn relationship(mut self, rel: RelationshipMeta) -> Self {
        self.relationships.push(rel);
        self
    }

    /// The entity type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary key shape.
    pub fn key(&self) -> &KeyShape {
        &self.key
    }

    /// All declared persistent fields.
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// All declared relationships.
    pub fn relationships(&self) -> &[RelationshipMeta] {
        &self.relationships
    }

    /// Look up a relationship by name.
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipMeta> {
        self.relationships.iter().find(|r| r.name() == name)
    }

    /// Whether a field is part of the primary key.
    pub fn is_key_field(&self, name: &str) -> bool {
        self.key.contains(name)
    }

    /// Extract the identity of an entity instance from its key fields.
    ///
    /// Returns `Ok(None)` when a simple key is wholly absent — the key is
    /// expected to be assigned by the storage backend at flush. A composite
    /// key with only some components present is rejected.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidIdentity`] for partial composite keys or components
    /// violating the key shape.
    pub fn identity_of(&self, entity: &Entity) -> Result<Option<Identity>> {
        let mut components = Vec::with_capacity(self.key.arity());
        let mut missing = 0_usize;

        for key_field in self.key.fields() {
            match entity.get(key_field.name()) {
                Some(v) if !v.is_null() => components.push(v.clone()),
                _ => missing += 1,
            }
        }

        if missing == self.key.arity() {
            return Ok(None);
        }
        if missing > 0 {
            return Err(Error::InvalidIdentity {
                reason: format!(
                    "composite key of '{}' has {} of {} component(s) missing",
                    self.name,
                    missing,
                    self.key.arity()
                ),
            });
        }

        Identity::new(components, &self.key).map(Some)
    }
}

/// Immutable catalog of entity metadata, shared across sessions.
#[derive(Debug, Clone, Default)]
pub struct MetadataCatalog {
    entities: HashMap<String, Arc<EntityMeta>>,
}

impl MetadataCatalog {
    /// Start building a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Look up an entity type, failing for undeclared types.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownEntityType`] when the type is not in the catalog.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityMeta>> {
        self.entities.get(name).ok_or_else(|| Error::UnknownEntityType {
            name: name.to_string(),
        })
    }

    /// Look up an entity type without failing.
    pub fn get(&self, name: &str) -> Option<&Arc<EntityMeta>> {
        self.entities.get(name)
    }

    /// Number of declared entity types.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the catalog declares no types.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Builder for [`MetadataCatalog`]. Collects entity descriptors and
/// cross-validates them on `build`.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entities: Vec<EntityMeta>,
}

impl CatalogBuilder {
    /// Add an entity descriptor.
    #[must_use]
    pub fn entity(mut self, meta: EntityMeta) -> Self {
        self.entities.push(meta);
        self
    }

    /// Validate and freeze the catalog.
    ///
    /// Checks that key fields are declared fields, relationship targets are
    /// declared types, inverse names exist on their targets, and owning-side
    /// join fields are declared on the owner.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownField`], [`Error::UnknownEntityType`] or
    /// [`Error::UnknownRelationship`] naming the offending declaration.
    pub fn build(self) -> Result<MetadataCatalog> {
        let by_name: HashMap<&str, &EntityMeta> =
            self.entities.iter().map(|e| (e.name(), e)).collect();

        for meta in &self.entities {
            for key_field in meta.key().fields() {
                if meta.field(key_field.name()).is_none() {
                    return Err(Error::UnknownField {
                        entity_type: meta.name().to_string(),
                        field: key_field.name().to_string(),
                    });
                }
            }

            for rel in meta.relationships() {
                let Some(target) = by_name.get(rel.target()) else {
                    return Err(Error::UnknownEntityType {
                        name: rel.target().to_string(),
                    });
                };

                if let Some(inverse) = rel.inverse_name() {
                    if target.find_relationship(inverse).is_none() {
                        return Err(Error::UnknownRelationship {
                            entity_type: target.name().to_string(),
                            relation: inverse.to_string(),
                        });
                    }
                }

                for join_field in rel.join_field_names() {
                    if meta.field(join_field).is_none() {
                        return Err(Error::UnknownField {
                            entity_type: meta.name().to_string(),
                            field: join_field.to_string(),
                        });
                    }
                }
            }
        }

        tracing::debug!(entity_types = self.entities.len(), "Catalog built");

        Ok(MetadataCatalog {
            entities: self
                .entities
                .into_iter()
                .map(|e| (e.name().to_string(), Arc::new(e)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn department() -> EntityMeta {
        EntityMeta::new(
            "department",
            KeyShape::single("id", FieldType::Int),
            vec![
                FieldMeta::new("id", FieldType::Int),
                FieldMeta::new("name", FieldType::Text),
            ],
        )
    }

    fn employee() -> EntityMeta {
        EntityMeta::new(
            "employee",
            KeyShape::single("nss", FieldType::Text),
            vec![
                FieldMeta::new("nss", FieldType::Text),
                FieldMeta::new("name", FieldType::Text),
                FieldMeta::new("salary", FieldType::Double).nullable(true),
                FieldMeta::new("department_id", FieldType::Int).nullable(true),
            ],
        )
        .relationship(
            RelationshipMeta::new("department", "department", RelationKind::ManyToOne)
                .join_field("department_id")
                .inverse("employees"),
        )
    }

    fn department_with_inverse() -> EntityMeta {
        department().relationship(
            RelationshipMeta::new("employees", "employee", RelationKind::OneToMany)
                .owning(false)
                .inverse("department"),
        )
    }

    #[test]
    fn test_build_valid_catalog() {
        let catalog = MetadataCatalog::builder()
            .entity(employee())
            .entity(department_with_inverse())
            .build()
            .unwrap();

        assert_eq!(catalog.len(), 2);
        let meta = catalog.entity("employee").unwrap();
        assert_eq!(meta.key().arity(), 1);
        assert!(meta.find_relationship("department").is_some());
        assert!(catalog.entity("vehicle").is_err());
    }

    #[test]
    fn test_build_rejects_unknown_target() {
        let err = MetadataCatalog::builder()
            .entity(employee())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntityType { .. }));
    }

    #[test]
    fn test_build_rejects_dangling_inverse() {
        let err = MetadataCatalog::builder()
            .entity(employee())
            .entity(department())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRelationship { .. }));
    }

    #[test]
    fn test_build_rejects_undeclared_join_field() {
        let meta = EntityMeta::new(
            "vehicle",
            KeyShape::single("plate", FieldType::Text),
            vec![FieldMeta::new("plate", FieldType::Text)],
        )
        .relationship(
            RelationshipMeta::new("owner", "vehicle", RelationKind::ManyToOne)
                .join_field("owner_nss"),
        );

        let err = MetadataCatalog::builder().entity(meta).build().unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn test_identity_of_simple_key() {
        let meta = employee();
        let e = Entity::new("employee").field("nss", "12345678Z");
        let id = meta.identity_of(&e).unwrap().unwrap();
        assert_eq!(id.components(), &[Value::from("12345678Z")]);
    }

    #[test]
    fn test_identity_of_absent_simple_key_is_none() {
        let meta = employee();
        let e = Entity::new("employee").field("name", "Oscar");
        assert!(meta.identity_of(&e).unwrap().is_none());
    }

    #[test]
    fn test_identity_of_partial_composite_key_rejected() {
        let meta = EntityMeta::new(
            "assignment",
            KeyShape::new(vec![
                crate::identity::KeyField::new("employee_nss", FieldType::Text),
                crate::identity::KeyField::new("project_id", FieldType::Int),
            ]),
            vec![
                FieldMeta::new("employee_nss", FieldType::Text),
                FieldMeta::new("project_id", FieldType::Int),
                FieldMeta::new("hours", FieldType::Int).nullable(true),
            ],
        );

        let partial = Entity::new("assignment").field("employee_nss", "12345678A");
        let err = meta.identity_of(&partial).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity { .. }));

        let full = Entity::new("assignment")
            .field("employee_nss", "12345678A")
            .field("project_id", 1);
        assert!(meta.identity_of(&full).unwrap().unwrap().is_composite());
    }

    #[test]
    fn test_relation_kind_helpers() {
        assert!(RelationKind::ManyToOne.is_to_one());
        assert!(RelationKind::OneToOne.is_to_one());
        assert!(RelationKind::OneToMany.is_to_many());
        assert!(RelationKind::ManyToMany.is_to_many());
    }
}
