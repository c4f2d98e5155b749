//! Shared fixtures: a company-domain catalog (departments, employees,
//! projects, vehicles, composite-key assignments) and an engine over the
//! in-memory backend.

#![allow(dead_code)]

use std::sync::Arc;
use unitwork::{
    Engine, Entity, EntityMeta, EntityRef, FieldMeta, FieldType, Identity, KeyField, KeyShape,
    MetadataCatalog, RelationKind, RelationshipMeta, Value,
};
use unitwork_memory::MemoryBackend;

pub fn catalog() -> Arc<MetadataCatalog> {
    let department = EntityMeta::new(
        "department",
        KeyShape::single("id", FieldType::Int),
        vec![
            FieldMeta::new("id", FieldType::Int),
            FieldMeta::new("name", FieldType::Text).nullable(true),
        ],
    )
    .relationship(
        RelationshipMeta::new("employees", "employee", RelationKind::OneToMany)
            .owning(false)
            .inverse("department"),
    );

    let employee = EntityMeta::new(
        "employee",
        KeyShape::single("nss", FieldType::Text),
        vec![
            FieldMeta::new("nss", FieldType::Text),
            FieldMeta::new("name", FieldType::Text).nullable(true),
            FieldMeta::new("salary", FieldType::Double).nullable(true),
            FieldMeta::new("department_id", FieldType::Int).nullable(true),
            FieldMeta::new("vehicle_plate", FieldType::Text).nullable(true),
        ],
    )
    .relationship(
        RelationshipMeta::new("department", "department", RelationKind::ManyToOne)
            .join_field("department_id")
            .inverse("employees")
            .required(true)
            .cascade_save(true),
    )
    .relationship(
        RelationshipMeta::new("projects", "project", RelationKind::ManyToMany)
            .inverse("participants")
            .cascade_save(true),
    )
    .relationship(
        RelationshipMeta::new("vehicle", "vehicle", RelationKind::OneToOne)
            .join_field("vehicle_plate")
            .inverse("owner")
            .cascade_save(true),
    );

    let project = EntityMeta::new(
        "project",
        KeyShape::single("id", FieldType::Int),
        vec![
            FieldMeta::new("id", FieldType::Int),
            FieldMeta::new("name", FieldType::Text).nullable(true),
        ],
    )
    .relationship(
        RelationshipMeta::new("participants", "employee", RelationKind::ManyToMany)
            .owning(false)
            .inverse("projects"),
    );

    let vehicle = EntityMeta::new(
        "vehicle",
        KeyShape::single("plate", FieldType::Text),
        vec![
            FieldMeta::new("plate", FieldType::Text),
            FieldMeta::new("brand", FieldType::Text).nullable(true),
        ],
    )
    .relationship(
        RelationshipMeta::new("owner", "employee", RelationKind::OneToOne)
            .owning(false)
            .inverse("vehicle"),
    );

    let assignment = EntityMeta::new(
        "assignment",
        KeyShape::new(vec![
            KeyField::new("employee_nss", FieldType::Text),
            KeyField::new("project_id", FieldType::Int),
        ]),
        vec![
            FieldMeta::new("employee_nss", FieldType::Text),
            FieldMeta::new("project_id", FieldType::Int),
            FieldMeta::new("hours", FieldType::Int).nullable(true),
        ],
    );

    Arc::new(
        MetadataCatalog::builder()
            .entity(department)
            .entity(employee)
            .entity(project)
            .entity(vehicle)
            .entity(assignment)
            .build()
            .expect("fixture catalog is consistent"),
    )
}

pub fn engine() -> Engine<MemoryBackend> {
    let catalog = catalog();
    let backend = MemoryBackend::new(catalog.clone());
    Engine::new(catalog, backend)
}

pub fn employee(nss: &str, name: &str, salary: f64) -> EntityRef {
    Entity::new("employee")
        .field("nss", nss)
        .field("name", name)
        .field("salary", salary)
        .into_ref()
}

pub fn department(id: i64, name: &str) -> EntityRef {
    Entity::new("department")
        .field("id", id)
        .field("name", name)
        .into_ref()
}

pub fn project(id: i64, name: &str) -> EntityRef {
    Entity::new("project")
        .field("id", id)
        .field("name", name)
        .into_ref()
}

pub fn vehicle(plate: &str, brand: &str) -> EntityRef {
    Entity::new("vehicle")
        .field("plate", plate)
        .field("brand", brand)
        .into_ref()
}

pub fn text_id(value: &str) -> Identity {
    Identity::from_value(Value::from(value)).expect("non-null key")
}

pub fn int_id(value: i64) -> Identity {
    Identity::from_value(Value::Int(value)).expect("non-null key")
}
