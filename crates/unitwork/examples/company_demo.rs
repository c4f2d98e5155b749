//! Drives the engine through a small company domain, the way a CRUD script
//! would: insert an employee with a cascaded vehicle, assign a project,
//! raise a salary, and read everything back from a fresh session.
//!
//! Run with: `cargo run --example company_demo`

use std::sync::Arc;
use unitwork::{
    Engine, Entity, EntityMeta, FieldMeta, FieldType, KeyShape, MetadataCatalog, RelationKind,
    RelationshipMeta, Value,
};
use unitwork_memory::MemoryBackend;

fn build_catalog() -> unitwork::Result<MetadataCatalog> {
    let employee = EntityMeta::new(
        "employee",
        KeyShape::single("nss", FieldType::Text),
        vec![
            FieldMeta::new("nss", FieldType::Text),
            FieldMeta::new("name", FieldType::Text).nullable(true),
            FieldMeta::new("salary", FieldType::Double).nullable(true),
            FieldMeta::new("vehicle_plate", FieldType::Text).nullable(true),
        ],
    )
    .relationship(
        RelationshipMeta::new("vehicle", "vehicle", RelationKind::OneToOne)
            .join_field("vehicle_plate")
            .inverse("owner")
            .cascade_save(true),
    )
    .relationship(
        RelationshipMeta::new("projects", "project", RelationKind::ManyToMany)
            .inverse("participants")
            .cascade_save(true),
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

    MetadataCatalog::builder()
        .entity(employee)
        .entity(vehicle)
        .entity(project)
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let catalog = Arc::new(build_catalog()?);
    let engine = Engine::new(catalog.clone(), MemoryBackend::new(catalog));

    // Insert an employee; the new vehicle rides along via cascade-on-save.
    let mut session = engine.open_session();
    session.begin_transaction()?;

    let employee = Entity::new("employee")
        .field("nss", "12345678O")
        .field("name", "Oscar")
        .field("salary", 1500.0)
        .into_ref();
    let vehicle = Entity::new("vehicle")
        .field("plate", "1061GVG")
        .field("brand", "Peugeot")
        .into_ref();

    session.save(&employee)?;
    session.add_association(&employee, "vehicle", &vehicle)?;
    session.commit()?;
    println!("inserted employee 12345678O with vehicle 1061GVG");

    // Assign a project; both in-memory sides agree after the single call.
    session.begin_transaction()?;
    let project = Entity::new("project").field("name", "GALAXIA").into_ref();
    session.add_association(&employee, "projects", &project)?;
    session.commit()?;

    let participants = session.associations(&project, "participants")?;
    println!(
        "project GALAXIA (id {:?}) has {} participant(s)",
        project.read().unwrap().get("id"),
        participants.len()
    );

    // Raise the salary.
    session.begin_transaction()?;
    session.set_field(&employee, "salary", 2000.0)?;
    session.commit()?;
    session.close();

    // A fresh session sees the committed state.
    let mut reader = engine.open_session();
    let identity = reader.identity("employee", vec![Value::from("12345678O")])?;
    let loaded = reader.load("employee", &identity)?;
    println!(
        "reloaded employee: name={:?} salary={:?}",
        loaded.read().unwrap().get("name"),
        loaded.read().unwrap().get("salary")
    );
    reader.close();

    engine.shutdown();
    Ok(())
}
