//! Core types for the unitwork persistence engine.
//!
//! This crate provides the foundational abstractions shared by the session
//! layer and the storage backends:
//!
//! - [`Value`] — dynamically-typed scalar values with structural equality
//! - [`Identity`] — validated simple and composite primary keys
//! - [`Entity`] — catalog-driven dynamic entity records
//! - [`MetadataCatalog`] — immutable entity/field/relationship metadata
//! - [`StorageBackend`] — the outbound collaborator contract
//! - [`Error`] — the engine-wide error taxonomy

pub mod backend;
pub mod catalog;
pub mod entity;
pub mod error;
pub mod identity;
pub mod value;

pub use backend::{BackendError, BackendErrorKind, EntitySnapshot, StorageBackend};
pub use catalog::{
    CatalogBuilder, EntityMeta, FieldMeta, MetadataCatalog, RelationKind, RelationshipMeta,
};
pub use entity::{Entity, EntityId, EntityRef, FieldMap, entity_id};
pub use error::{Error, Result};
pub use identity::{Identity, KeyField, KeyShape};
pub use value::{FieldType, Value};
