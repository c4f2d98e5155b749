//! Session and unit-of-work layer for unitwork.
//!
//! This crate coordinates object identity, change tracking, and transactional
//! persistence:
//!
//! - **Identity map**: ensures a single in-memory instance per primary key.
//! - **Change tracking**: records inserts, updates, and deletes before flush.
//! - **Relationship synchronization**: keeps both sides of bidirectional
//!   associations consistent through a single mutation entry point.
//! - **Transactional safety**: wraps flush/commit/rollback around a
//!   [`StorageBackend`](unitwork_core::StorageBackend).
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no hidden queries; flush happens on demand
//!   or at commit.
//! - **Ownership clarity**: a session exclusively owns its backend handle,
//!   identity map, and change tracker. Sessions are single-threaded by
//!   contract.
//! - **Metadata-driven**: entity shapes and relationships come from an
//!   immutable catalog, not from reflection.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(catalog, backend);
//! session.begin_transaction()?;
//!
//! // New entities are INSERTed on flush.
//! session.save(&employee)?;
//!
//! // Lookups go through the identity map first.
//! let dept = session.get("department", &dept_id)?;
//!
//! // Association edits synchronize both sides at once.
//! session.add_association(&employee, "projects", &project)?;
//!
//! session.commit()?;
//! session.close();
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod query;
pub mod relations;
pub mod session;

pub use change_tracker::{ChangeRecord, ChangeTracker, EntityState, RollbackOutcome};
pub use flush::{DeleteOp, FlushPlan};
pub use identity_map::IdentityMap;
pub use query::QueryExecutor;
pub use relations::RelationshipSynchronizer;
pub use session::{Session, SessionConfig};

use unitwork_core::Identity;

/// Unique key for an entity row within a session: declared type name plus
/// primary key identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity_type: String,
    identity: Identity,
}

impl EntityKey {
    /// Create a key from an entity type name and identity.
    pub fn new(entity_type: impl Into<String>, identity: Identity) -> Self {
        Self {
            entity_type: entity_type.into(),
            identity,
        }
    }

    /// The entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The primary key identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.entity_type, self.identity)
    }
}
