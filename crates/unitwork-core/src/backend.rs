//! Storage backend contract.
//!
//! The engine never talks to a database directly: every durable effect goes
//! through the [`StorageBackend`] trait, implemented by an external
//! collaborator (a SQL driver, a remote service, or an in-memory store in
//! tests). Calls are synchronous from the engine's perspective; timeouts and
//! retries are the collaborator's responsibility.

use crate::entity::FieldMap;
use crate::identity::Identity;
use std::fmt;

/// The persistable state of one entity, as handed to the backend.
///
/// Owning to-one references appear as resolved join-field values inside
/// `fields`; owning many-to-many associations appear as identity lists in
/// `links`, keyed by relationship name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    /// The declared entity type name.
    pub entity_type: String,
    /// The entity's identity; `None` for inserts of generated-key entities,
    /// where the backend assigns and returns one.
    pub identity: Option<Identity>,
    /// Scalar field values, join fields included.
    pub fields: FieldMap,
    /// Owning many-to-many association state: relationship name to target
    /// identities, each exactly once.
    pub links: std::collections::BTreeMap<String, Vec<Identity>>,
}

/// Classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Constraint violation (uniqueness, referential integrity).
    Constraint,
    /// The addressed row does not exist.
    MissingRow,
    /// Transaction bracketing failure (begin/commit/rollback).
    Transaction,
    /// Any other backend-specific failure.
    Other,
}

/// A failure reported by the storage backend collaborator.
#[derive(Debug)]
pub struct BackendError {
    /// Failure classification.
    pub kind: BackendErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, when the collaborator has one.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BackendError {
    /// Create an error of the given kind.
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a constraint-violation error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Constraint, message)
    }

    /// Create a missing-row error.
    pub fn missing_row(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::MissingRow, message)
    }

    /// Create a transaction-bracketing error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transaction, message)
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether this is a constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == BackendErrorKind::Constraint
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// The outbound storage collaborator.
///
/// A session owns exactly one backend handle for its lifetime and brackets
/// flushed operations inside the handle's transaction.
pub trait StorageBackend {
    /// Open a transaction on this handle.
    fn begin(&mut self) -> Result<(), BackendError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<(), BackendError>;

    /// Fetch a row by identity. `Ok(None)` when no such row exists; this is
    /// not an error.
    fn fetch_by_identity(
        &mut self,
        entity_type: &str,
        identity: &Identity,
    ) -> Result<Option<FieldMap>, BackendError>;

    /// Insert a row, returning its effective identity. When the snapshot
    /// carries no identity the backend assigns a generated one.
    fn execute_insert(&mut self, snapshot: &EntitySnapshot) -> Result<Identity, BackendError>;

    /// Update an existing row from the snapshot.
    fn execute_update(&mut self, snapshot: &EntitySnapshot) -> Result<(), BackendError>;

    /// Delete a row by identity.
    fn execute_delete(
        &mut self,
        entity_type: &str,
        identity: &Identity,
    ) -> Result<(), BackendError>;
}
