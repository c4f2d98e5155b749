//! Error types for session and unit-of-work operations.

use crate::backend::BackendError;
use crate::identity::Identity;
use std::fmt;

/// The primary error type for all engine operations.
///
/// Every failure is reported to the caller; nothing is swallowed. Unless
/// stated otherwise, an error leaves the session's prior state intact so the
/// caller can correct the input and retry the same operation.
#[derive(Debug)]
pub enum Error {
    /// A primary key value violates its declared shape (wrong component
    /// count, null component, type mismatch, partial composite key).
    InvalidIdentity {
        /// What was wrong with the components.
        reason: String,
    },

    /// An identity is already bound to a different in-memory instance, or a
    /// detached instance was offered for saving.
    DuplicateIdentity {
        /// The entity type involved.
        entity_type: String,
        /// Description of the conflict.
        reason: String,
    },

    /// An operation named an entity type the catalog does not declare.
    UnknownEntityType {
        /// The undeclared type name.
        name: String,
    },

    /// A field access named a field the entity type does not declare.
    UnknownField {
        /// The entity type.
        entity_type: String,
        /// The undeclared field name.
        field: String,
    },

    /// A relationship operation named an association the entity type does
    /// not declare.
    UnknownRelationship {
        /// The entity type.
        entity_type: String,
        /// The undeclared relationship name.
        relation: String,
    },

    /// A relationship mutation was invoked from the derived side. Callers
    /// must mutate associations from the owning side; the engine does not
    /// silently redirect.
    NotOwningSide {
        /// The entity type the caller mutated.
        entity_type: String,
        /// The relationship name.
        relation: String,
    },

    /// No insert order satisfies the required references between new
    /// entities.
    CyclicDependency {
        /// Entity type names along the detected cycle.
        members: Vec<String>,
    },

    /// `load` was called for an identity with no row behind it.
    EntityNotFound {
        /// The entity type.
        entity_type: String,
        /// The identity that resolved to nothing.
        identity: Identity,
    },

    /// The entity is in a lifecycle state that forbids the operation
    /// (removing an untracked entity, re-saving a removed one).
    StaleEntity {
        /// The entity type.
        entity_type: String,
        /// Why the entity cannot be used.
        reason: String,
    },

    /// A value or association target does not satisfy the declared type.
    TypeMismatch {
        /// The declared expectation.
        expected: String,
        /// What was actually supplied.
        actual: String,
        /// Where the mismatch occurred (field or relationship).
        context: String,
    },

    /// A mutating operation was invoked outside an open transaction.
    NoActiveTransaction,

    /// A flush aborted; the wrapped cause is the first failed operation.
    /// In-memory state is unchanged, so the flush may be retried.
    Flush(Box<Error>),

    /// A storage backend failure, wrapped uniformly.
    Backend(BackendError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidIdentity { reason } => {
                write!(f, "Invalid identity: {reason}")
            }
            Error::DuplicateIdentity {
                entity_type,
                reason,
            } => {
                write!(f, "Duplicate identity for '{entity_type}': {reason}")
            }
            Error::UnknownEntityType { name } => {
                write!(f, "Unknown entity type '{name}'")
            }
            Error::UnknownField { entity_type, field } => {
                write!(f, "Unknown field '{field}' on entity type '{entity_type}'")
            }
            Error::UnknownRelationship {
                entity_type,
                relation,
            } => {
                write!(
                    f,
                    "Unknown relationship '{relation}' on entity type '{entity_type}'"
                )
            }
            Error::NotOwningSide {
                entity_type,
                relation,
            } => {
                write!(
                    f,
                    "Relationship '{relation}' is not owned by '{entity_type}'; mutate it from the owning side"
                )
            }
            Error::CyclicDependency { members } => {
                write!(f, "Dependency cycle detected: {}", members.join(" -> "))
            }
            Error::EntityNotFound {
                entity_type,
                identity,
            } => {
                write!(f, "No '{entity_type}' entity with identity {identity}")
            }
            Error::StaleEntity {
                entity_type,
                reason,
            } => {
                write!(f, "Stale '{entity_type}' entity: {reason}")
            }
            Error::TypeMismatch {
                expected,
                actual,
                context,
            } => {
                write!(
                    f,
                    "Type mismatch in {context}: expected {expected}, found {actual}"
                )
            }
            Error::NoActiveTransaction => {
                write!(f, "No active transaction")
            }
            Error::Flush(cause) => {
                write!(f, "Flush aborted: {cause}")
            }
            Error::Backend(cause) => {
                write!(f, "Storage backend error: {cause}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Flush(cause) => Some(cause.as_ref()),
            Error::Backend(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

impl Error {
    /// Wrap a flush-time failure.
    pub fn flush(cause: Error) -> Self {
        Error::Flush(Box::new(cause))
    }

    /// Whether this error surfaced a storage backend failure, directly or
    /// wrapped inside a flush abort.
    pub fn is_backend(&self) -> bool {
        match self {
            Error::Backend(_) => true,
            Error::Flush(cause) => cause.is_backend(),
            _ => false,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendErrorKind;

    #[test]
    fn test_display_messages() {
        let err = Error::UnknownRelationship {
            entity_type: "employee".to_string(),
            relation: "hobbies".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown relationship 'hobbies' on entity type 'employee'"
        );

        let err = Error::CyclicDependency {
            members: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_flush_wraps_cause() {
        let inner = Error::Backend(BackendError::new(BackendErrorKind::Other, "boom"));
        let err = Error::flush(inner);

        assert!(err.is_backend());
        assert!(err.to_string().contains("Flush aborted"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn test_backend_conversion() {
        let err: Error = BackendError::constraint("duplicate key").into();
        assert!(matches!(err, Error::Backend(_)));
        assert!(err.is_backend());
    }
}
