//! Primary key identities, simple and composite.
//!
//! An [`Identity`] is an ordered tuple of scalar components with structural
//! equality and hashing. Construction is validated against the entity type's
//! [`KeyShape`]: the component count must match the declared key fields, no
//! component may be NULL, and each component must satisfy its declared type.
//! A partially-specified composite key is not a valid identity.

use crate::error::{Error, Result};
use crate::value::{FieldType, Value};
use serde::{Deserialize, Serialize};

/// One declared key field: name plus expected component type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    name: String,
    field_type: FieldType,
}

impl KeyField {
    /// Create a key field descriptor.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    /// The key field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared component type.
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
}

/// The shape of an entity type's primary key: an ordered list of key fields.
///
/// A single-field shape describes a simple key; two or more fields describe a
/// composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShape {
    fields: Vec<KeyField>,
}

impl KeyShape {
    /// Create a shape from ordered key fields.
    ///
    /// An empty field list is not a meaningful key shape; callers build
    /// shapes from catalog metadata which requires at least one key field.
    pub fn new(fields: Vec<KeyField>) -> Self {
        Self { fields }
    }

    /// Convenience constructor for a single-field key.
    pub fn single(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            fields: vec![KeyField::new(name, field_type)],
        }
    }

    /// The ordered key fields.
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Number of key components.
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Check whether a field name is part of the key.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// A validated primary key value: an ordered tuple of 1..N scalar components.
///
/// Identities are immutable once constructed. Equality and hashing are
/// structural over the components in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    components: Vec<Value>,
}

impl Identity {
    /// Construct an identity, validating the components against a key shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] if the component count does not
    /// match the shape's arity, any component is NULL, or a component does
    /// not satisfy its declared type.
    pub fn new(components: Vec<Value>, shape: &KeyShape) -> Result<Self> {
        if components.len() != shape.arity() {
            return Err(Error::InvalidIdentity {
                reason: format!(
                    "expected {} key component(s), got {}",
                    shape.arity(),
                    components.len()
                ),
            });
        }

        for (component, field) in components.iter().zip(shape.fields()) {
            if component.is_null() {
                return Err(Error::InvalidIdentity {
                    reason: format!("key component '{}' is null", field.name()),
                });
            }
            if !component.matches(field.field_type()) {
                return Err(Error::InvalidIdentity {
                    reason: format!(
                        "key component '{}' has type {}, expected {:?}",
                        field.name(),
                        component.type_name(),
                        field.field_type()
                    ),
                });
            }
        }

        Ok(Self { components })
    }

    /// Construct a single-component identity without a shape.
    ///
    /// Used where no catalog shape is in scope, e.g. a storage backend
    /// assigning a generated key. The component must still be non-null.
    pub fn from_value(component: impl Into<Value>) -> Result<Self> {
        let component = component.into();
        if component.is_null() {
            return Err(Error::InvalidIdentity {
                reason: "key component is null".to_string(),
            });
        }
        Ok(Self {
            components: vec![component],
        })
    }

    /// The ordered key components.
    pub fn components(&self) -> &[Value] {
        &self.components
    }

    /// Number of components (1 for a simple key).
    pub fn arity(&self) -> usize {
        self.components.len()
    }

    /// True for a composite (multi-component) identity.
    pub fn is_composite(&self) -> bool {
        self.components.len() > 1
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}
