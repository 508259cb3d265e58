//! Error types for sub-document operations.

use thiserror::Error;

/// Result type alias for sub-document operations.
pub type FragmentResult<T> = Result<T, FragmentError>;

/// Errors that can occur during fragment operations.
///
/// All variants are local, synchronous failures: the mutation that raised
/// one leaves prior state unchanged, and nothing here is retried or
/// swallowed by the engine.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// A fragment or collection already belongs to a different owner.
    ///
    /// Re-parenting silently would corrupt the other owner's state; the
    /// remedy is an explicit `copy()` of the fragment before assignment.
    #[error("fragment of type '{type_name}' is already owned at key '{key}'; copy() it before assigning to another owner")]
    AlreadyOwned {
        /// Schema type of the fragment being assigned.
        type_name: String,
        /// Attribute key under its current owner.
        key: String,
    },

    /// A value's schema is incompatible with the declared attribute type.
    #[error("type mismatch at attribute '{attribute}': expected {expected}, found {found}")]
    TypeMismatch {
        /// The attribute being assigned.
        attribute: String,
        /// The declared type.
        expected: String,
        /// The actual type found.
        found: String,
    },

    /// Coercion was given a shape it cannot interpret.
    #[error("cannot coerce {found} to {expected}")]
    UnsupportedCoercion {
        /// The coercion target.
        expected: String,
        /// The shape of the input.
        found: String,
    },

    /// A schema type has no registration in the registry.
    #[error("no fragment type '{type_name}' is registered; register it on the SchemaRegistry before materializing")]
    UnknownFragmentType {
        /// The missing type name.
        type_name: String,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FragmentError {
    /// Create an already-owned error.
    #[inline]
    pub fn already_owned(type_name: impl Into<String>, key: impl Into<String>) -> Self {
        FragmentError::AlreadyOwned {
            type_name: type_name.into(),
            key: key.into(),
        }
    }

    /// Create a type mismatch error.
    #[inline]
    pub fn type_mismatch(
        attribute: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        FragmentError::TypeMismatch {
            attribute: attribute.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an unsupported coercion error.
    #[inline]
    pub fn unsupported_coercion(
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        FragmentError::UnsupportedCoercion {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an unknown fragment type error.
    #[inline]
    pub fn unknown_fragment_type(type_name: impl Into<String>) -> Self {
        FragmentError::UnknownFragmentType {
            type_name: type_name.into(),
        }
    }
}

/// Get the type name of a JSON value.
#[inline]
pub fn value_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let err = FragmentError::already_owned("address", "home");
        assert!(err.to_string().contains("already owned"));
        assert!(err.to_string().contains("home"));

        let err = FragmentError::unknown_fragment_type("mailing-address");
        assert!(err.to_string().contains("mailing-address"));
        assert!(err.to_string().contains("register"));
    }

    #[test]
    fn test_value_type_name() {
        assert_eq!(value_type_name(&json!(null)), "null");
        assert_eq!(value_type_name(&json!(true)), "boolean");
        assert_eq!(value_type_name(&json!(42)), "number");
        assert_eq!(value_type_name(&json!("hello")), "string");
        assert_eq!(value_type_name(&json!([1, 2, 3])), "array");
        assert_eq!(value_type_name(&json!({"a": 1})), "object");
    }
}
