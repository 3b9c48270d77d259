//! Error types for the Jam engine.

use crate::id::ObjectRef;
use crate::{FieldName, TypeName};
use thiserror::Error;

/// All possible errors from the Jam engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("unknown model type: {0}")]
    UnknownModel(TypeName),

    #[error("unknown field '{field}' on model {ty}")]
    UnknownField { ty: TypeName, field: FieldName },

    #[error("invalid entity description: {0}")]
    InvalidDescription(String),

    #[error("no {op} operation registered for model {ty}")]
    MissingOperation { ty: TypeName, op: String },

    #[error("unknown operation name: {0}")]
    UnknownOperation(String),

    // Value errors
    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: FieldName, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("reverse relationship '{0}' cannot be set directly")]
    ReverseRelationship(FieldName),

    // Record errors
    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(String),

    #[error("conflict while applying diff to {ty} {id}: field '{field}' changed")]
    Conflict {
        ty: TypeName,
        id: String,
        field: FieldName,
    },

    // Commit errors
    #[error("required relationships form a cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("no outgoing diff to commit")]
    NoOutgoingDiff,

    // Transaction errors
    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    // Query errors
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Remote errors
    #[error("remote operation failed: {0}")]
    Remote(String),
}

impl Error {
    /// Name `object` by its external reference in record-level errors.
    ///
    /// Tables and models only know interned handles; the store resolves
    /// them before errors reach the caller.
    pub fn naming(self, object: &ObjectRef) -> Self {
        match self {
            Error::RecordNotFound(_) => Error::RecordNotFound(object.to_string()),
            Error::RecordAlreadyExists(_) => Error::RecordAlreadyExists(object.to_string()),
            Error::Conflict { field, .. } => Error::Conflict {
                ty: object.ty.clone(),
                id: object.id.to_string(),
                field,
            },
            other => other,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownModel("movie".into());
        assert_eq!(err.to_string(), "unknown model type: movie");

        let err = Error::MissingOperation {
            ty: "movie".into(),
            op: "create".into(),
        };
        assert_eq!(
            err.to_string(),
            "no create operation registered for model movie"
        );

        let err = Error::Conflict {
            ty: "book".into(),
            id: "1".into(),
            field: "title".into(),
        };
        assert_eq!(
            err.to_string(),
            "conflict while applying diff to book 1: field 'title' changed"
        );
    }

    #[test]
    fn naming_replaces_handles() {
        let movie = ObjectRef::new("movie", 7);
        let err = Error::RecordNotFound("movie|#3".into()).naming(&movie);
        assert_eq!(err.to_string(), "record not found: movie|7");

        let err = Error::Conflict {
            ty: "movie".into(),
            id: "#3".into(),
            field: "title".into(),
        }
        .naming(&movie);
        assert_eq!(
            err.to_string(),
            "conflict while applying diff to movie 7: field 'title' changed"
        );

        let err = Error::UnknownModel("book".into()).naming(&movie);
        assert_eq!(err, Error::UnknownModel("book".into()));
    }

    #[test]
    fn cycle_display_lists_path() {
        let err = Error::DependencyCycle(vec!["a|1".into(), "b|2".into()]);
        assert_eq!(
            err.to_string(),
            "required relationships form a cycle: a|1 -> b|2"
        );
    }
}
