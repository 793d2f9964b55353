//! Flush error taxonomy.

use crate::object::ObjectId;
use crate::task::Disposition;
use sqlflush_core::Error;
use std::fmt;

/// Error returned by [`UnitOfWork::flush`](crate::UnitOfWork::flush) and
/// [`UnitOfWork::plan`](crate::UnitOfWork::plan).
///
/// Every variant is returned only after the transaction was rolled back.
#[derive(Debug)]
pub enum FlushError {
    /// The same object was registered with irreconcilable intents, e.g. it was
    /// explicitly deleted and also attached to a parent collection.
    ConflictingDisposition {
        /// Concrete entity of the object.
        entity: &'static str,
        /// The object.
        object: ObjectId,
        /// Intent already recorded on the task element.
        existing: Disposition,
        /// Intent that could not be reconciled with it.
        requested: Disposition,
    },
    /// A foreign key had to be copied from a parent whose primary key was
    /// never written.
    UnresolvedParentKey {
        /// Qualified relationship name (`Owner.relationship`).
        relationship: String,
        /// Entity whose key was missing.
        parent_entity: &'static str,
        /// Entity that needed the key.
        child_entity: &'static str,
    },
    /// An object that must be addressed by primary key has none, either
    /// because it was never given one or because an insert produced none.
    MissingPrimaryKey {
        /// Concrete entity of the object.
        entity: &'static str,
        /// The object.
        object: ObjectId,
    },
    /// A backend or transaction failure, passed through unchanged.
    Backend(Error),
    /// Row-level ordering could not break a dependency cycle.
    CycleResolutionFailure {
        /// Entity types involved in the remaining cycle.
        entities: Vec<&'static str>,
        /// Relationships whose edges form the remaining cycle.
        relationships: Vec<String>,
    },
    /// An object's entity type is not part of the mapper graph.
    UnknownEntity {
        /// The unknown entity name.
        entity: &'static str,
    },
    /// Cascade discovery did not reach a fixpoint within the configured bound.
    DiscoveryLimitExceeded {
        /// Number of passes performed.
        passes: usize,
    },
}

impl FlushError {
    /// Whether running the same flush again may succeed.
    ///
    /// Only backend errors can be transient; every other variant needs a code
    /// or mapping change.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlushError::Backend(e) => e.is_retryable() || e.is_connection_error(),
            _ => false,
        }
    }

    /// The wrapped backend error, if any.
    pub fn backend_error(&self) -> Option<&Error> {
        match self {
            FlushError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushError::ConflictingDisposition {
                entity,
                object,
                existing,
                requested,
            } => write!(
                f,
                "{}{} is registered for {} and cannot also be registered for {}",
                entity, object, existing, requested
            ),
            FlushError::UnresolvedParentKey {
                relationship,
                parent_entity,
                child_entity,
            } => write!(
                f,
                "{}: primary key of {} was not written before {} needed it",
                relationship, parent_entity, child_entity
            ),
            FlushError::MissingPrimaryKey { entity, object } => {
                write!(f, "{}{} has no primary key to identify its row", entity, object)
            }
            FlushError::Backend(e) => write!(f, "Backend error: {}", e),
            FlushError::CycleResolutionFailure {
                entities,
                relationships,
            } => write!(
                f,
                "Cannot order rows of {} (via {}); make a foreign key nullable or set post_update",
                entities.join(", "),
                relationships.join(", ")
            ),
            FlushError::UnknownEntity { entity } => {
                write!(f, "Entity '{}' is not in the mapper graph", entity)
            }
            FlushError::DiscoveryLimitExceeded { passes } => {
                write!(f, "Cascade discovery did not settle after {} passes", passes)
            }
        }
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlushError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for FlushError {
    fn from(e: Error) -> Self {
        FlushError::Backend(e)
    }
}

impl From<FlushError> for Error {
    fn from(e: FlushError) -> Self {
        match e {
            FlushError::Backend(inner) => inner,
            other => Error::Custom(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlflush_core::{QueryError, QueryErrorKind};
    use std::error::Error as _;

    fn deadlock() -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: None,
            sqlstate: Some("40P01".to_string()),
            message: "deadlock detected".to_string(),
            source: None,
        })
    }

    #[test]
    fn backend_error_is_passed_through() {
        let err = FlushError::from(deadlock());
        assert!(err.is_retryable());
        assert!(err.source().is_some());
        assert_eq!(err.backend_error().and_then(Error::sqlstate), Some("40P01"));

        let back: Error = err.into();
        assert!(matches!(back, Error::Query(_)));
    }

    #[test]
    fn cycle_failure_names_entities_and_relationships() {
        let err = FlushError::CycleResolutionFailure {
            entities: vec!["Node"],
            relationships: vec!["Node.next".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Node"));
        assert!(msg.contains("Node.next"));
        assert!(!err.is_retryable());
        assert!(err.source().is_none());

        let back: Error = err.into();
        assert!(matches!(back, Error::Custom(_)));
    }

    #[test]
    fn missing_primary_key_is_not_blamed_on_the_backend() {
        let err = FlushError::MissingPrimaryKey {
            entity: "Author",
            object: crate::ObjectRef::new("Author").id(),
        };
        assert!(err.backend_error().is_none());
        assert!(!err.is_retryable());
        assert!(err.to_string().ends_with("has no primary key to identify its row"));
    }

    #[test]
    fn unknown_entity_display() {
        let err = FlushError::UnknownEntity { entity: "Ghost" };
        assert_eq!(err.to_string(), "Entity 'Ghost' is not in the mapper graph");
    }
}
