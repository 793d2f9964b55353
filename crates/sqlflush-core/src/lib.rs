//! Core types for sqlflush.
//!
//! This crate provides the static configuration and value types that every
//! flush shares:
//!
//! - `Value` for dynamically-typed column values and primary keys
//! - `Error` for backend, transaction and configuration failures
//! - `FieldInfo` and `RelationshipInfo` column/relationship metadata
//! - `Mapper` and `MapperGraph` describing entity types and inheritance

pub mod error;
pub mod field;
pub mod mapper;
pub mod relationship;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    StaleDataError, TransactionError, TransactionErrorKind,
};
pub use field::FieldInfo;
pub use mapper::{Mapper, MapperGraph, MapperGraphBuilder};
pub use relationship::{Cascade, LinkTableInfo, RelationshipInfo, RelationshipKind};
pub use value::Value;
