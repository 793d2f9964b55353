//! Unit-of-work flush scheduling for sqlflush.
//!
//! `sqlflush-session` decides **in which order** the pending changes of a
//! session reach the database, and runs them atomically.
//!
//! # Role In The Architecture
//!
//! - **Identity registry**: one in-memory object per primary key, with its
//!   lifecycle state (new, persistent, deleted).
//! - **Change tracking**: relationship history (added, unchanged, removed)
//!   against the snapshot of the last load or flush.
//! - **Scheduling**: tasks per entity type, dependency processors per
//!   relationship, topological sort with row-level cycle breaking.
//! - **Execution**: batched calls into a [`PersistenceBackend`] inside one
//!   [`Transaction`], rolled back on any failure.
//!
//! # Example
//!
//! ```ignore
//! let graph = Arc::new(MapperGraph::builder().mapper(authors).mapper(books).build()?);
//! let mut registry = IdentityRegistry::new(Arc::clone(&graph));
//!
//! let author = ObjectRef::with_values("Author", [("name", "Ursula")]);
//! let book = ObjectRef::with_values("Book", [("title", "The Dispossessed")]);
//! book.set_related("author", Some(&author));
//! registry.add(&book);
//!
//! // authors row first, then books with author_id copied over
//! let report = UnitOfWork::new().flush(&mut registry, &SnapshotTracker, &mut backend, &mut tx)?;
//! ```

pub mod backend;
pub mod change_tracker;
mod cycles;
pub mod dependency;
pub mod error;
pub mod flush;
pub mod identity_map;
pub mod object;
pub mod task;
pub mod topological;
pub mod unit_of_work;

pub use backend::{ColumnValues, PersistenceBackend, PrimaryKey, Transaction, TransactionGuard};
pub use change_tracker::{ChangeTracker, History, SnapshotTracker};
pub use dependency::{DependencyProcessor, ProcessorId};
pub use error::FlushError;
pub use flush::{EntityCounts, ExecutionPlan, FlushReport};
pub use identity_map::{IdentityKey, IdentityRegistry, ObjectState, PendingCounts};
pub use object::{ColumnMap, ObjectId, ObjectRef};
pub use task::{Disposition, Task, TaskElement, TaskId, TaskKey, TaskKind};
pub use topological::{Component, SortResult, TopologicalSorter};
pub use unit_of_work::{FlushConfig, UnitOfWork};
