//! Persistence and transaction contracts.
//!
//! The scheduler never builds SQL. It hands batches of rows for one table to a
//! [`PersistenceBackend`] and finishes the unit through a [`Transaction`].
//! Calls are issued strictly in execution order and never with an empty
//! batch, so an implementation may turn each call into one multi-row
//! statement.

use sqlflush_core::{LinkTableInfo, Mapper, Result, TransactionError, Value};

/// Column values of one row, in table column order.
pub type ColumnValues = Vec<(&'static str, Value)>;

/// Primary key values of one row, in primary key column order.
pub type PrimaryKey = Vec<Value>;

/// Statement execution for one flush.
pub trait PersistenceBackend {
    /// Insert rows into `mapper.table`.
    ///
    /// Returns one key per row, in input order. A row whose key was supplied
    /// by the caller may get an empty key back.
    fn insert(&mut self, mapper: &Mapper, rows: &[ColumnValues]) -> Result<Vec<PrimaryKey>>;

    /// Update rows of `mapper.table`, each identified by its primary key.
    ///
    /// Returns the number of rows each update matched.
    fn update(&mut self, mapper: &Mapper, rows: &[(PrimaryKey, ColumnValues)]) -> Result<Vec<u64>>;

    /// Delete rows of `mapper.table` by primary key.
    ///
    /// Returns the number of rows each delete matched.
    fn delete(&mut self, mapper: &Mapper, keys: &[PrimaryKey]) -> Result<Vec<u64>>;

    /// Insert association rows into a link table.
    fn insert_links(&mut self, link: &LinkTableInfo, rows: &[ColumnValues]) -> Result<()>;

    /// Delete association rows from a link table.
    fn delete_links(&mut self, link: &LinkTableInfo, rows: &[ColumnValues]) -> Result<()>;
}

/// The transaction a flush runs in.
pub trait Transaction {
    /// Make every statement of the flush durable.
    fn commit(&mut self) -> Result<()>;

    /// Discard every statement of the flush.
    fn rollback(&mut self);
}

/// Releases a transaction exactly once.
///
/// The guard is created before anything else in a flush. Finishing it with
/// [`commit`](Self::commit) or [`rollback`](Self::rollback) consumes it;
/// dropping it unfinished (early return or panic) rolls back.
pub struct TransactionGuard<'t> {
    tx: &'t mut dyn Transaction,
    finished: bool,
}

impl<'t> TransactionGuard<'t> {
    /// Take responsibility for releasing `tx`.
    pub fn new(tx: &'t mut dyn Transaction) -> Self {
        Self {
            tx,
            finished: false,
        }
    }

    /// Commit; a failed commit is rolled back and reported as
    /// [`TransactionErrorKind::CommitFailed`](sqlflush_core::TransactionErrorKind::CommitFailed).
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.tx.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Commit failed; rolling back");
                self.tx.rollback();
                Err(TransactionError::commit_failed(e).into())
            }
        }
    }

    /// Roll back.
    pub fn rollback(mut self) {
        self.finished = true;
        self.tx.rollback();
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Transaction released without commit; rolling back");
            self.tx.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlflush_core::{Error, TransactionErrorKind};

    #[derive(Default)]
    struct CountingTx {
        commits: usize,
        rollbacks: usize,
        fail_commit: bool,
    }

    impl Transaction for CountingTx {
        fn commit(&mut self) -> Result<()> {
            self.commits += 1;
            if self.fail_commit {
                Err(Error::Custom("commit refused".to_string()))
            } else {
                Ok(())
            }
        }

        fn rollback(&mut self) {
            self.rollbacks += 1;
        }
    }

    #[test]
    fn commit_releases_once() {
        let mut tx = CountingTx::default();
        TransactionGuard::new(&mut tx).commit().unwrap();
        assert_eq!((tx.commits, tx.rollbacks), (1, 0));
    }

    #[test]
    fn failed_commit_rolls_back_once() {
        let mut tx = CountingTx {
            fail_commit: true,
            ..CountingTx::default()
        };
        let err = TransactionGuard::new(&mut tx).commit().unwrap_err();
        assert_eq!((tx.commits, tx.rollbacks), (1, 1));
        match err {
            Error::Transaction(t) => {
                assert_eq!(t.kind, TransactionErrorKind::CommitFailed);
                assert!(matches!(t.cause(), Some(Error::Custom(msg)) if msg == "commit refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_rollback_is_not_repeated_on_drop() {
        let mut tx = CountingTx::default();
        TransactionGuard::new(&mut tx).rollback();
        assert_eq!(tx.rollbacks, 1);
    }

    #[test]
    fn drop_without_finish_rolls_back() {
        let mut tx = CountingTx::default();
        {
            let _guard = TransactionGuard::new(&mut tx);
        }
        assert_eq!((tx.commits, tx.rollbacks), (0, 1));
    }

    #[test]
    fn panic_inside_guard_rolls_back() {
        let mut tx = CountingTx::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = TransactionGuard::new(&mut tx);
            panic!("walk failed");
        }));
        assert!(result.is_err());
        assert_eq!(tx.rollbacks, 1);
    }
}
