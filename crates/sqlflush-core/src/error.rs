//! Error types shared by backends, transactions and mapper configuration.

use std::fmt;

/// The error type returned by persistence backends, transactions and
/// mapper-graph validation.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors
    Query(QueryError),
    /// Transaction errors
    Transaction(TransactionError),
    /// A row count did not match the number of rows a write expected to touch
    StaleData(StaleDataError),
    /// Invalid mapper graph or flush configuration
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The commit itself failed; the transaction was rolled back
    CommitFailed,
}

impl TransactionError {
    /// Wrap the error a failed commit returned.
    pub fn commit_failed(cause: Error) -> Self {
        Self {
            kind: TransactionErrorKind::CommitFailed,
            message: format!("commit failed: {}", cause),
            source: Some(Box::new(cause)),
        }
    }

    /// The backend error that caused this failure, if it was one.
    pub fn cause(&self) -> Option<&Error> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<Error>())
    }
}

/// An UPDATE or DELETE matched a different number of rows than expected.
#[derive(Debug, Clone)]
pub struct StaleDataError {
    /// Table the statement ran against
    pub table: String,
    /// Rows the flush expected to touch
    pub expected: u64,
    /// Rows the backend reported
    pub actual: u64,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConfigError {
    /// Create a configuration error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Shorthand for an [`Error::Config`] built from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError::new(message))
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    ///
    /// A failed commit is retryable when its cause is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Transaction(t) => t.cause().is_some_and(Error::is_retryable),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Refused
            ),
            Error::Transaction(t) => t.cause().is_some_and(Error::is_connection_error),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::StaleData(e) => write!(f, "Stale data: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StaleDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table '{}' expected {} row(s) to match, {} matched",
            self.table, self.expected, self.actual
        )
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<StaleDataError> for Error {
    fn from(err: StaleDataError) -> Self {
        Error::StaleData(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for flush and backend operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO books".to_string()),
            sqlstate: Some("23503".to_string()),
            message: "foreign key violation".to_string(),
            source: None,
        };

        assert!(query.is_foreign_key_violation());
        assert!(!query.is_unique_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23503"));
        assert_eq!(err.sql(), Some("INSERT INTO books"));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: None,
            sqlstate: None,
            message: "deadlock detected".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());
        assert!(!deadlock.is_connection_error());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        });
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
    }

    #[test]
    fn commit_failure_keeps_its_cause() {
        let serialization = Error::Query(QueryError {
            kind: QueryErrorKind::Serialization,
            sql: None,
            sqlstate: Some("40001".to_string()),
            message: "could not serialize access".to_string(),
            source: None,
        });
        let err = Error::from(TransactionError::commit_failed(serialization));

        match &err {
            Error::Transaction(t) => {
                assert_eq!(t.kind, TransactionErrorKind::CommitFailed);
                assert_eq!(t.cause().and_then(Error::sqlstate), Some("40001"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("Transaction error: commit failed"));

        let refused = Error::from(TransactionError::commit_failed(Error::Custom("no".into())));
        assert!(!refused.is_retryable());
    }

    #[test]
    fn stale_data_display() {
        let err = Error::from(StaleDataError {
            table: "books".to_string(),
            expected: 1,
            actual: 0,
        });
        assert_eq!(
            err.to_string(),
            "Stale data: table 'books' expected 1 row(s) to match, 0 matched"
        );
    }
}
