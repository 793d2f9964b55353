mod common;

use common::{Call, RecordingBackend, RecordingTransaction, big, library, registry, text};
use sqlflush_core::{Error, TransactionErrorKind};
use sqlflush_session::{FlushConfig, FlushError, ObjectRef, ObjectState, SnapshotTracker, UnitOfWork};

fn author_with_book() -> (ObjectRef, ObjectRef) {
    let author = ObjectRef::with_values("Author", [("name", "X")]);
    let book = ObjectRef::with_values("Book", [("title", "Y")]);
    author.append_related("books", &book);
    (author, book)
}

#[test]
fn failed_statement_rolls_back_and_restores_objects() {
    let mut registry = registry(library());
    let (author, book) = author_with_book();
    registry.add(&author);

    let mut backend = RecordingBackend::failing_on(2);
    let mut tx = RecordingTransaction::default();
    let err = UnitOfWork::new()
        .flush(&mut registry, &SnapshotTracker, &mut backend, &mut tx)
        .unwrap_err();

    assert!(matches!(err, FlushError::Backend(Error::Custom(_))));
    assert_eq!(backend.calls.len(), 2);
    assert_eq!(tx.rollbacks, 1);
    assert_eq!(tx.commits, 0);

    assert_eq!(registry.state(&author), ObjectState::New);
    assert_eq!(registry.state(&book), ObjectState::Detached);
    assert_eq!(author.get("id"), None);
    assert_eq!(book.get("author_id"), None);
    assert!(author.identity().is_none());
}

#[test]
fn flush_can_be_retried_after_rollback() {
    let mut registry = registry(library());
    let (author, book) = author_with_book();
    registry.add(&author);
    let uow = UnitOfWork::new();

    let mut failing = RecordingBackend::failing_on(2);
    assert!(
        uow.flush(
            &mut registry,
            &SnapshotTracker,
            &mut failing,
            &mut RecordingTransaction::default(),
        )
        .is_err()
    );

    let mut backend = RecordingBackend::new();
    let report = uow
        .flush(
            &mut registry,
            &SnapshotTracker,
            &mut backend,
            &mut RecordingTransaction::default(),
        )
        .unwrap();
    assert_eq!(report.inserted(), 2);
    assert_eq!(
        backend.calls[1],
        Call::Insert {
            table: "books",
            rows: vec![vec![("title", text("Y")), ("author_id", big(1))]],
        }
    );
    assert_eq!(registry.state(&book), ObjectState::Persistent);
}

#[test]
fn unmatched_update_is_stale_data() {
    let mut registry = registry(library());
    let author = ObjectRef::with_values("Author", [("id", big(4)), ("name", text("X"))]);
    registry.load(&author).unwrap();
    author.set("name", "Z");

    let mut backend = RecordingBackend::matching(0);
    let mut tx = RecordingTransaction::default();
    let err = UnitOfWork::new()
        .flush(&mut registry, &SnapshotTracker, &mut backend, &mut tx)
        .unwrap_err();

    match err {
        FlushError::Backend(Error::StaleData(stale)) => {
            assert_eq!(stale.table, "authors");
            assert_eq!(stale.expected, 1);
            assert_eq!(stale.actual, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tx.rollbacks, 1);
    assert_eq!(author.get("name"), Some(text("Z")));
    assert!(author.has_column_changes());
}

#[test]
fn row_count_check_can_be_disabled() {
    let mut registry = registry(library());
    let author = ObjectRef::with_values("Author", [("id", big(4)), ("name", text("X"))]);
    registry.load(&author).unwrap();
    author.set("name", "Z");

    let uow = UnitOfWork::with_config(FlushConfig::default().check_row_counts(false));
    let mut tx = RecordingTransaction::default();
    uow.flush(
        &mut registry,
        &SnapshotTracker,
        &mut RecordingBackend::matching(0),
        &mut tx,
    )
    .unwrap();
    assert_eq!(tx.commits, 1);
}

#[test]
fn failed_commit_restores_objects() {
    let mut registry = registry(library());
    let (author, _) = author_with_book();
    registry.add(&author);

    let mut tx = RecordingTransaction {
        fail_commit: true,
        ..RecordingTransaction::default()
    };
    let err = UnitOfWork::new()
        .flush(
            &mut registry,
            &SnapshotTracker,
            &mut RecordingBackend::new(),
            &mut tx,
        )
        .unwrap_err();

    match err.backend_error() {
        Some(Error::Transaction(t)) => assert_eq!(t.kind, TransactionErrorKind::CommitFailed),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(tx.rollbacks, 1);
    assert_eq!(author.get("id"), None);
    assert_eq!(registry.state(&author), ObjectState::New);
}

#[test]
fn discovery_bound_is_enforced() {
    let mut registry = registry(library());
    let (author, _) = author_with_book();
    registry.add(&author);

    let uow = UnitOfWork::with_config(FlushConfig::default().max_discovery_passes(1));
    let mut tx = RecordingTransaction::default();
    let err = uow
        .flush(
            &mut registry,
            &SnapshotTracker,
            &mut RecordingBackend::new(),
            &mut tx,
        )
        .unwrap_err();

    assert!(matches!(err, FlushError::DiscoveryLimitExceeded { passes: 1 }));
    assert_eq!(tx.rollbacks, 1);
}

#[test]
fn insert_without_generated_key_is_reported_as_missing_key() {
    let mut registry = registry(library());
    let (author, _) = author_with_book();
    registry.add(&author);

    let mut backend = RecordingBackend::keyless();
    let mut tx = RecordingTransaction::default();
    let err = UnitOfWork::new()
        .flush(&mut registry, &SnapshotTracker, &mut backend, &mut tx)
        .unwrap_err();

    match &err {
        FlushError::MissingPrimaryKey { entity, object } => {
            assert_eq!(*entity, "Author");
            assert_eq!(*object, author.id());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.backend_error().is_none());
    assert!(!err.is_retryable());
    assert_eq!(backend.calls.len(), 1);
    assert_eq!(tx.rollbacks, 1);
    assert_eq!(registry.state(&author), ObjectState::New);
}
