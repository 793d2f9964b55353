mod common;

use common::{Call, RecordingBackend, RecordingTransaction, big, blog, family, registry, text};
use sqlflush_core::Value;
use sqlflush_session::{Disposition, FlushError, ObjectRef, ObjectState, SnapshotTracker, UnitOfWork};

fn flush_ok(registry: &mut sqlflush_session::IdentityRegistry) -> RecordingBackend {
    let mut backend = RecordingBackend::new();
    UnitOfWork::new()
        .flush(
            registry,
            &SnapshotTracker,
            &mut backend,
            &mut RecordingTransaction::default(),
        )
        .unwrap();
    backend
}

#[test]
fn post_update_reference_is_written_last() {
    let mut registry = registry(blog());
    let user = ObjectRef::with_values("User", [("name", "u")]);
    let post = ObjectRef::with_values("Post", [("title", "p")]);
    user.append_related("posts", &post);
    user.set_related("favorite_post", Some(&post));
    registry.add(&user);

    let backend = flush_ok(&mut registry);
    assert_eq!(
        backend.calls,
        vec![
            Call::Insert {
                table: "users",
                rows: vec![vec![("name", text("u")), ("favorite_post_id", Value::Null)]],
            },
            Call::Insert {
                table: "posts",
                rows: vec![vec![("title", text("p")), ("user_id", big(1))]],
            },
            Call::Update {
                table: "users",
                rows: vec![(vec![big(1)], vec![("favorite_post_id", big(1))])],
            },
        ]
    );
    assert_eq!(user.get("favorite_post_id"), Some(big(1)));
}

#[test]
fn post_update_reference_is_cleared_before_delete() {
    let mut registry = registry(blog());
    let user = ObjectRef::with_values("User", [("name", "u")]);
    let post = ObjectRef::with_values("Post", [("title", "p")]);
    user.append_related("posts", &post);
    user.set_related("favorite_post", Some(&post));
    registry.add(&user);
    flush_ok(&mut registry);

    registry.delete(&user);
    let mut backend = RecordingBackend::new();
    let report = UnitOfWork::new()
        .flush(
            &mut registry,
            &SnapshotTracker,
            &mut backend,
            &mut RecordingTransaction::default(),
        )
        .unwrap();

    assert_eq!(
        backend.calls,
        vec![
            Call::Update {
                table: "users",
                rows: vec![(vec![big(1)], vec![("favorite_post_id", Value::Null)])],
            },
            Call::Delete {
                table: "posts",
                keys: vec![vec![big(1)]],
            },
            Call::Delete {
                table: "users",
                keys: vec![vec![big(1)]],
            },
        ]
    );
    assert_eq!(report.post_updates, 1);
    assert_eq!(report.deleted(), 2);
    assert_eq!(registry.state(&post), ObjectState::Detached);
}

#[test]
fn orphaned_child_is_deleted() {
    let mut registry = registry(family());
    let parent = ObjectRef::with_values("Parent", [("id", big(1)), ("name", text("p"))]);
    let child = ObjectRef::with_values("Child", [("id", big(1)), ("parent_id", big(1))]);
    parent.append_related("children", &child);
    registry.load(&parent).unwrap();
    registry.load(&child).unwrap();

    parent.remove_related("children", &child);
    let plan = UnitOfWork::new().plan(&registry, &SnapshotTracker).unwrap();
    assert_eq!(
        plan.element(&child).map(|e| e.disposition()),
        Some(Disposition::OrphanDelete)
    );

    let backend = flush_ok(&mut registry);
    assert_eq!(
        backend.calls,
        vec![Call::Delete {
            table: "children",
            keys: vec![vec![big(1)]],
        }]
    );
    assert_eq!(registry.state(&child), ObjectState::Detached);
    assert_eq!(registry.state(&parent), ObjectState::Persistent);
}

#[test]
fn reattached_orphan_is_saved() {
    let mut registry = registry(family());
    let old = ObjectRef::with_values("Parent", [("id", big(1)), ("name", text("old"))]);
    let new = ObjectRef::with_values("Parent", [("id", big(2)), ("name", text("new"))]);
    let child = ObjectRef::with_values("Child", [("id", big(5)), ("parent_id", big(1))]);
    old.append_related("children", &child);
    for object in [&old, &new, &child] {
        registry.load(object).unwrap();
    }

    old.remove_related("children", &child);
    new.append_related("children", &child);
    let backend = flush_ok(&mut registry);

    assert_eq!(
        backend.calls,
        vec![Call::Update {
            table: "children",
            rows: vec![(vec![big(5)], vec![("parent_id", big(2))])],
        }]
    );
    assert_eq!(registry.state(&child), ObjectState::Persistent);
}

#[test]
fn delete_cascades_to_children() {
    let mut registry = registry(family());
    let parent = ObjectRef::with_values("Parent", [("id", big(1)), ("name", text("p"))]);
    let c1 = ObjectRef::with_values("Child", [("id", big(1)), ("parent_id", big(1))]);
    let c2 = ObjectRef::with_values("Child", [("id", big(2)), ("parent_id", big(1))]);
    parent.append_related("children", &c1);
    parent.append_related("children", &c2);
    for object in [&parent, &c1, &c2] {
        registry.load(object).unwrap();
    }

    registry.delete(&parent);
    let backend = flush_ok(&mut registry);
    assert_eq!(
        backend.calls,
        vec![
            Call::Delete {
                table: "children",
                keys: vec![vec![big(1)], vec![big(2)]],
            },
            Call::Delete {
                table: "parents",
                keys: vec![vec![big(1)]],
            },
        ]
    );
}

#[test]
fn attaching_an_explicitly_deleted_object_conflicts() {
    let mut registry = registry(family());
    let child = ObjectRef::with_values("Child", [("id", big(9)), ("name", text("c"))]);
    registry.load(&child).unwrap();
    registry.delete(&child);

    let parent = ObjectRef::with_values("Parent", [("name", "p")]);
    parent.append_related("children", &child);
    registry.add(&parent);

    let mut backend = RecordingBackend::new();
    let mut tx = RecordingTransaction::default();
    let err = UnitOfWork::new()
        .flush(&mut registry, &SnapshotTracker, &mut backend, &mut tx)
        .unwrap_err();

    assert!(matches!(
        err,
        FlushError::ConflictingDisposition {
            entity: "Child",
            existing: Disposition::Delete,
            requested: Disposition::Attach,
            ..
        }
    ));
    assert!(backend.calls.is_empty());
    assert_eq!(tx.rollbacks, 1);
    assert_eq!(tx.commits, 0);
    assert_eq!(registry.state(&child), ObjectState::Deleted);
    assert_eq!(registry.state(&parent), ObjectState::New);
}
