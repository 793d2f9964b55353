//! Relationship change history.
//!
//! The scheduler never inspects relationship state directly. It asks a
//! [`ChangeTracker`] for the [`History`] of one relationship on one object and
//! derives cascades, ordering and foreign key values from the three lists.

use crate::object::ObjectRef;

/// Members of a relationship, split by how they changed since the last
/// load or flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    /// Newly related objects.
    pub added: Vec<ObjectRef>,
    /// Objects related before and still related.
    pub unchanged: Vec<ObjectRef>,
    /// Objects no longer related.
    pub removed: Vec<ObjectRef>,
}

impl History {
    /// Whether the relationship has no members at all, past or present.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.unchanged.is_empty() && self.removed.is_empty()
    }

    /// Whether members were added or removed.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Current members: unchanged followed by added.
    pub fn current(&self) -> Vec<ObjectRef> {
        self.unchanged
            .iter()
            .chain(&self.added)
            .cloned()
            .collect()
    }
}

/// Source of relationship history.
///
/// Implementations must reflect the current in-memory state, including
/// unflushed mutations, and return the same result for repeated calls when
/// nothing changed in between.
pub trait ChangeTracker {
    /// History of `relationship` on `object`.
    fn history(&self, object: &ObjectRef, relationship: &str) -> History;
}

/// Tracker that diffs each object's current related objects against the
/// snapshot taken at its last load or flush.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotTracker;

impl SnapshotTracker {
    /// Create a snapshot tracker.
    pub fn new() -> Self {
        Self
    }
}

impl ChangeTracker for SnapshotTracker {
    #[tracing::instrument(level = "trace", skip(self))]
    fn history(&self, object: &ObjectRef, relationship: &str) -> History {
        let current = object.related(relationship);
        let committed = object.committed_related(relationship);

        let mut history = History::default();
        for o in &current {
            if committed.contains(o) {
                history.unchanged.push(o.clone());
            } else {
                history.added.push(o.clone());
            }
        }
        history.removed = committed
            .into_iter()
            .filter(|o| !current.contains(o))
            .collect();

        tracing::trace!(
            added = history.added.len(),
            unchanged = history.unchanged.len(),
            removed = history.removed.len(),
            "Relationship history"
        );
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_history_splits_members() {
        let author = ObjectRef::new("Author");
        let kept = ObjectRef::new("Book");
        let dropped = ObjectRef::new("Book");
        let fresh = ObjectRef::new("Book");

        author.append_related("books", &kept);
        author.append_related("books", &dropped);
        author.commit();

        author.remove_related("books", &dropped);
        author.append_related("books", &fresh);

        let h = SnapshotTracker::new().history(&author, "books");
        assert_eq!(h.added, vec![fresh.clone()]);
        assert_eq!(h.unchanged, vec![kept.clone()]);
        assert_eq!(h.removed, vec![dropped]);
        assert!(h.has_changes());
        assert_eq!(h.current(), vec![kept, fresh]);
    }

    #[test]
    fn untouched_relationship_is_empty() {
        let author = ObjectRef::new("Author");
        let h = SnapshotTracker.history(&author, "books");
        assert!(h.is_empty());
        assert!(!h.has_changes());
    }

    #[test]
    fn history_is_idempotent() {
        let book = ObjectRef::new("Book");
        let author = ObjectRef::new("Author");
        book.set_related("author", Some(&author));

        let tracker = SnapshotTracker;
        assert_eq!(
            tracker.history(&book, "author"),
            tracker.history(&book, "author")
        );
    }
}
