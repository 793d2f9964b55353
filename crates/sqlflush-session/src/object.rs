//! Persistent objects.
//!
//! An [`ObjectRef`] is a shared handle to one in-memory row: the application,
//! the identity registry and every related object hold clones of the same
//! handle. Each handle keeps two views of its state:
//!
//! - the **current** column values and related objects, mutated freely by the
//!   application and by foreign-key synchronization during a flush
//! - the **committed** snapshot, taken on load and after every successful
//!   flush, which change tracking diffs against
//!
//! Locks are held only for the duration of a single accessor call; no method
//! takes one object's lock while holding another's.

use crate::identity_map::IdentityKey;
use sqlflush_core::{MapperGraph, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique object identifier, assigned at creation.
///
/// Ordering follows creation order and is used as the deterministic
/// tie-breaker everywhere a flush iterates objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Column name to value map of one object.
pub type ColumnMap = BTreeMap<&'static str, Value>;

#[derive(Default)]
struct RelatedState {
    current: Vec<ObjectRef>,
    committed: Vec<ObjectRef>,
}

#[derive(Default)]
struct ObjectData {
    values: ColumnMap,
    committed: ColumnMap,
    related: BTreeMap<&'static str, RelatedState>,
    identity: Option<IdentityKey>,
}

/// Shared handle to a persistent object.
///
/// Equality and hashing use the [`ObjectId`]; two handles are equal exactly
/// when they point at the same object.
#[derive(Clone)]
pub struct ObjectRef {
    id: ObjectId,
    entity: &'static str,
    inner: Arc<RwLock<ObjectData>>,
}

impl ObjectRef {
    /// Create a transient object of the given concrete entity type.
    pub fn new(entity: &'static str) -> Self {
        Self {
            id: ObjectId::next(),
            entity,
            inner: Arc::new(RwLock::new(ObjectData::default())),
        }
    }

    /// Create a transient object with initial column values.
    pub fn with_values<I, V>(entity: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        let obj = Self::new(entity);
        {
            let mut data = obj.inner.write().expect("lock poisoned");
            for (column, value) in values {
                data.values.insert(column, value.into());
            }
        }
        obj
    }

    /// The object's identifier.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The object's concrete entity type.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Current value of a column, if set.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("lock poisoned")
            .values
            .get(column)
            .cloned()
    }

    /// Set a column value.
    pub fn set(&self, column: &'static str, value: impl Into<Value>) {
        self.inner
            .write()
            .expect("lock poisoned")
            .values
            .insert(column, value.into());
    }

    /// Copy of all current column values.
    pub fn values(&self) -> ColumnMap {
        self.inner.read().expect("lock poisoned").values.clone()
    }

    /// Copy of the column values as of the last load or flush.
    pub fn committed_values(&self) -> ColumnMap {
        self.inner.read().expect("lock poisoned").committed.clone()
    }

    /// Replace all current column values.
    pub(crate) fn restore_values(&self, values: ColumnMap) {
        self.inner.write().expect("lock poisoned").values = values;
    }

    /// Point a scalar relationship at `target`, or clear it with `None`.
    pub fn set_related(&self, relationship: &'static str, target: Option<&ObjectRef>) {
        let mut data = self.inner.write().expect("lock poisoned");
        let state = data.related.entry(relationship).or_default();
        state.current = target.into_iter().cloned().collect();
    }

    /// Add `target` to a collection relationship.
    ///
    /// Appending an object that is already in the collection does nothing.
    pub fn append_related(&self, relationship: &'static str, target: &ObjectRef) {
        let mut data = self.inner.write().expect("lock poisoned");
        let state = data.related.entry(relationship).or_default();
        if !state.current.contains(target) {
            state.current.push(target.clone());
        }
    }

    /// Remove `target` from a relationship.
    pub fn remove_related(&self, relationship: &'static str, target: &ObjectRef) {
        let mut data = self.inner.write().expect("lock poisoned");
        if let Some(state) = data.related.get_mut(relationship) {
            state.current.retain(|o| o != target);
        }
    }

    /// Objects currently related through `relationship`.
    pub fn related(&self, relationship: &str) -> Vec<ObjectRef> {
        self.inner
            .read()
            .expect("lock poisoned")
            .related
            .get(relationship)
            .map(|s| s.current.clone())
            .unwrap_or_default()
    }

    /// Objects related through `relationship` as of the last load or flush.
    pub fn committed_related(&self, relationship: &str) -> Vec<ObjectRef> {
        self.inner
            .read()
            .expect("lock poisoned")
            .related
            .get(relationship)
            .map(|s| s.committed.clone())
            .unwrap_or_default()
    }

    /// Current primary key values, `None` while any key column is unset.
    pub fn primary_key(&self, graph: &MapperGraph) -> Option<Vec<Value>> {
        let columns = graph.primary_key(self.entity);
        if columns.is_empty() {
            return None;
        }
        let data = self.inner.read().expect("lock poisoned");
        columns
            .iter()
            .map(|col| data.values.get(col).filter(|v| !v.is_null()).cloned())
            .collect()
    }

    /// Whether any column differs from the committed snapshot.
    pub fn has_column_changes(&self) -> bool {
        !self.changed_columns().is_empty()
    }

    /// Columns whose current value differs from the committed snapshot.
    pub fn changed_columns(&self) -> Vec<&'static str> {
        let data = self.inner.read().expect("lock poisoned");
        data.values
            .iter()
            .filter(|(column, value)| {
                data.committed
                    .get(*column)
                    .is_none_or(|old| !old.key_eq(value))
            })
            .map(|(column, _)| *column)
            .collect()
    }

    /// Whether any relationship gained or lost members since the snapshot.
    pub fn has_relationship_changes(&self) -> bool {
        let data = self.inner.read().expect("lock poisoned");
        data.related.values().any(|state| {
            state.current.len() != state.committed.len()
                || state.current.iter().any(|o| !state.committed.contains(o))
        })
    }

    /// Take the current state as the new committed snapshot.
    pub(crate) fn commit(&self) {
        let mut data = self.inner.write().expect("lock poisoned");
        data.committed = data.values.clone();
        for state in data.related.values_mut() {
            state.committed = state.current.clone();
        }
    }

    /// The identity key, once the object is persistent.
    pub fn identity(&self) -> Option<IdentityKey> {
        self.inner.read().expect("lock poisoned").identity.clone()
    }

    pub(crate) fn set_identity(&self, identity: Option<IdentityKey>) {
        self.inner.write().expect("lock poisoned").identity = identity;
    }

    /// Whether the object has never been written to the database.
    pub fn is_pending(&self) -> bool {
        self.inner.read().expect("lock poisoned").identity.is_none()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.entity, self.id)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_creation_order() {
        let a = ObjectRef::new("Author");
        let b = ObjectRef::new("Author");
        assert!(a.id() < b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn column_changes_are_diffed_against_commit() {
        let a = ObjectRef::with_values("Author", [("name", "X")]);
        assert_eq!(a.changed_columns(), vec!["name"]);

        a.commit();
        assert!(!a.has_column_changes());

        a.set("name", "Y");
        assert_eq!(a.changed_columns(), vec!["name"]);
        assert_eq!(a.committed_values().get("name"), Some(&Value::from("X")));
    }

    #[test]
    fn int_and_bigint_compare_as_keys() {
        let a = ObjectRef::with_values("Author", [("id", Value::Int(7))]);
        a.commit();
        a.set("id", Value::BigInt(7));
        assert!(!a.has_column_changes());
    }

    #[test]
    fn relationship_changes() {
        let author = ObjectRef::new("Author");
        let book = ObjectRef::new("Book");

        author.append_related("books", &book);
        author.append_related("books", &book);
        assert_eq!(author.related("books").len(), 1);
        assert!(author.has_relationship_changes());

        author.commit();
        assert!(!author.has_relationship_changes());
        assert_eq!(author.committed_related("books"), vec![book.clone()]);

        author.remove_related("books", &book);
        assert!(author.has_relationship_changes());
        assert!(author.related("books").is_empty());
    }

    #[test]
    fn scalar_relationship_replaces_target() {
        let book = ObjectRef::new("Book");
        let a1 = ObjectRef::new("Author");
        let a2 = ObjectRef::new("Author");

        book.set_related("author", Some(&a1));
        book.set_related("author", Some(&a2));
        assert_eq!(book.related("author"), vec![a2]);

        book.set_related("author", None);
        assert!(book.related("author").is_empty());
    }

    #[test]
    fn debug_is_entity_and_id() {
        let a = ObjectRef::new("Author");
        assert_eq!(format!("{:?}", a), format!("Author#{}", a.id().get()));
    }
}
