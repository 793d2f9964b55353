//! Identity registry: the source of new, dirty and deleted objects.
//!
//! The registry tracks every object the application has added, loaded or
//! deleted, and maps primary-key identities to the unique in-memory object
//! representing that row. A flush reads the three pending sets from it and,
//! only after the transaction committed, reports back through
//! [`IdentityRegistry::mark_clean`] and [`IdentityRegistry::mark_removed`].
//!
//! # Example
//!
//! ```ignore
//! let mut registry = IdentityRegistry::new(graph);
//! registry.add(&author);
//! registry.delete(&old_book);
//!
//! assert_eq!(registry.pending_counts().total(), 2);
//! ```

use crate::object::{ObjectId, ObjectRef};
use sqlflush_core::{Error, MapperGraph, Result, Value};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Hash a slice of values for use as a primary key identifier.
pub fn hash_pk_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    for v in values {
        v.hash_into(&mut hasher);
    }
    hasher.finish()
}

/// Identity of a persistent row: the root entity of its hierarchy plus its
/// primary key.
///
/// Objects of different subtypes sharing a root share one key space. Keys
/// compare by value with [`Value::key_eq`]; the hash only picks the bucket.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: &'static str,
    pk: Vec<Value>,
}

impl IdentityKey {
    /// Build a key from a root entity name and primary key values.
    pub fn new(root_entity: &'static str, pk: &[Value]) -> Self {
        Self {
            entity: root_entity,
            pk: pk.to_vec(),
        }
    }

    /// Root entity of the key.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Primary key values, in primary key column order.
    pub fn primary_key(&self) -> &[Value] {
        &self.pk
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.pk.len() == other.pk.len()
            && self.pk.iter().zip(&other.pk).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        state.write_u64(hash_pk_values(&self.pk));
    }
}

/// Lifecycle state of an object relative to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Added and never flushed.
    New,
    /// Present in the database and tracked.
    Persistent,
    /// Marked for deletion, not yet flushed.
    Deleted,
    /// Not tracked: never added, expunged, or removed by a delete flush.
    Detached,
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

struct Tracked {
    object: ObjectRef,
    state: ObjectState,
}

/// Tracks objects and their identities for one session.
///
/// Only one flush may run against a registry at a time; the flush takes it
/// by `&mut` for exactly that reason.
pub struct IdentityRegistry {
    graph: Arc<MapperGraph>,
    tracked: BTreeMap<ObjectId, Tracked>,
    identities: HashMap<IdentityKey, ObjectRef>,
}

impl IdentityRegistry {
    /// Create an empty registry over a mapper graph.
    pub fn new(graph: Arc<MapperGraph>) -> Self {
        Self {
            graph,
            tracked: BTreeMap::new(),
            identities: HashMap::new(),
        }
    }

    /// The mapper graph objects of this registry are described by.
    pub fn graph(&self) -> &Arc<MapperGraph> {
        &self.graph
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Identity the object would have given its current primary key values.
    fn identity_for(&self, object: &ObjectRef) -> Option<IdentityKey> {
        let pk = object.primary_key(&self.graph)?;
        Some(IdentityKey::new(self.graph.root_of(object.entity()), &pk))
    }

    /// Track an object for saving.
    ///
    /// A transient object becomes `New`; an object that already carries an
    /// identity becomes `Persistent`. Adding a `Deleted` object cancels the
    /// deletion.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn add(&mut self, object: &ObjectRef) {
        if let Some(entry) = self.tracked.get_mut(&object.id()) {
            if entry.state == ObjectState::Deleted {
                entry.state = ObjectState::Persistent;
            }
            return;
        }
        let state = match object.identity() {
            Some(key) => {
                self.identities.insert(key, object.clone());
                ObjectState::Persistent
            }
            None => ObjectState::New,
        };
        self.tracked.insert(
            object.id(),
            Tracked {
                object: object.clone(),
                state,
            },
        );
    }

    /// Mark an object for deletion.
    ///
    /// Deleting a `New` object simply forgets it; nothing was written yet.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn delete(&mut self, object: &ObjectRef) {
        match self.tracked.get(&object.id()).map(|t| t.state) {
            Some(ObjectState::New) => {
                self.tracked.remove(&object.id());
            }
            Some(ObjectState::Persistent) => {
                if let Some(entry) = self.tracked.get_mut(&object.id()) {
                    entry.state = ObjectState::Deleted;
                }
            }
            Some(_) => {}
            None => {
                if let Some(key) = object.identity() {
                    self.identities.insert(key, object.clone());
                    self.tracked.insert(
                        object.id(),
                        Tracked {
                            object: object.clone(),
                            state: ObjectState::Deleted,
                        },
                    );
                }
            }
        }
    }

    /// Attach an object that already exists in the database.
    ///
    /// The object's current columns and relationships become its committed
    /// snapshot. Fails if the entity is unknown, a primary key column is
    /// unset, or another object already holds the identity.
    pub fn load(&mut self, object: &ObjectRef) -> Result<IdentityKey> {
        if !self.graph.contains(object.entity()) {
            return Err(Error::config(format!(
                "entity '{}' is not in the mapper graph",
                object.entity()
            )));
        }
        let key = self.identity_for(object).ok_or_else(|| {
            Error::Custom(format!(
                "cannot load {:?}: primary key is not fully set",
                object
            ))
        })?;
        if let Some(existing) = self.identities.get(&key) {
            if existing != object {
                return Err(Error::Custom(format!(
                    "cannot load {:?}: identity already held by {:?}",
                    object, existing
                )));
            }
        }

        object.commit();
        object.set_identity(Some(key.clone()));
        self.identities.insert(key.clone(), object.clone());
        self.tracked.insert(
            object.id(),
            Tracked {
                object: object.clone(),
                state: ObjectState::Persistent,
            },
        );
        tracing::trace!(object = ?object, pk = ?key.primary_key(), "Loaded object");
        Ok(key)
    }

    /// Stop tracking an object without deleting it.
    pub fn expunge(&mut self, object: &ObjectRef) {
        self.tracked.remove(&object.id());
        if let Some(key) = object.identity() {
            if self.identities.get(&key) == Some(object) {
                self.identities.remove(&key);
            }
        }
    }

    /// Look up the object holding an identity.
    pub fn get(&self, entity: &'static str, pk: &[Value]) -> Option<ObjectRef> {
        let key = IdentityKey::new(self.graph.root_of(entity), pk);
        self.identities.get(&key).cloned()
    }

    /// Whether the object is tracked.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.tracked.contains_key(&object.id())
    }

    /// Lifecycle state of an object.
    pub fn state(&self, object: &ObjectRef) -> ObjectState {
        self.tracked
            .get(&object.id())
            .map_or(ObjectState::Detached, |t| t.state)
    }

    fn objects_in(&self, state: ObjectState) -> impl Iterator<Item = &ObjectRef> {
        self.tracked
            .values()
            .filter(move |t| t.state == state)
            .map(|t| &t.object)
    }

    /// Objects pending INSERT, in creation order.
    pub fn new_objects(&self) -> Vec<ObjectRef> {
        self.objects_in(ObjectState::New).cloned().collect()
    }

    /// Persistent objects with a column or relationship delta, in creation
    /// order.
    pub fn dirty_objects(&self) -> Vec<ObjectRef> {
        self.objects_in(ObjectState::Persistent)
            .filter(|o| o.has_column_changes() || o.has_relationship_changes())
            .cloned()
            .collect()
    }

    /// Objects pending DELETE, in creation order.
    pub fn deleted_objects(&self) -> Vec<ObjectRef> {
        self.objects_in(ObjectState::Deleted).cloned().collect()
    }

    /// Record a successful write of `object`.
    ///
    /// Commits its snapshot, assigns its identity if it was just inserted, and
    /// tracks it as persistent (objects reached only through cascades become
    /// tracked here).
    pub fn mark_clean(&mut self, object: &ObjectRef) {
        object.commit();
        if let Some(key) = self.identity_for(object) {
            if let Some(old) = object.identity() {
                if old != key && self.identities.get(&old) == Some(object) {
                    self.identities.remove(&old);
                }
            }
            object.set_identity(Some(key.clone()));
            self.identities.insert(key, object.clone());
        }
        self.tracked
            .entry(object.id())
            .and_modify(|t| t.state = ObjectState::Persistent)
            .or_insert_with(|| Tracked {
                object: object.clone(),
                state: ObjectState::Persistent,
            });
    }

    /// Record a successful delete of `object`; it becomes detached.
    pub fn mark_removed(&mut self, object: &ObjectRef) {
        self.tracked.remove(&object.id());
        if let Some(key) = object.identity() {
            if self.identities.get(&key) == Some(object) {
                self.identities.remove(&key);
            }
        }
        object.set_identity(None);
    }

    /// Count of pending operations.
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.new_objects().len(),
            dirty: self.dirty_objects().len(),
            deleted: self.deleted_objects().len(),
        }
    }
}
