//! Tasks and task elements.
//!
//! A [`Task`] collects the objects of one entity type that take part in a
//! flush. Besides entity tasks there are three synthetic kinds:
//!
//! - **association** tasks, which own no objects and host the processor that
//!   writes many-to-many link rows
//! - **circular** tasks, the row-level replacement for a set of entity tasks
//!   whose task-level order is cyclic
//! - **row** tasks, one per object inside a circular task

use crate::dependency::ProcessorId;
use crate::object::{ObjectId, ObjectRef};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Position of a task in its flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

/// What a task stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// All objects of one entity type.
    Entity(&'static str),
    /// Link rows of one many-to-many relationship.
    Association {
        /// Entity declaring the relationship.
        owner: &'static str,
        /// Relationship name.
        relationship: &'static str,
    },
    /// Row-level replacement of a cycle, keyed by its representative task.
    Circular(TaskId),
    /// One object inside a circular task.
    Row(ObjectId),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Entity(entity) => f.write_str(entity),
            TaskKey::Association {
                owner,
                relationship,
            } => write!(f, "{}.{} (association)", owner, relationship),
            TaskKey::Circular(of) => write!(f, "circular of task {}", of.0),
            TaskKey::Row(id) => write!(f, "row {}", id),
        }
    }
}

/// Kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Objects of one entity type.
    Entity,
    /// Link rows of a many-to-many relationship.
    Association,
    /// Row-level schedule of a cycle.
    Circular,
    /// One row of a circular schedule.
    Row,
}

/// The intent with which an object is registered into a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Only needed for ordering; never written.
    ListOnly,
    /// Insert or update.
    Save,
    /// Save, because the object was newly attached to a parent and its foreign
    /// key must be written.
    Attach,
    /// Delete, explicitly or through a delete cascade.
    Delete,
    /// Delete because the object was removed from a delete-orphan collection.
    OrphanDelete,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::ListOnly => "list-only",
            Disposition::Save => "save",
            Disposition::Attach => "attach",
            Disposition::Delete => "delete",
            Disposition::OrphanDelete => "orphan delete",
        };
        f.write_str(s)
    }
}

/// Outcome of registering an object into a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The element already satisfied the intent.
    Unchanged,
    /// A new element was created.
    Added,
    /// An existing element's `listonly` or `isdelete` flag changed.
    Flipped,
}

/// One object inside a task.
#[derive(Debug, Clone)]
pub struct TaskElement {
    object: ObjectRef,
    listonly: bool,
    isdelete: bool,
    attached: bool,
    orphan: bool,
}

impl TaskElement {
    fn new(object: ObjectRef, disposition: Disposition) -> Self {
        let mut element = Self {
            object,
            listonly: false,
            isdelete: false,
            attached: false,
            orphan: false,
        };
        match disposition {
            Disposition::ListOnly => element.listonly = true,
            Disposition::Save => {}
            Disposition::Attach => element.attached = true,
            Disposition::Delete => element.isdelete = true,
            Disposition::OrphanDelete => {
                element.isdelete = true;
                element.orphan = true;
            }
        }
        element
    }

    /// The object.
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Whether the element only shapes the dependency graph.
    pub fn is_listonly(&self) -> bool {
        self.listonly
    }

    /// Whether the object is to be deleted.
    pub fn is_delete(&self) -> bool {
        self.isdelete
    }

    /// Whether the object is written (saved) this flush.
    pub fn is_save(&self) -> bool {
        !self.listonly && !self.isdelete
    }

    /// The strongest intent recorded on this element.
    pub fn disposition(&self) -> Disposition {
        if self.isdelete {
            if self.orphan {
                Disposition::OrphanDelete
            } else {
                Disposition::Delete
            }
        } else if self.attached {
            Disposition::Attach
        } else if self.listonly {
            Disposition::ListOnly
        } else {
            Disposition::Save
        }
    }

    /// Reconcile a new intent with this element.
    ///
    /// Returns the existing disposition when the two cannot be reconciled.
    fn merge(&mut self, requested: Disposition) -> Result<Registration, Disposition> {
        let before = (self.listonly, self.isdelete);
        match requested {
            Disposition::ListOnly => {}
            Disposition::Save => {
                if !self.isdelete {
                    self.listonly = false;
                }
            }
            Disposition::Attach => {
                if self.isdelete && !self.orphan {
                    return Err(self.disposition());
                }
                self.isdelete = false;
                self.orphan = false;
                self.listonly = false;
                self.attached = true;
            }
            Disposition::Delete => {
                if self.attached {
                    return Err(self.disposition());
                }
                self.isdelete = true;
                self.orphan = false;
                self.listonly = false;
            }
            Disposition::OrphanDelete => {
                if !self.attached && !self.isdelete {
                    self.isdelete = true;
                    self.orphan = true;
                    self.listonly = false;
                }
            }
        }
        if before == (self.listonly, self.isdelete) {
            Ok(Registration::Unchanged)
        } else {
            Ok(Registration::Flipped)
        }
    }

    pub(crate) fn flags(&self) -> (bool, bool) {
        (self.listonly, self.isdelete)
    }
}

/// Restricts which related objects a binding synchronizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelatedFilter {
    /// Every related object.
    #[default]
    All,
    /// Only the listed related objects.
    Only(BTreeSet<ObjectId>),
}

impl RelatedFilter {
    /// Whether a related object passes the filter.
    pub fn allows(&self, id: ObjectId) -> bool {
        match self {
            RelatedFilter::All => true,
            RelatedFilter::Only(ids) => ids.contains(&id),
        }
    }

    /// Whether the filter lets everything through.
    pub fn is_all(&self) -> bool {
        matches!(self, RelatedFilter::All)
    }
}

/// Where a binding takes the objects it processes from.
#[derive(Debug, Clone)]
pub enum BindingSource {
    /// The elements of a task and its inheriting tasks.
    Task(TaskId),
    /// A fixed list, used by row-level schedules.
    Objects(Vec<ObjectRef>),
}

/// A dependency processor attached to the task it must run relative to.
#[derive(Debug, Clone)]
pub struct ProcessorBinding {
    /// The processor.
    pub processor: ProcessorId,
    /// Objects to process.
    pub source: BindingSource,
    /// Whether this binding handles deleted objects (otherwise saved ones).
    pub delete: bool,
    /// Related objects to synchronize.
    pub related: RelatedFilter,
}

/// Per-flush execution unit.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) key: TaskKey,
    pub(crate) kind: TaskKind,
    elements: BTreeMap<ObjectId, TaskElement>,
    pub(crate) parent: Option<TaskId>,
    pub(crate) inheriting: Vec<TaskId>,
    pub(crate) dependencies: Vec<ProcessorBinding>,
    pub(crate) cyclical: Vec<ProcessorBinding>,
    pub(crate) child_tasks: Vec<TaskId>,
    pub(crate) rows: Vec<TaskId>,
    pub(crate) circular: Option<TaskId>,
}

impl Task {
    pub(crate) fn new(id: TaskId, key: TaskKey, kind: TaskKind) -> Self {
        Self {
            id,
            key,
            kind,
            elements: BTreeMap::new(),
            parent: None,
            inheriting: Vec::new(),
            dependencies: Vec::new(),
            cyclical: Vec::new(),
            child_tasks: Vec::new(),
            rows: Vec::new(),
            circular: None,
        }
    }

    /// The task's position in its flush.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// What the task stands for.
    pub fn key(&self) -> TaskKey {
        self.key
    }

    /// The task's kind.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Entity of an entity task.
    pub fn entity(&self) -> Option<&'static str> {
        match self.key {
            TaskKey::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    /// Elements in object creation order.
    pub fn elements(&self) -> impl Iterator<Item = &TaskElement> {
        self.elements.values()
    }

    /// Element holding `id`, if any.
    pub fn element(&self, id: ObjectId) -> Option<&TaskElement> {
        self.elements.get(&id)
    }

    /// Whether the task holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Register an object with an intent.
    ///
    /// On conflict returns the element's existing disposition.
    pub(crate) fn register(
        &mut self,
        object: &ObjectRef,
        disposition: Disposition,
    ) -> Result<Registration, Disposition> {
        match self.elements.get_mut(&object.id()) {
            Some(element) => element.merge(disposition),
            None => {
                self.elements
                    .insert(object.id(), TaskElement::new(object.clone(), disposition));
                Ok(Registration::Added)
            }
        }
    }

    /// Insert a copy of an element, used to build row tasks.
    pub(crate) fn push_element(&mut self, element: TaskElement) {
        self.elements.insert(element.object.id(), element);
    }
}
