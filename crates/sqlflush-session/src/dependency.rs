//! Dependency processors.
//!
//! One [`DependencyProcessor`] exists per relationship taking part in a flush.
//! It is the only place that knows what a relationship kind means for the
//! scheduler:
//!
//! - which task-level ordering edge the relationship implies
//!   ([`register_dependencies`](DependencyProcessor::register_dependencies))
//! - which related objects a saved or deleted object drags into the flush
//!   ([`preprocess`](DependencyProcessor::preprocess))
//! - which of two related objects must be written first
//!   ([`decide_order`](DependencyProcessor::decide_order))
//! - how foreign keys and link rows follow a written parent
//!   ([`synchronize`](DependencyProcessor::synchronize))
//!
//! | kind | edge | hosted on | processes |
//! |------|------|-----------|-----------|
//! | one-to-many / one-to-one | owner → target | owner task | owners |
//! | many-to-one | target → owner | target task | owners |
//! | many-to-many | owner, target → association | association task | owners |

use crate::backend::ColumnValues;
use crate::error::FlushError;
use crate::flush::Executor;
use crate::object::ObjectRef;
use crate::task::{BindingSource, Disposition, ProcessorBinding, Registration, RelatedFilter};
use crate::unit_of_work::UowTransaction;
use sqlflush_core::{Cascade, MapperGraph, RelationshipInfo, RelationshipKind, Value};

/// Position of a processor in its flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(pub(crate) usize);

/// Per-relationship scheduling logic.
#[derive(Debug, Clone, Copy)]
pub struct DependencyProcessor {
    pub(crate) id: ProcessorId,
    pub(crate) owner: &'static str,
    pub(crate) relationship: RelationshipInfo,
    pub(crate) cascade: Cascade,
    pub(crate) fk_nullable: bool,
}

impl DependencyProcessor {
    pub(crate) fn new(
        id: ProcessorId,
        owner: &'static str,
        relationship: RelationshipInfo,
        graph: &MapperGraph,
    ) -> Result<Self, FlushError> {
        Ok(Self {
            id,
            owner,
            relationship,
            cascade: relationship.cascade_options()?,
            fk_nullable: graph.fk_nullable(owner, &relationship),
        })
    }

    /// The processor's position in its flush.
    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Entity declaring the relationship.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// The relationship.
    pub fn relationship(&self) -> &RelationshipInfo {
        &self.relationship
    }

    /// `Owner.relationship`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.relationship.name)
    }

    /// Entity whose rows hold the foreign key, `None` for many-to-many.
    pub fn fk_holder(&self) -> Option<&'static str> {
        match self.relationship.kind {
            RelationshipKind::ManyToOne => Some(self.owner),
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                Some(self.relationship.target)
            }
            RelationshipKind::ManyToMany => None,
        }
    }

    /// Entity whose primary key the foreign key stores.
    pub fn referenced_entity(&self) -> &'static str {
        match self.relationship.kind {
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => self.owner,
            RelationshipKind::ManyToOne | RelationshipKind::ManyToMany => self.relationship.target,
        }
    }

    /// Declare task-level edges and attach save and delete bindings.
    pub(crate) fn register_dependencies(&self, uow: &mut UowTransaction<'_>) -> Result<(), FlushError> {
        let rel = &self.relationship;
        let owner_task = uow.get_task(self.owner)?;
        let target_task = uow.get_task(rel.target)?;

        let host = match rel.kind {
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                if !rel.post_update {
                    uow.add_edge(owner_task, target_task);
                }
                owner_task
            }
            RelationshipKind::ManyToOne => {
                if !rel.post_update {
                    uow.add_edge(target_task, owner_task);
                }
                target_task
            }
            RelationshipKind::ManyToMany => {
                let assoc = uow.get_association_task(self.owner, rel.name);
                uow.add_edge(owner_task, assoc);
                uow.add_edge(target_task, assoc);
                assoc
            }
        };

        for delete in [false, true] {
            uow.bind(
                host,
                ProcessorBinding {
                    processor: self.id,
                    source: BindingSource::Task(owner_task),
                    delete,
                    related: RelatedFilter::All,
                },
            );
        }
        tracing::debug!(
            relationship = %self.qualified_name(),
            kind = %rel.kind,
            post_update = rel.post_update,
            "Registered dependency processor"
        );
        Ok(())
    }

    /// Register the related objects implied by `object` being saved or deleted.
    ///
    /// Returns whether any task element was added or changed.
    pub(crate) fn preprocess(
        &self,
        uow: &mut UowTransaction<'_>,
        object: &ObjectRef,
        isdelete: bool,
    ) -> Result<bool, FlushError> {
        let history = uow.history(object, self.relationship.name);
        let cascade = self.cascade;
        let save_or_list = if cascade.save_update {
            Disposition::Save
        } else {
            Disposition::ListOnly
        };
        let orphan_or_save = if cascade.delete_orphan {
            Disposition::OrphanDelete
        } else {
            Disposition::Save
        };
        let delete_or = |fallback| {
            if cascade.delete {
                Disposition::Delete
            } else {
                fallback
            }
        };

        let mut changed = false;
        match (self.relationship.kind, isdelete) {
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, false) => {
                changed |= register_all(uow, &history.added, Disposition::Attach)?;
                changed |= register_all(uow, &history.removed, orphan_or_save)?;
            }
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, true) => {
                let children = delete_or(Disposition::Save);
                changed |= register_all(uow, &history.unchanged, children)?;
                changed |= register_all(uow, &history.added, children)?;
                changed |= register_all(uow, &history.removed, orphan_or_save)?;
            }
            (RelationshipKind::ManyToOne | RelationshipKind::ManyToMany, false) => {
                changed |= register_all(uow, &history.added, save_or_list)?;
                changed |= register_all(uow, &history.removed, Disposition::ListOnly)?;
            }
            (RelationshipKind::ManyToOne, true) => {
                changed |= register_all(uow, &history.unchanged, delete_or(Disposition::ListOnly))?;
                changed |= register_all(uow, &history.added, Disposition::ListOnly)?;
                changed |= register_all(uow, &history.removed, Disposition::ListOnly)?;
            }
            (RelationshipKind::ManyToMany, true) => {
                let targets = delete_or(Disposition::ListOnly);
                changed |= register_all(uow, &history.unchanged, targets)?;
                changed |= register_all(uow, &history.removed, targets)?;
                changed |= register_all(uow, &history.added, Disposition::ListOnly)?;
            }
        }
        Ok(changed)
    }

    /// Related objects whose rows constrain the order of `object`'s row.
    pub(crate) fn related_for_order(
        &self,
        uow: &UowTransaction<'_>,
        object: &ObjectRef,
        isdelete: bool,
    ) -> Vec<ObjectRef> {
        let h = uow.history(object, self.relationship.name);
        match (self.relationship.kind, isdelete) {
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, false) => {
                h.added.into_iter().chain(h.removed).collect()
            }
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, true) => h
                .unchanged
                .into_iter()
                .chain(h.removed)
                .chain(h.added)
                .collect(),
            (RelationshipKind::ManyToOne, false) => h.added,
            (RelationshipKind::ManyToOne, true) => h.unchanged.into_iter().chain(h.removed).collect(),
            (RelationshipKind::ManyToMany, _) => Vec::new(),
        }
    }

    /// Which of `object` (processed by this processor) and its related object
    /// `other` must be written first, as `(before, after)`.
    ///
    /// `None` when the pair does not constrain each other: the same object, or
    /// a many-to-many pair (link rows are written after both sides anyway).
    pub fn decide_order(&self, object: &ObjectRef, other: &ObjectRef) -> Option<(ObjectRef, ObjectRef)> {
        if object == other {
            return None;
        }
        match self.relationship.kind {
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                Some((object.clone(), other.clone()))
            }
            RelationshipKind::ManyToOne => Some((other.clone(), object.clone())),
            RelationshipKind::ManyToMany => None,
        }
    }

    /// Propagate `object`'s relationship changes into foreign key columns or
    /// link rows, after the rows it depends on were written.
    pub(crate) fn synchronize(
        &self,
        exec: &mut Executor<'_, '_>,
        object: &ObjectRef,
        delete: bool,
        filter: &RelatedFilter,
    ) -> Result<(), FlushError> {
        let rel = &self.relationship;
        let h = exec.history(object, rel.name);
        let keep = |o: &&ObjectRef| filter.allows(o.id());

        match (rel.kind, delete) {
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, false) => {
                for child in h.added.iter().filter(keep) {
                    self.copy_key(exec.graph(), object, child, rel.remote_key_cols())?;
                }
                for child in h.removed.iter().filter(keep) {
                    if !exec.is_deleting(child) {
                        clear_key(child, rel.remote_key_cols());
                    }
                }
            }
            (RelationshipKind::OneToMany | RelationshipKind::OneToOne, true) => {
                for child in h.unchanged.iter().chain(&h.removed).chain(&h.added).filter(keep) {
                    if !exec.is_deleting(child) {
                        clear_key(child, rel.remote_key_cols());
                    }
                }
            }
            (RelationshipKind::ManyToOne, false) => {
                if let Some(target) = h.added.iter().filter(keep).last() {
                    self.copy_key(exec.graph(), target, object, rel.local_key_cols())?;
                } else if filter.is_all() && h.added.is_empty() && !h.removed.is_empty() {
                    clear_key(object, rel.local_key_cols());
                }
            }
            (RelationshipKind::ManyToOne, true) => {}
            (RelationshipKind::ManyToMany, false) => {
                let removed = self.link_rows(exec.graph(), object, h.removed.iter().filter(keep), false)?;
                if !removed.is_empty() {
                    exec.delete_links(self, &removed)?;
                }
                let added = self.link_rows(exec.graph(), object, h.added.iter().filter(keep), true)?;
                if !added.is_empty() {
                    exec.insert_links(self, &added)?;
                }
            }
            (RelationshipKind::ManyToMany, true) => {
                let related = h.unchanged.iter().chain(&h.removed).filter(keep);
                let removed = self.link_rows(exec.graph(), object, related, false)?;
                if !removed.is_empty() {
                    exec.delete_links(self, &removed)?;
                }
            }
        }
        Ok(())
    }

    /// Copy `parent`'s primary key into `columns` of `child`.
    fn copy_key(
        &self,
        graph: &MapperGraph,
        parent: &ObjectRef,
        child: &ObjectRef,
        columns: &[&'static str],
    ) -> Result<(), FlushError> {
        let pk = self.parent_key(graph, parent, child)?;
        for (&column, value) in columns.iter().zip(pk) {
            tracing::trace!(
                relationship = %self.qualified_name(),
                parent = ?parent,
                child = ?child,
                column = column,
                value = %value,
                "Synchronized foreign key"
            );
            child.set(column, value);
        }
        Ok(())
    }

    fn parent_key(
        &self,
        graph: &MapperGraph,
        parent: &ObjectRef,
        child: &ObjectRef,
    ) -> Result<Vec<Value>, FlushError> {
        parent.primary_key(graph).ok_or_else(|| {
            tracing::error!(
                relationship = %self.qualified_name(),
                parent = ?parent,
                child = ?child,
                "Parent primary key missing during synchronize"
            );
            FlushError::UnresolvedParentKey {
                relationship: self.qualified_name(),
                parent_entity: parent.entity(),
                child_entity: child.entity(),
            }
        })
    }

    /// Link rows between `owner` and each target.
    ///
    /// Rows for deletion skip targets that were never written; rows for
    /// insertion require both keys.
    fn link_rows<'o>(
        &self,
        graph: &MapperGraph,
        owner: &ObjectRef,
        targets: impl Iterator<Item = &'o ObjectRef>,
        inserting: bool,
    ) -> Result<Vec<ColumnValues>, FlushError> {
        let Some(link) = self.relationship.link_table else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        for target in targets {
            let (owner_pk, target_pk) = if inserting {
                (
                    self.parent_key(graph, owner, target)?,
                    self.parent_key(graph, target, owner)?,
                )
            } else {
                match (owner.primary_key(graph), target.primary_key(graph)) {
                    (Some(o), Some(t)) => (o, t),
                    _ => continue,
                }
            };
            let row: ColumnValues = link
                .local_cols()
                .iter()
                .copied()
                .zip(owner_pk)
                .chain(link.remote_cols().iter().copied().zip(target_pk))
                .collect();
            rows.push(row);
        }
        Ok(rows)
    }
}

fn register_all(
    uow: &mut UowTransaction<'_>,
    objects: &[ObjectRef],
    disposition: Disposition,
) -> Result<bool, FlushError> {
    let mut changed = false;
    for o in objects {
        changed |= uow.register_object(o, disposition)? != Registration::Unchanged;
    }
    Ok(changed)
}

fn clear_key(child: &ObjectRef, columns: &[&'static str]) {
    for &column in columns {
        tracing::trace!(child = ?child, column = column, "Cleared foreign key");
        child.set(column, Value::Null);
    }
}
