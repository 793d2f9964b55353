//! Row-level cycle breaking.
//!
//! When task-level sorting finds entity tasks that depend on each other (a
//! self-referential relationship, or two entity types referencing each
//! other), their objects are ordered individually instead:
//!
//! 1. Every processor binding between tasks of the cycle asks
//!    [`decide_order`](crate::DependencyProcessor::decide_order) about each
//!    related pair present in the flush; each answer is a row edge.
//! 2. The rows are sorted. Edges inside a remaining row cycle are demoted to
//!    post-updates when their foreign key is nullable; anything still cyclic
//!    is a [`FlushError::CycleResolutionFailure`].
//! 3. A circular task replaces the cycle: one row task per object in sorted
//!    order, each carrying the bindings that must run right after its row is
//!    written. Bindings to tasks outside the cycle stay on the circular task.

use crate::dependency::ProcessorId;
use crate::error::FlushError;
use crate::object::{ObjectId, ObjectRef};
use crate::task::{BindingSource, ProcessorBinding, RelatedFilter, TaskElement, TaskId, TaskKey, TaskKind};
use crate::topological::TopologicalSorter;
use crate::unit_of_work::UowTransaction;
use sqlflush_core::RelationshipKind;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A row edge and the binding work it came from.
struct RowPair {
    before: ObjectId,
    after: ObjectId,
    processor: ProcessorId,
    delete: bool,
    object: ObjectRef,
    related: ObjectId,
}

type BranchKey = (ProcessorId, bool, ObjectId);

/// Replace the cyclic tasks `members` by a circular task and return it.
#[tracing::instrument(level = "debug", skip(uow))]
pub(crate) fn break_cycle(
    uow: &mut UowTransaction<'_>,
    members: &[TaskId],
) -> Result<TaskId, FlushError> {
    let graph = Arc::clone(uow.graph());
    let cyclic_roots: HashSet<&'static str> =
        members.iter().filter_map(|&t| uow.task(t).entity()).collect();
    let in_cycle = |entity: &'static str| cyclic_roots.contains(graph.root_of(entity));

    let mut involved = Vec::new();
    let mut stack = members.to_vec();
    while let Some(t) = stack.pop() {
        involved.push(t);
        stack.extend(uow.task(t).inheriting.iter().copied());
    }
    involved.sort();

    let mut elements: BTreeMap<ObjectId, TaskElement> = BTreeMap::new();
    for &t in &involved {
        for element in uow.task(t).elements() {
            elements.insert(element.object().id(), element.clone());
        }
    }

    let mut cyclical = Vec::new();
    let mut extras = Vec::new();
    for &t in &involved {
        for binding in &uow.task(t).dependencies {
            let p = uow.processor(binding.processor);
            let rel = p.relationship();
            if !rel.post_update
                && rel.kind != RelationshipKind::ManyToMany
                && in_cycle(p.owner())
                && in_cycle(rel.target)
            {
                cyclical.push(binding.clone());
            } else {
                extras.push(binding.clone());
            }
        }
    }

    let mut pairs = Vec::new();
    let mut unpaired: Vec<(ProcessorId, bool, ObjectRef, RelatedFilter)> = Vec::new();
    let mut self_deferred: Vec<(ProcessorId, ObjectRef)> = Vec::new();
    for binding in &cyclical {
        let p = uow.processor(binding.processor);
        for object in uow.binding_objects(binding) {
            let mut paired = false;
            let mut persisted_self = false;
            for other in p.related_for_order(uow, &object, binding.delete) {
                if !elements.contains_key(&other.id()) {
                    continue;
                }
                if other == object {
                    if binding.delete {
                        continue;
                    }
                    if !object.is_pending() {
                        persisted_self = true;
                    } else if p.fk_nullable {
                        self_deferred.push((p.id(), object.clone()));
                        paired = true;
                    } else {
                        return Err(FlushError::CycleResolutionFailure {
                            entities: vec![object.entity()],
                            relationships: vec![p.qualified_name()],
                        });
                    }
                    continue;
                }
                if let Some((before, after)) = p.decide_order(&object, &other) {
                    pairs.push(RowPair {
                        before: before.id(),
                        after: after.id(),
                        processor: p.id(),
                        delete: binding.delete,
                        object: object.clone(),
                        related: other.id(),
                    });
                    paired = true;
                }
            }
            if !paired {
                unpaired.push((p.id(), binding.delete, object, RelatedFilter::All));
            } else if persisted_self {
                let only = RelatedFilter::Only([object.id()].into_iter().collect());
                unpaired.push((p.id(), binding.delete, object, only));
            }
        }
    }

    let mut demoted = HashSet::new();
    let mut order = sort_rows(&elements, &pairs, &demoted);
    if let Err(stuck) = &order {
        for (i, pair) in pairs.iter().enumerate() {
            let cyclic = stuck
                .iter()
                .any(|c| c.contains(&pair.before) && c.contains(&pair.after));
            if cyclic && uow.processor(pair.processor).fk_nullable {
                demoted.insert(i);
            }
        }
        tracing::debug!(
            demoted = demoted.len(),
            "Demoting nullable row edges to post-updates"
        );
        order = sort_rows(&elements, &pairs, &demoted);
    }
    let order = match order {
        Ok(order) => order,
        Err(stuck) => {
            let mut entities = BTreeSet::new();
            let mut relationships = BTreeSet::new();
            for (i, pair) in pairs.iter().enumerate() {
                if demoted.contains(&i)
                    || !stuck
                        .iter()
                        .any(|c| c.contains(&pair.before) && c.contains(&pair.after))
                {
                    continue;
                }
                for id in [pair.before, pair.after] {
                    if let Some(e) = elements.get(&id) {
                        entities.insert(e.object().entity());
                    }
                }
                relationships.insert(uow.processor(pair.processor).qualified_name());
            }
            return Err(FlushError::CycleResolutionFailure {
                entities: entities.into_iter().collect(),
                relationships: relationships.into_iter().collect(),
            });
        }
    };

    let substitute = uow.push_task(TaskKey::Circular(members[0]), TaskKind::Circular);
    uow.task_mut(substitute).dependencies = extras;
    uow.task_mut(substitute).cyclical = group_unpaired(unpaired);

    let mut row_of = HashMap::new();
    for id in order {
        let row = uow.push_task(TaskKey::Row(id), TaskKind::Row);
        if let Some(element) = elements.get(&id) {
            uow.task_mut(row).push_element(element.clone());
        }
        uow.task_mut(substitute).rows.push(row);
        row_of.insert(id, row);
    }

    let mut branches: BTreeMap<(TaskId, ProcessorId, bool, ObjectId), (ObjectRef, BTreeSet<ObjectId>)> =
        BTreeMap::new();
    let mut deferred: BTreeMap<BranchKey, (ObjectRef, BTreeSet<ObjectId>)> = BTreeMap::new();
    for (processor, object) in self_deferred {
        uow.demote(object.id(), processor);
        deferred
            .entry((processor, false, object.id()))
            .or_insert_with(|| (object.clone(), BTreeSet::new()))
            .1
            .insert(object.id());
    }
    for (i, pair) in pairs.into_iter().enumerate() {
        if demoted.contains(&i) {
            uow.demote(pair.after, pair.processor);
            deferred
                .entry((pair.processor, pair.delete, pair.object.id()))
                .or_insert_with(|| (pair.object.clone(), BTreeSet::new()))
                .1
                .insert(pair.related);
        } else if let Some(&row) = row_of.get(&pair.before) {
            branches
                .entry((row, pair.processor, pair.delete, pair.object.id()))
                .or_insert_with(|| (pair.object.clone(), BTreeSet::new()))
                .1
                .insert(pair.related);
        }
    }
    for ((row, processor, delete, _), (object, related)) in branches {
        uow.task_mut(row).cyclical.push(ProcessorBinding {
            processor,
            source: BindingSource::Objects(vec![object]),
            delete,
            related: RelatedFilter::Only(related),
        });
    }
    for ((processor, delete, _), (object, related)) in deferred {
        tracing::trace!(
            object = ?object,
            relationship = %uow.processor(processor).qualified_name(),
            "Foreign key deferred to post-update"
        );
        uow.defer(ProcessorBinding {
            processor,
            source: BindingSource::Objects(vec![object]),
            delete,
            related: RelatedFilter::Only(related),
        });
    }

    for &t in members {
        uow.task_mut(t).circular = Some(substitute);
    }
    tracing::debug!(
        tasks = members.len(),
        rows = row_of.len(),
        "Replaced cyclic tasks with row-level schedule"
    );
    Ok(substitute)
}

/// Sort rows by the non-demoted pairs; on failure return the cyclic sets.
fn sort_rows(
    elements: &BTreeMap<ObjectId, TaskElement>,
    pairs: &[RowPair],
    demoted: &HashSet<usize>,
) -> Result<Vec<ObjectId>, Vec<HashSet<ObjectId>>> {
    let mut sorter = TopologicalSorter::new(elements.keys().copied());
    for (i, pair) in pairs.iter().enumerate() {
        if !demoted.contains(&i) {
            sorter.add_edge(pair.before, pair.after);
        }
    }
    let result = sorter.sort();
    if result.is_acyclic() {
        Ok(result.flatten())
    } else {
        Err(result
            .cycles()
            .into_iter()
            .map(|c| c.iter().copied().collect())
            .collect())
    }
}

/// Group unconstrained objects into one binding per processor and phase.
fn group_unpaired(unpaired: Vec<(ProcessorId, bool, ObjectRef, RelatedFilter)>) -> Vec<ProcessorBinding> {
    let mut grouped: Vec<ProcessorBinding> = Vec::new();
    for (processor, delete, object, related) in unpaired {
        if related.is_all() {
            let existing = grouped
                .iter_mut()
                .find(|b| b.processor == processor && b.delete == delete && b.related.is_all());
            if let Some(ProcessorBinding {
                source: BindingSource::Objects(objects),
                ..
            }) = existing
            {
                objects.push(object);
                continue;
            }
        }
        grouped.push(ProcessorBinding {
            processor,
            source: BindingSource::Objects(vec![object]),
            delete,
            related,
        });
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_objects_share_a_binding() {
        let a = ObjectRef::new("Node");
        let b = ObjectRef::new("Node");
        let grouped = group_unpaired(vec![
            (ProcessorId(0), false, a.clone(), RelatedFilter::All),
            (ProcessorId(0), false, b.clone(), RelatedFilter::All),
            (ProcessorId(0), true, a.clone(), RelatedFilter::All),
        ]);
        assert_eq!(grouped.len(), 2);
        match &grouped[0].source {
            BindingSource::Objects(objects) => assert_eq!(objects, &vec![a, b]),
            BindingSource::Task(_) => panic!("expected object list"),
        }
        assert!(grouped[1].delete);
    }

    #[test]
    fn filtered_objects_keep_their_own_binding() {
        let a = ObjectRef::new("Node");
        let only = RelatedFilter::Only([a.id()].into_iter().collect());
        let grouped = group_unpaired(vec![
            (ProcessorId(1), false, a.clone(), RelatedFilter::All),
            (ProcessorId(1), false, a.clone(), only.clone()),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[1].related, only);
    }
}
