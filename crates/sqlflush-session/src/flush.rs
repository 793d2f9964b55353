//! Plan execution.
//!
//! An [`ExecutionPlan`] is the sorted task tree of one flush. Executing it
//! walks the tree depth-first; each task runs in six phases:
//!
//! | phase | work |
//! |-------|------|
//! | save | INSERT/UPDATE the task's objects (root tasks only, polymorphically) |
//! | sync after save | save bindings hosted on the task |
//! | inheriting pre | the same two phases for inheriting tasks |
//! | dependencies | delete bindings hosted on the task |
//! | inheriting post | the remaining phases for inheriting tasks, then child tasks |
//! | delete | DELETE the task's objects (root tasks only, leaf tables first) |
//!
//! Foreign keys that cannot be written with their row (post-update
//! relationships, and rows demoted while breaking a cycle) are inserted as
//! NULL and written by one UPDATE per table after everything else. A
//! persisted row whose deferred reference points at a row about to be deleted
//! is cleared before any other statement runs.

use crate::backend::{ColumnValues, PersistenceBackend, PrimaryKey};
use crate::change_tracker::History;
use crate::dependency::DependencyProcessor;
use crate::error::FlushError;
use crate::identity_map::IdentityRegistry;
use crate::object::{ColumnMap, ObjectId, ObjectRef};
use crate::task::{ProcessorBinding, TaskElement, TaskId, TaskKey, TaskKind};
use crate::unit_of_work::{FlushConfig, UowTransaction};
use serde::Serialize;
use sqlflush_core::{Error, Mapper, MapperGraph, StaleDataError, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Write as _};

/// Per-entity statement counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    /// Objects inserted.
    pub inserted: usize,
    /// Objects updated.
    pub updated: usize,
    /// Objects deleted.
    pub deleted: usize,
}

/// Summary of a successful flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Counts keyed by concrete entity name.
    pub entities: BTreeMap<&'static str, EntityCounts>,
    /// Rows updated in the post-update phase, including pre-delete clears.
    pub post_updates: usize,
    /// Link rows inserted or deleted.
    pub link_rows: usize,
}

impl FlushReport {
    /// Counts for one entity.
    pub fn entity(&self, entity: &str) -> EntityCounts {
        self.entities.get(entity).copied().unwrap_or_default()
    }

    /// Objects inserted across all entities.
    pub fn inserted(&self) -> usize {
        self.entities.values().map(|c| c.inserted).sum()
    }

    /// Objects updated across all entities.
    pub fn updated(&self) -> usize {
        self.entities.values().map(|c| c.updated).sum()
    }

    /// Objects deleted across all entities.
    pub fn deleted(&self) -> usize {
        self.entities.values().map(|c| c.deleted).sum()
    }

    /// Every row-level write.
    pub fn total(&self) -> usize {
        self.inserted() + self.updated() + self.deleted() + self.post_updates + self.link_rows
    }

    /// Whether the flush wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn counts(&mut self, entity: &'static str) -> &mut EntityCounts {
        self.entities.entry(entity).or_default()
    }
}

impl fmt::Display for FlushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} deleted, {} post-updates, {} link rows",
            self.inserted(),
            self.updated(),
            self.deleted(),
            self.post_updates,
            self.link_rows
        )
    }
}

/// Column values of every object in a plan, taken before execution.
pub(crate) struct Checkpoint {
    entries: Vec<(ObjectRef, ColumnMap)>,
}

impl Checkpoint {
    /// Put every object's column values back.
    pub(crate) fn restore(self) {
        tracing::debug!(objects = self.entries.len(), "Restoring column values");
        for (object, values) in self.entries {
            object.restore_values(values);
        }
    }
}

/// Sorted task tree of one flush.
pub struct ExecutionPlan<'a> {
    uow: UowTransaction<'a>,
}

impl<'a> ExecutionPlan<'a> {
    pub(crate) fn new(uow: UowTransaction<'a>) -> Self {
        Self { uow }
    }

    /// Whether the plan writes nothing.
    pub fn is_empty(&self) -> bool {
        self.uow.all_elements().all(TaskElement::is_listonly)
    }

    /// Whether any cycle was broken into a row-level schedule.
    pub fn has_cycles(&self) -> bool {
        self.uow.tasks().iter().any(|t| t.kind() == TaskKind::Circular)
    }

    /// The element an object was registered as, if it takes part.
    pub fn element(&self, object: &ObjectRef) -> Option<&TaskElement> {
        self.uow
            .tasks()
            .iter()
            .find(|t| t.key() == TaskKey::Entity(object.entity()))
            .and_then(|t| t.element(object.id()))
    }

    /// Number of objects that will be saved and deleted.
    pub fn counts(&self) -> (usize, usize) {
        self.uow.all_elements().fold((0, 0), |(s, d), e| {
            (s + usize::from(e.is_save()), d + usize::from(e.is_delete()))
        })
    }

    /// Render the task tree, one line per task, binding and element.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &root in self.uow.roots() {
            self.dump_task(&mut out, root, 0);
        }
        out
    }

    fn dump_task(&self, out: &mut String, id: TaskId, depth: usize) {
        let uow = &self.uow;
        let task = uow.task(id);
        let indent = "  ".repeat(depth);
        let elements: Vec<&TaskElement> = match task.kind() {
            TaskKind::Entity if task.parent.is_none() => uow.polymorphic_elements(id),
            _ => task.elements().collect(),
        };
        let saves = elements.iter().filter(|e| e.is_save()).count();
        let deletes = elements.iter().filter(|e| e.is_delete()).count();
        let listonly = elements.iter().filter(|e| e.is_listonly()).count();
        let _ = writeln!(
            out,
            "{}{} [{:?}] save={} delete={} listonly={}",
            indent,
            task.key(),
            task.kind(),
            saves,
            deletes,
            listonly
        );
        if let Some(circular) = task.circular {
            let _ = writeln!(out, "{}  replaced by circular task {}", indent, circular.0);
            self.dump_task(out, circular, depth + 1);
            return;
        }
        for binding in task.dependencies.iter().chain(&task.cyclical) {
            let _ = writeln!(
                out,
                "{}  > {} ({})",
                indent,
                uow.processor(binding.processor).qualified_name(),
                if binding.delete { "delete" } else { "save" }
            );
        }
        if matches!(task.kind(), TaskKind::Row) {
            for element in task.elements() {
                let _ = writeln!(
                    out,
                    "{}  - {:?} ({})",
                    indent,
                    element.object(),
                    element.disposition()
                );
            }
        }
        for &child in task
            .inheriting
            .iter()
            .chain(&task.rows)
            .chain(&task.child_tasks)
        {
            self.dump_task(out, child, depth + 1);
        }
    }

    /// Snapshot the column values of every object in the plan.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            entries: self
                .uow
                .all_elements()
                .map(|e| (e.object().clone(), e.object().values()))
                .collect(),
        }
    }

    /// Issue every statement of the plan.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) fn execute(
        &self,
        backend: &mut dyn PersistenceBackend,
        config: &FlushConfig,
    ) -> Result<FlushReport, FlushError> {
        let mut exec = Executor::new(&self.uow, backend, config);
        exec.clear_doomed_references()?;
        for &root in self.uow.roots() {
            exec.execute_task(root)?;
        }
        exec.post_update()?;
        Ok(exec.report)
    }

    /// Update the registry after the transaction committed.
    pub(crate) fn complete(&self, registry: &mut IdentityRegistry) {
        for element in self.uow.all_elements() {
            if element.is_listonly() {
                continue;
            }
            if element.is_delete() {
                registry.mark_removed(element.object());
            } else {
                registry.mark_clean(element.object());
            }
        }
    }
}

impl fmt::Debug for ExecutionPlan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (saves, deletes) = self.counts();
        f.debug_struct("ExecutionPlan")
            .field("tasks", &self.uow.tasks().len())
            .field("saves", &saves)
            .field("deletes", &deletes)
            .finish()
    }
}

/// Statement issuing state of one plan execution.
pub(crate) struct Executor<'p, 'a> {
    uow: &'p UowTransaction<'a>,
    backend: &'p mut dyn PersistenceBackend,
    config: &'p FlushConfig,
    /// Column values as last written (or loaded), per object.
    baselines: HashMap<ObjectId, ColumnMap>,
    deleting: HashSet<ObjectId>,
    listonly: HashSet<ObjectId>,
    inserted: HashSet<ObjectId>,
    saved: Vec<ObjectRef>,
    saved_set: HashSet<ObjectId>,
    postponed: Vec<ProcessorBinding>,
    report: FlushReport,
}

impl<'p, 'a> Executor<'p, 'a> {
    fn new(
        uow: &'p UowTransaction<'a>,
        backend: &'p mut dyn PersistenceBackend,
        config: &'p FlushConfig,
    ) -> Self {
        let mut baselines = HashMap::new();
        let mut deleting = HashSet::new();
        let mut listonly = HashSet::new();
        for element in uow.all_elements() {
            let object = element.object();
            if !object.is_pending() {
                baselines.insert(object.id(), object.committed_values());
            }
            if element.is_listonly() {
                listonly.insert(object.id());
            } else if element.is_delete() {
                deleting.insert(object.id());
            }
        }
        Self {
            uow,
            backend,
            config,
            baselines,
            deleting,
            listonly,
            inserted: HashSet::new(),
            saved: Vec::new(),
            saved_set: HashSet::new(),
            postponed: Vec::new(),
            report: FlushReport::default(),
        }
    }

    pub(crate) fn graph(&self) -> &'p MapperGraph {
        let uow = self.uow;
        uow.graph()
    }

    pub(crate) fn history(&self, object: &ObjectRef, relationship: &str) -> History {
        self.uow.history(object, relationship)
    }

    /// Whether the object is deleted by this flush.
    pub(crate) fn is_deleting(&self, object: &ObjectRef) -> bool {
        self.deleting.contains(&object.id())
    }

    pub(crate) fn insert_links(
        &mut self,
        processor: &DependencyProcessor,
        rows: &[ColumnValues],
    ) -> Result<(), FlushError> {
        let Some(link) = processor.relationship().link_table else {
            return Ok(());
        };
        tracing::debug!(table = link.table_name, count = rows.len(), "Executing link insert batch");
        self.backend.insert_links(&link, rows)?;
        self.report.link_rows += rows.len();
        Ok(())
    }

    pub(crate) fn delete_links(
        &mut self,
        processor: &DependencyProcessor,
        rows: &[ColumnValues],
    ) -> Result<(), FlushError> {
        let Some(link) = processor.relationship().link_table else {
            return Ok(());
        };
        tracing::debug!(table = link.table_name, count = rows.len(), "Executing link delete batch");
        self.backend.delete_links(&link, rows)?;
        self.report.link_rows += rows.len();
        Ok(())
    }

    fn execute_task(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        let task = uow.task(id);
        if let Some(circular) = task.circular {
            return self.execute_circular(circular);
        }
        if task.parent.is_none() {
            self.save_task(id)?;
        }
        self.sync_after_save(id)?;
        self.inheriting_pre(id)?;
        self.dependencies(id)?;
        self.inheriting_post(id)?;
        if task.parent.is_none() {
            self.delete_task(id)?;
        }
        Ok(())
    }

    fn sync_after_save(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        let task = uow.task(id);
        self.run_bindings(&task.cyclical, false)?;
        self.run_bindings(&task.dependencies, false)
    }

    fn inheriting_pre(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        for &sub in &uow.task(id).inheriting {
            self.sync_after_save(sub)?;
            self.inheriting_pre(sub)?;
        }
        Ok(())
    }

    fn dependencies(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        let task = uow.task(id);
        self.run_bindings(&task.dependencies, true)?;
        self.run_bindings(&task.cyclical, true)
    }

    fn inheriting_post(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        let task = uow.task(id);
        for &sub in &task.inheriting {
            self.dependencies(sub)?;
            self.inheriting_post(sub)?;
        }
        for &child in &task.child_tasks {
            self.execute_task(child)?;
        }
        Ok(())
    }

    /// Run a row-level schedule.
    fn execute_circular(&mut self, id: TaskId) -> Result<(), FlushError> {
        let uow = self.uow;
        let circular = uow.task(id);
        tracing::debug!(rows = circular.rows.len(), "Executing row-level schedule");

        self.run_bindings(&circular.cyclical, false)?;
        self.run_bindings(&circular.cyclical, true)?;
        for &row in &circular.rows {
            let row = uow.task(row);
            let saves: Vec<ObjectRef> = row
                .elements()
                .filter(|e| e.is_save())
                .map(|e| e.object().clone())
                .collect();
            self.save_objects(&saves)?;
            self.run_bindings(&row.cyclical, false)?;
            self.run_bindings(&row.cyclical, true)?;
        }
        self.run_bindings(&circular.dependencies, false)?;
        self.run_bindings(&circular.dependencies, true)?;
        for &child in &circular.child_tasks {
            self.execute_task(child)?;
        }
        for &row in circular.rows.iter().rev() {
            let deletes: Vec<ObjectRef> = uow
                .task(row)
                .elements()
                .filter(|e| e.is_delete())
                .map(|e| e.object().clone())
                .collect();
            self.delete_objects(&deletes)?;
        }
        Ok(())
    }

    fn run_bindings(&mut self, bindings: &[ProcessorBinding], delete: bool) -> Result<(), FlushError> {
        let uow = self.uow;
        for binding in bindings.iter().filter(|b| b.delete == delete) {
            let processor = uow.processor(binding.processor);
            if processor.relationship().post_update {
                self.postponed.push(binding.clone());
                continue;
            }
            self.synchronize(&processor, binding)?;
        }
        Ok(())
    }

    fn synchronize(
        &mut self,
        processor: &DependencyProcessor,
        binding: &ProcessorBinding,
    ) -> Result<(), FlushError> {
        for object in self.uow.binding_objects(binding) {
            if self.listonly.contains(&object.id()) {
                continue;
            }
            processor.synchronize(self, &object, binding.delete, &binding.related)?;
        }
        Ok(())
    }

    fn save_task(&mut self, id: TaskId) -> Result<(), FlushError> {
        let saves: Vec<ObjectRef> = self
            .uow
            .polymorphic_elements(id)
            .into_iter()
            .filter(|e| e.is_save())
            .map(|e| e.object().clone())
            .collect();
        self.save_objects(&saves)
    }

    fn delete_task(&mut self, id: TaskId) -> Result<(), FlushError> {
        let deletes: Vec<ObjectRef> = self
            .uow
            .polymorphic_elements(id)
            .into_iter()
            .filter(|e| e.is_delete())
            .map(|e| e.object().clone())
            .collect();
        self.delete_objects(&deletes)
    }

    /// Foreign key columns of `object` written in the post-update phase.
    fn deferred_columns(&self, object: &ObjectRef) -> Vec<&'static str> {
        let uow = self.uow;
        let graph = uow.graph();
        let mut columns = Vec::new();
        let demoted = uow.demoted_for(object.id()).iter().map(|&p| uow.processor(p));
        let declared = uow
            .processors()
            .iter()
            .copied()
            .filter(|p| p.relationship().post_update)
            .filter(|p| p.fk_holder().is_some_and(|h| graph.is_a(object.entity(), h)));
        for processor in declared.chain(demoted) {
            for &column in processor.relationship().fk_cols() {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    /// Primary key identifying the object's row, as last written.
    fn row_key(&self, object: &ObjectRef) -> Result<PrimaryKey, FlushError> {
        let graph = self.graph();
        let written = self.baselines.get(&object.id()).and_then(|baseline| {
            graph
                .primary_key(object.entity())
                .iter()
                .map(|col| baseline.get(col).filter(|v| !v.is_null()).cloned())
                .collect::<Option<Vec<_>>>()
        });
        written
            .or_else(|| object.primary_key(graph))
            .ok_or(FlushError::MissingPrimaryKey {
                entity: object.entity(),
                object: object.id(),
            })
    }

    fn check_counts(&self, table: &str, counts: &[u64]) -> Result<(), FlushError> {
        if !self.config.check_row_counts {
            return Ok(());
        }
        match counts.iter().find(|&&c| c != 1) {
            Some(&actual) => {
                tracing::warn!(table = table, actual = actual, "Row count mismatch");
                Err(FlushError::Backend(Error::StaleData(StaleDataError {
                    table: table.to_string(),
                    expected: 1,
                    actual,
                })))
            }
            None => Ok(()),
        }
    }

    /// INSERT or UPDATE `objects`, root tables first.
    fn save_objects(&mut self, objects: &[ObjectRef]) -> Result<(), FlushError> {
        let graph = self.graph();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for object in objects {
            if self.saved_set.insert(object.id()) {
                self.saved.push(object.clone());
            }
            if object.is_pending() {
                if !self.inserted.contains(&object.id()) {
                    inserts.push(object.clone());
                }
            } else {
                updates.push(object.clone());
            }
        }

        let depth = inserts
            .iter()
            .chain(&updates)
            .map(|o| graph.inheritance_chain(o.entity()).len())
            .max()
            .unwrap_or(0);
        let mut updated = HashSet::new();
        for level in 0..depth {
            for (mapper, group) in group_by_level(graph, &inserts, level) {
                self.insert_level(mapper, &group, level)?;
            }
            for (mapper, group) in group_by_level(graph, &updates, level) {
                self.update_level(mapper, &group, &mut updated)?;
            }
        }
        for object in &inserts {
            self.inserted.insert(object.id());
        }
        for object in updates.iter().filter(|o| updated.contains(&o.id())) {
            self.report.counts(object.entity()).updated += 1;
        }
        Ok(())
    }

    fn insert_level(
        &mut self,
        mapper: &Mapper,
        objects: &[ObjectRef],
        level: usize,
    ) -> Result<(), FlushError> {
        let graph = self.graph();
        let mut rows = Vec::with_capacity(objects.len());
        for object in objects {
            if level == 0 {
                set_discriminator(graph, mapper, object);
            }
            let deferred = self.deferred_columns(object);
            let values = object.values();
            let mut row: ColumnValues = Vec::new();
            for field in &mapper.fields {
                let value = if deferred.contains(&field.name) {
                    Some(Value::Null)
                } else {
                    values.get(field.name).cloned()
                };
                match value {
                    Some(v) if field.primary_key && v.is_null() => {}
                    Some(v) => row.push((field.name, v)),
                    None => {}
                }
            }
            rows.push(row);
        }

        tracing::debug!(table = mapper.table, count = rows.len(), "Executing insert batch");
        let keys = self.backend.insert(mapper, &rows)?;
        if keys.len() != rows.len() {
            return Err(FlushError::Backend(Error::Custom(format!(
                "insert into '{}' returned {} key(s) for {} row(s)",
                mapper.table,
                keys.len(),
                rows.len()
            ))));
        }

        let pk_columns = mapper.primary_key();
        for ((object, row), key) in objects.iter().zip(rows).zip(keys) {
            if !key.is_empty() {
                for (&column, value) in pk_columns.iter().zip(key) {
                    object.set(column, value);
                }
            }
            let pk = object.primary_key(graph).ok_or(FlushError::MissingPrimaryKey {
                entity: object.entity(),
                object: object.id(),
            })?;
            let baseline = self.baselines.entry(object.id()).or_default();
            baseline.extend(row);
            baseline.extend(graph.primary_key(object.entity()).into_iter().zip(pk));
            if level == 0 {
                self.report.counts(object.entity()).inserted += 1;
            }
        }
        Ok(())
    }

    fn update_level(
        &mut self,
        mapper: &Mapper,
        objects: &[ObjectRef],
        updated: &mut HashSet<ObjectId>,
    ) -> Result<(), FlushError> {
        let mut rows = Vec::new();
        let mut written = Vec::new();
        for object in objects {
            let deferred = self.deferred_columns(object);
            let values = object.values();
            let baseline = self.baselines.get(&object.id());
            let changes: ColumnValues = mapper
                .fields
                .iter()
                .filter(|f| !f.primary_key && !deferred.contains(&f.name))
                .filter_map(|f| values.get(f.name).map(|v| (f.name, v.clone())))
                .filter(|(col, v)| {
                    baseline
                        .and_then(|b| b.get(col))
                        .is_none_or(|old| !old.key_eq(v))
                })
                .collect();
            if changes.is_empty() {
                continue;
            }
            rows.push((self.row_key(object)?, changes));
            written.push(object.clone());
        }
        if rows.is_empty() {
            return Ok(());
        }

        tracing::debug!(table = mapper.table, count = rows.len(), "Executing update batch");
        let counts = self.backend.update(mapper, &rows)?;
        self.check_counts(mapper.table, &counts)?;
        for (object, (_, changes)) in written.iter().zip(rows) {
            self.baselines.entry(object.id()).or_default().extend(changes);
            updated.insert(object.id());
        }
        Ok(())
    }

    /// DELETE persisted `objects`, leaf tables first.
    fn delete_objects(&mut self, objects: &[ObjectRef]) -> Result<(), FlushError> {
        let graph = self.graph();
        let doomed: Vec<ObjectRef> = objects.iter().filter(|o| !o.is_pending()).cloned().collect();
        let depth = doomed
            .iter()
            .map(|o| graph.inheritance_chain(o.entity()).len())
            .max()
            .unwrap_or(0);
        for level in (0..depth).rev() {
            for (mapper, group) in group_by_level(graph, &doomed, level) {
                let keys = group
                    .iter()
                    .map(|o| self.row_key(o))
                    .collect::<Result<Vec<_>, _>>()?;
                tracing::debug!(table = mapper.table, count = keys.len(), "Executing delete batch");
                let counts = self.backend.delete(mapper, &keys)?;
                self.check_counts(mapper.table, &counts)?;
                if level == 0 {
                    for object in &group {
                        self.report.counts(object.entity()).deleted += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// NULL out deferred references held by persisted rows that point at rows
    /// this flush deletes.
    fn clear_doomed_references(&mut self) -> Result<(), FlushError> {
        let uow = self.uow;
        let graph = self.graph();
        let doomed: Vec<(&'static str, PrimaryKey)> = uow
            .all_elements()
            .filter(|e| e.is_delete() && !e.object().is_pending())
            .filter_map(|e| Some((e.object().entity(), self.row_key(e.object()).ok()?)))
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let mut batches: Vec<(&Mapper, Vec<(ObjectRef, PrimaryKey, ColumnValues)>)> = Vec::new();
        for element in uow.all_elements() {
            let holder = element.object();
            if element.is_listonly() || holder.is_pending() {
                continue;
            }
            let Some(baseline) = self.baselines.get(&holder.id()) else {
                continue;
            };
            let demoted = uow.demoted_for(holder.id()).iter().map(|&p| uow.processor(p));
            let declared = uow
                .processors()
                .iter()
                .copied()
                .filter(|p| p.relationship().post_update);
            for processor in declared.chain(demoted) {
                if !processor.fk_nullable
                    || !processor
                        .fk_holder()
                        .is_some_and(|h| graph.is_a(holder.entity(), h))
                {
                    continue;
                }
                let columns = processor.relationship().fk_cols();
                let Some(fk) = columns
                    .iter()
                    .map(|c| baseline.get(c).filter(|v| !v.is_null()).cloned())
                    .collect::<Option<Vec<_>>>()
                else {
                    continue;
                };
                let referenced = processor.referenced_entity();
                let points_at_doomed = doomed.iter().any(|(entity, pk)| {
                    graph.is_a(entity, referenced)
                        && pk.len() == fk.len()
                        && pk.iter().zip(&fk).all(|(a, b)| a.key_eq(b))
                });
                let Some(owner) = columns.first().and_then(|c| graph.column_owner(holder.entity(), c))
                else {
                    continue;
                };
                if !points_at_doomed {
                    continue;
                }
                let clear: ColumnValues = columns.iter().map(|&c| (c, Value::Null)).collect();
                let key = self.row_key(holder)?;
                match batches.iter_mut().find(|(m, _)| m.name == owner.name) {
                    Some((_, rows)) => rows.push((holder.clone(), key, clear)),
                    None => batches.push((owner, vec![(holder.clone(), key, clear)])),
                }
            }
        }

        for (mapper, entries) in batches {
            let rows: Vec<(PrimaryKey, ColumnValues)> = entries
                .iter()
                .map(|(_, key, clear)| (key.clone(), clear.clone()))
                .collect();
            tracing::debug!(
                table = mapper.table,
                count = rows.len(),
                "Clearing references to deleted rows"
            );
            let counts = self.backend.update(mapper, &rows)?;
            self.check_counts(mapper.table, &counts)?;
            self.report.post_updates += rows.len();
            for (holder, _, clear) in entries {
                self.baselines.entry(holder.id()).or_default().extend(clear);
            }
        }
        Ok(())
    }

    /// Synchronize postponed bindings, then write deferred foreign keys.
    fn post_update(&mut self) -> Result<(), FlushError> {
        let uow = self.uow;
        let graph = self.graph();
        let postponed = std::mem::take(&mut self.postponed);
        for binding in postponed.iter().chain(uow.deferred()) {
            let processor = uow.processor(binding.processor);
            self.synchronize(&processor, binding)?;
        }

        let mut batches: Vec<(&Mapper, Vec<(ObjectRef, PrimaryKey, ColumnValues)>)> = Vec::new();
        for object in &self.saved {
            if self.deleting.contains(&object.id()) {
                continue;
            }
            let baseline = self.baselines.get(&object.id());
            for column in self.deferred_columns(object) {
                let Some(value) = object.get(column) else {
                    continue;
                };
                if baseline
                    .and_then(|b| b.get(column))
                    .is_some_and(|old| old.key_eq(&value))
                {
                    continue;
                }
                let Some(owner) = graph.column_owner(object.entity(), column) else {
                    continue;
                };
                let key = self.row_key(object)?;
                let slot = match batches.iter().position(|(m, _)| m.name == owner.name) {
                    Some(i) => i,
                    None => {
                        batches.push((owner, Vec::new()));
                        batches.len() - 1
                    }
                };
                let entries = &mut batches[slot].1;
                match entries.iter_mut().find(|(o, _, _)| o == object) {
                    Some((_, _, values)) => values.push((column, value)),
                    None => entries.push((object.clone(), key, vec![(column, value)])),
                }
            }
        }

        for (mapper, entries) in batches {
            let rows: Vec<(PrimaryKey, ColumnValues)> = entries
                .iter()
                .map(|(_, key, values)| (key.clone(), values.clone()))
                .collect();
            tracing::debug!(table = mapper.table, count = rows.len(), "Executing post-update batch");
            let counts = self.backend.update(mapper, &rows)?;
            self.check_counts(mapper.table, &counts)?;
            self.report.post_updates += rows.len();
            for (object, _, values) in entries {
                self.baselines.entry(object.id()).or_default().extend(values);
            }
        }
        Ok(())
    }
}

/// Objects whose inheritance chain reaches `level`, grouped by the mapper at
/// that level in order of first appearance.
fn group_by_level<'g>(
    graph: &'g MapperGraph,
    objects: &[ObjectRef],
    level: usize,
) -> Vec<(&'g Mapper, Vec<ObjectRef>)> {
    let mut groups: Vec<(&'g Mapper, Vec<ObjectRef>)> = Vec::new();
    for object in objects {
        let Some(&mapper) = graph.inheritance_chain(object.entity()).get(level) else {
            continue;
        };
        match groups.iter_mut().find(|(m, _)| m.name == mapper.name) {
            Some((_, group)) => group.push(object.clone()),
            None => groups.push((mapper, vec![object.clone()])),
        }
    }
    groups
}

/// Fill an unset discriminator from the object's concrete mapper.
fn set_discriminator(graph: &MapperGraph, root: &Mapper, object: &ObjectRef) {
    let Some(column) = root.polymorphic_on else {
        return;
    };
    if object.get(column).is_some_and(|v| !v.is_null()) {
        return;
    }
    if let Some(identity) = graph.get(object.entity()).and_then(|m| m.polymorphic_identity) {
        object.set(column, identity);
    }
}
