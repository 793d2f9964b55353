//! The flush scheduler.
//!
//! [`UnitOfWork`] turns the pending objects of an [`IdentityRegistry`] into an
//! ordered sequence of backend calls and runs them in one transaction:
//!
//! 1. **Registration**: new and dirty objects are registered for save,
//!    deleted objects for delete, each into the task of its entity type.
//! 2. **Discovery**: every relationship of every registered object is
//!    preprocessed until no pass registers or changes anything.
//! 3. **Sort**: root entity tasks (and association tasks) are sorted by the
//!    edges the dependency processors declared; cyclic sets are replaced by
//!    row-level schedules.
//! 4. **Execution**: the task tree is walked depth-first (see [`crate::flush`]).
//! 5. **Completion**: after commit, written objects are marked clean and
//!    deleted objects removed from the registry.
//!
//! Any error rolls the transaction back exactly once and leaves the registry
//! untouched.

use crate::backend::{PersistenceBackend, Transaction, TransactionGuard};
use crate::change_tracker::{ChangeTracker, History};
use crate::cycles;
use crate::dependency::{DependencyProcessor, ProcessorId};
use crate::error::FlushError;
use crate::flush::{ExecutionPlan, FlushReport};
use crate::identity_map::IdentityRegistry;
use crate::object::{ObjectId, ObjectRef};
use crate::task::{
    BindingSource, Disposition, ProcessorBinding, Registration, Task, TaskElement, TaskId, TaskKey,
    TaskKind,
};
use crate::topological::{Component, TopologicalSorter};
use serde::{Deserialize, Serialize};
use sqlflush_core::{MapperGraph, RelationshipInfo};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Flush behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Fail with `Error::StaleData` when an UPDATE or DELETE does not match
    /// exactly one row.
    pub check_row_counts: bool,
    /// Upper bound on cascade discovery passes.
    pub max_discovery_passes: usize,
    /// Log the execution tree at debug level before executing it.
    pub echo_plan: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            check_row_counts: true,
            max_discovery_passes: 1000,
            echo_plan: false,
        }
    }
}

impl FlushConfig {
    /// Set row count checking.
    #[must_use]
    pub const fn check_row_counts(mut self, value: bool) -> Self {
        self.check_row_counts = value;
        self
    }

    /// Set the discovery pass bound.
    #[must_use]
    pub const fn max_discovery_passes(mut self, value: usize) -> Self {
        self.max_discovery_passes = value;
        self
    }

    /// Set plan echoing.
    #[must_use]
    pub const fn echo_plan(mut self, value: bool) -> Self {
        self.echo_plan = value;
        self
    }
}

/// Flush scheduler.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    config: FlushConfig,
}

impl UnitOfWork {
    /// Create a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler with a configuration.
    #[must_use]
    pub fn with_config(config: FlushConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Register, discover and sort without touching any backend.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan<'a>(
        &self,
        registry: &IdentityRegistry,
        tracker: &'a dyn ChangeTracker,
    ) -> Result<ExecutionPlan<'a>, FlushError> {
        let mut uow = UowTransaction::new(Arc::clone(registry.graph()), tracker);

        let saves: Vec<ObjectRef> = registry
            .new_objects()
            .into_iter()
            .chain(registry.dirty_objects())
            .collect();
        let deletes = registry.deleted_objects();
        tracing::debug!(
            saves = saves.len(),
            deletes = deletes.len(),
            "Registering pending objects"
        );
        for object in &saves {
            uow.register_object(object, Disposition::Save)?;
        }
        for object in &deletes {
            uow.register_object(object, Disposition::Delete)?;
        }

        uow.discover(self.config.max_discovery_passes)?;
        uow.sort()?;
        Ok(ExecutionPlan::new(uow))
    }

    /// Write every pending change of `registry` in one transaction.
    ///
    /// On success the transaction is committed and the registry updated; on
    /// failure the transaction is rolled back exactly once, column values
    /// changed by the attempt are restored, and the registry is untouched.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn flush(
        &self,
        registry: &mut IdentityRegistry,
        tracker: &dyn ChangeTracker,
        backend: &mut dyn PersistenceBackend,
        transaction: &mut dyn Transaction,
    ) -> Result<FlushReport, FlushError> {
        let start = Instant::now();
        let guard = TransactionGuard::new(transaction);

        let plan = match self.plan(registry, tracker) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Flush planning failed; rolling back");
                guard.rollback();
                return Err(e);
            }
        };

        if plan.is_empty() {
            guard.commit()?;
            tracing::debug!("Nothing to flush");
            return Ok(FlushReport::default());
        }
        if self.config.echo_plan {
            tracing::debug!(plan = %plan.dump(), "Execution plan");
        }

        let checkpoint = plan.checkpoint();
        let report = match plan.execute(backend, &self.config) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Flush failed; rolling back");
                checkpoint.restore();
                guard.rollback();
                return Err(e);
            }
        };
        if let Err(e) = guard.commit() {
            checkpoint.restore();
            return Err(FlushError::Backend(e));
        }

        plan.complete(registry);
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = report.inserted(),
            updated = report.updated(),
            deleted = report.deleted(),
            post_updates = report.post_updates,
            link_rows = report.link_rows,
            "Flush complete"
        );
        Ok(report)
    }
}

/// State of one flush: tasks, processors and the task-level graph.
pub(crate) struct UowTransaction<'a> {
    graph: Arc<MapperGraph>,
    tracker: &'a dyn ChangeTracker,
    tasks: Vec<Task>,
    task_index: HashMap<TaskKey, TaskId>,
    processors: Vec<DependencyProcessor>,
    processor_index: HashMap<(&'static str, &'static str), ProcessorId>,
    edges: Vec<(TaskId, TaskId)>,
    edge_set: HashSet<(TaskId, TaskId)>,
    processed: HashMap<ObjectId, HashSet<(ProcessorId, bool)>>,
    modified: bool,
    demoted: HashMap<ObjectId, Vec<ProcessorId>>,
    deferred: Vec<ProcessorBinding>,
    roots: Vec<TaskId>,
}

impl<'a> UowTransaction<'a> {
    pub(crate) fn new(graph: Arc<MapperGraph>, tracker: &'a dyn ChangeTracker) -> Self {
        Self {
            graph,
            tracker,
            tasks: Vec::new(),
            task_index: HashMap::new(),
            processors: Vec::new(),
            processor_index: HashMap::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
            processed: HashMap::new(),
            modified: false,
            demoted: HashMap::new(),
            deferred: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub(crate) fn graph(&self) -> &Arc<MapperGraph> {
        &self.graph
    }

    pub(crate) fn history(&self, object: &ObjectRef, relationship: &str) -> History {
        self.tracker.history(object, relationship)
    }

    pub(crate) fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    pub(crate) fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn processor(&self, id: ProcessorId) -> DependencyProcessor {
        self.processors[id.0]
    }

    pub(crate) fn processors(&self) -> &[DependencyProcessor] {
        &self.processors
    }

    pub(crate) fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    pub(crate) fn deferred(&self) -> &[ProcessorBinding] {
        &self.deferred
    }

    /// Processors demoted to post-update for rows held by `object`.
    pub(crate) fn demoted_for(&self, object: ObjectId) -> &[ProcessorId] {
        self.demoted.get(&object).map_or(&[], Vec::as_slice)
    }

    pub(crate) fn push_task(&mut self, key: TaskKey, kind: TaskKind) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(Task::new(id, key, kind));
        id
    }

    /// Look up or create the task of an entity, creating its ancestors'
    /// tasks and inheritance links as needed.
    pub(crate) fn get_task(&mut self, entity: &'static str) -> Result<TaskId, FlushError> {
        if let Some(&id) = self.task_index.get(&TaskKey::Entity(entity)) {
            return Ok(id);
        }
        let inherits = self
            .graph
            .get(entity)
            .ok_or(FlushError::UnknownEntity { entity })?
            .inherits;
        let parent = match inherits {
            Some(p) => Some(self.get_task(p)?),
            None => None,
        };

        let id = self.push_task(TaskKey::Entity(entity), TaskKind::Entity);
        self.task_index.insert(TaskKey::Entity(entity), id);
        if let Some(parent) = parent {
            self.tasks[id.0].parent = Some(parent);
            self.tasks[parent.0].inheriting.push(id);
        }
        tracing::trace!(entity = entity, task = id.0, "Created task");
        Ok(id)
    }

    pub(crate) fn get_association_task(
        &mut self,
        owner: &'static str,
        relationship: &'static str,
    ) -> TaskId {
        let key = TaskKey::Association {
            owner,
            relationship,
        };
        if let Some(&id) = self.task_index.get(&key) {
            return id;
        }
        let id = self.push_task(key, TaskKind::Association);
        self.task_index.insert(key, id);
        id
    }

    /// Require `before` to execute before `after`.
    pub(crate) fn add_edge(&mut self, before: TaskId, after: TaskId) {
        if self.edge_set.insert((before, after)) {
            self.edges.push((before, after));
        }
    }

    pub(crate) fn bind(&mut self, host: TaskId, binding: ProcessorBinding) {
        self.tasks[host.0].dependencies.push(binding);
    }

    pub(crate) fn demote(&mut self, holder: ObjectId, processor: ProcessorId) {
        let list = self.demoted.entry(holder).or_default();
        if !list.contains(&processor) {
            list.push(processor);
        }
    }

    pub(crate) fn defer(&mut self, binding: ProcessorBinding) {
        self.deferred.push(binding);
    }

    /// Register `object` into its entity task.
    pub(crate) fn register_object(
        &mut self,
        object: &ObjectRef,
        disposition: Disposition,
    ) -> Result<Registration, FlushError> {
        let task = self.get_task(object.entity())?;
        match self.tasks[task.0].register(object, disposition) {
            Ok(Registration::Unchanged) => Ok(Registration::Unchanged),
            Ok(Registration::Added) => {
                self.modified = true;
                tracing::trace!(object = ?object, disposition = %disposition, "Registered object");
                Ok(Registration::Added)
            }
            Ok(Registration::Flipped) => {
                self.modified = true;
                self.processed.remove(&object.id());
                tracing::trace!(object = ?object, disposition = %disposition, "Element flags changed");
                Ok(Registration::Flipped)
            }
            Err(existing) => Err(FlushError::ConflictingDisposition {
                entity: object.entity(),
                object: object.id(),
                existing,
                requested: disposition,
            }),
        }
    }

    /// Look up or create the processor of a relationship, registering its
    /// dependencies on creation.
    fn processor_for(
        &mut self,
        owner: &'static str,
        relationship: RelationshipInfo,
    ) -> Result<ProcessorId, FlushError> {
        if let Some(&id) = self.processor_index.get(&(owner, relationship.name)) {
            return Ok(id);
        }
        let id = ProcessorId(self.processors.len());
        let processor = DependencyProcessor::new(id, owner, relationship, &self.graph)?;
        self.processors.push(processor);
        self.processor_index.insert((owner, relationship.name), id);
        processor.register_dependencies(self)?;
        Ok(id)
    }

    /// Current `(listonly, isdelete)` of an object's element.
    fn element_flags(&self, object: &ObjectRef) -> Option<(bool, bool)> {
        let id = *self.task_index.get(&TaskKey::Entity(object.entity()))?;
        self.tasks[id.0].element(object.id()).map(TaskElement::flags)
    }

    /// Run every processor over every registered object until nothing changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn discover(&mut self, max_passes: usize) -> Result<(), FlushError> {
        let mut passes = 0;
        loop {
            if passes == max_passes {
                return Err(FlushError::DiscoveryLimitExceeded { passes });
            }
            passes += 1;
            self.modified = false;

            let work: Vec<ObjectRef> = self
                .tasks
                .iter()
                .filter(|t| t.kind == TaskKind::Entity)
                .flat_map(|t| t.elements().filter(|e| !e.is_listonly()))
                .map(|e| e.object().clone())
                .collect();

            for object in &work {
                let relationships: Vec<(&'static str, RelationshipInfo)> = self
                    .graph
                    .relationships_of(object.entity())
                    .into_iter()
                    .map(|(owner, rel)| (owner, *rel))
                    .collect();
                for (owner, rel) in relationships {
                    let pid = self.processor_for(owner, rel)?;
                    let Some((listonly, isdelete)) = self.element_flags(object) else {
                        continue;
                    };
                    if listonly {
                        continue;
                    }
                    if !self
                        .processed
                        .entry(object.id())
                        .or_default()
                        .insert((pid, isdelete))
                    {
                        continue;
                    }
                    let processor = self.processors[pid.0];
                    processor.preprocess(self, object, isdelete)?;
                }
            }

            tracing::debug!(
                pass = passes,
                objects = work.len(),
                modified = self.modified,
                "Discovery pass"
            );
            if !self.modified {
                return Ok(());
            }
        }
    }

    fn root_task(&self, mut id: TaskId) -> TaskId {
        while let Some(parent) = self.tasks[id.0].parent {
            id = parent;
        }
        id
    }

    /// Sort root tasks into the execution tree, breaking cycles.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn sort(&mut self) -> Result<(), FlushError> {
        let nodes: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| {
                (t.kind == TaskKind::Entity && t.parent.is_none()) || t.kind == TaskKind::Association
            })
            .map(|t| t.id)
            .collect();
        let mut sorter = TopologicalSorter::new(nodes);
        for &(before, after) in &self.edges {
            sorter.add_edge(self.root_task(before), self.root_task(after));
        }
        let result = sorter.sort();
        tracing::debug!(
            components = result.components().len(),
            cycles = result.cycles().len(),
            "Sorted tasks"
        );

        // Where children of each component attach.
        let mut attach = Vec::with_capacity(result.components().len());
        for (pos, component) in result.components().iter().enumerate() {
            let (node, attach_point) = match component {
                Component::Single(t) => (*t, *t),
                Component::Cycle(members) => {
                    let substitute = cycles::break_cycle(self, members)?;
                    (members[0], substitute)
                }
            };
            attach.push(attach_point);
            match result.parent(pos) {
                Some(parent) => self.tasks[attach[parent].0].child_tasks.push(node),
                None => self.roots.push(node),
            }
        }
        Ok(())
    }

    /// Elements of `task` and all its inheriting tasks, in creation order.
    pub(crate) fn polymorphic_elements(&self, task: TaskId) -> Vec<&TaskElement> {
        let mut elements = Vec::new();
        let mut stack = vec![task];
        while let Some(t) = stack.pop() {
            let task = &self.tasks[t.0];
            elements.extend(task.elements());
            stack.extend(task.inheriting.iter().copied());
        }
        elements.sort_by_key(|e| e.object().id());
        elements
    }

    /// Objects a binding processes.
    pub(crate) fn binding_objects(&self, binding: &ProcessorBinding) -> Vec<ObjectRef> {
        match &binding.source {
            BindingSource::Task(task) => self
                .polymorphic_elements(*task)
                .into_iter()
                .filter(|e| e.is_delete() == binding.delete)
                .map(|e| e.object().clone())
                .collect(),
            BindingSource::Objects(objects) => objects.clone(),
        }
    }

    /// Every element of every entity task.
    pub(crate) fn all_elements(&self) -> impl Iterator<Item = &TaskElement> {
        self.tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Entity)
            .flat_map(Task::elements)
    }
}
