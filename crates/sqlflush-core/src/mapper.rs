//! Entity-type descriptors and the mapper graph.
//!
//! A [`Mapper`] describes one entity type: its table, its columns, its
//! relationships and, for joined-table inheritance, the entity it inherits
//! from. A [`MapperGraph`] is the validated, immutable set of all mappers that
//! a flush consults; it is built once through [`MapperGraphBuilder`] and shared
//! by every flush.

use crate::error::{Error, Result};
use crate::field::FieldInfo;
use crate::relationship::{RelationshipInfo, RelationshipKind};
use std::collections::{HashMap, HashSet};

/// Static descriptor of one entity type.
#[derive(Debug, Clone)]
pub struct Mapper {
    /// Entity name, unique within a graph.
    pub name: &'static str,
    /// Table holding this entity's own columns.
    pub table: &'static str,
    /// Columns of `table`. Subtypes repeat their root's primary key columns.
    pub fields: Vec<FieldInfo>,
    /// The entity this one inherits from (joined-table inheritance).
    pub inherits: Option<&'static str>,
    /// Discriminator column, declared on the root of a hierarchy.
    pub polymorphic_on: Option<&'static str>,
    /// Value written to the discriminator column for this entity.
    pub polymorphic_identity: Option<&'static str>,
    /// Relationships declared on this entity.
    pub relationships: Vec<RelationshipInfo>,
}

impl Mapper {
    /// Create a mapper with no columns or relationships.
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            fields: Vec::new(),
            inherits: None,
            polymorphic_on: None,
            polymorphic_identity: None,
            relationships: Vec::new(),
        }
    }

    /// Add a column.
    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a relationship.
    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Inherit from another entity.
    #[must_use]
    pub fn inherits(mut self, parent: &'static str) -> Self {
        self.inherits = Some(parent);
        self
    }

    /// Declare the discriminator column.
    #[must_use]
    pub fn polymorphic_on(mut self, column: &'static str) -> Self {
        self.polymorphic_on = Some(column);
        self
    }

    /// Declare the discriminator value for this entity.
    #[must_use]
    pub fn polymorphic_identity(mut self, identity: &'static str) -> Self {
        self.polymorphic_identity = Some(identity);
        self
    }

    /// Primary key column names of this table, in declaration order.
    pub fn primary_key(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name)
            .collect()
    }

    /// Look up a column of this table.
    pub fn column(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether this table declares the column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Look up a relationship declared directly on this mapper.
    pub fn relationship_named(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Validated, immutable set of mappers.
#[derive(Debug, Clone)]
pub struct MapperGraph {
    mappers: Vec<Mapper>,
    index: HashMap<&'static str, usize>,
}

impl MapperGraph {
    /// Start building a graph.
    pub fn builder() -> MapperGraphBuilder {
        MapperGraphBuilder::default()
    }

    /// Look up a mapper by entity name.
    pub fn get(&self, entity: &str) -> Option<&Mapper> {
        self.index.get(entity).map(|&i| &self.mappers[i])
    }

    /// Whether the graph knows this entity.
    pub fn contains(&self, entity: &str) -> bool {
        self.index.contains_key(entity)
    }

    /// All mappers, in declaration order.
    pub fn mappers(&self) -> impl Iterator<Item = &Mapper> {
        self.mappers.iter()
    }

    /// Declaration position of an entity, used as a stable tie-breaker.
    pub fn position(&self, entity: &str) -> Option<usize> {
        self.index.get(entity).copied()
    }

    /// The root of the entity's inheritance hierarchy (itself if it has no parent).
    ///
    /// Unknown entities are their own root.
    pub fn root_of(&self, entity: &'static str) -> &'static str {
        let mut current = entity;
        while let Some(parent) = self.get(current).and_then(|m| m.inherits) {
            current = parent;
        }
        current
    }

    /// Mappers from the root down to `entity` (inclusive).
    pub fn inheritance_chain(&self, entity: &str) -> Vec<&Mapper> {
        let mut chain = Vec::new();
        let mut current = self.get(entity);
        while let Some(mapper) = current {
            chain.push(mapper);
            current = mapper.inherits.and_then(|p| self.get(p));
        }
        chain.reverse();
        chain
    }

    /// Whether `entity` is `ancestor` or inherits from it.
    pub fn is_a(&self, entity: &str, ancestor: &str) -> bool {
        self.inheritance_chain(entity)
            .iter()
            .any(|m| m.name == ancestor)
    }

    /// Entities that inherit directly from `entity`, in declaration order.
    pub fn direct_subtypes(&self, entity: &str) -> Vec<&'static str> {
        self.mappers
            .iter()
            .filter(|m| m.inherits == Some(entity))
            .map(|m| m.name)
            .collect()
    }

    /// Primary key columns of the entity's root table.
    pub fn primary_key(&self, entity: &str) -> Vec<&'static str> {
        self.inheritance_chain(entity)
            .first()
            .map(|root| root.primary_key())
            .unwrap_or_default()
    }

    /// Find the mapper in the entity's chain whose table declares `column`.
    pub fn column_owner(&self, entity: &str, column: &str) -> Option<&Mapper> {
        self.inheritance_chain(entity)
            .into_iter()
            .find(|m| m.has_column(column))
    }

    /// Whether the column is nullable anywhere it is declared in the chain.
    pub fn is_nullable(&self, entity: &str, column: &str) -> bool {
        self.column_owner(entity, column)
            .and_then(|m| m.column(column))
            .is_some_and(|f| f.nullable)
    }

    /// Relationships that apply to `entity`, including those declared on its
    /// ancestors, paired with the entity that declared them. Root first.
    pub fn relationships_of(&self, entity: &str) -> Vec<(&'static str, &RelationshipInfo)> {
        self.inheritance_chain(entity)
            .into_iter()
            .flat_map(|m| m.relationships.iter().map(move |r| (m.name, r)))
            .collect()
    }

    /// Look up a relationship on `entity` or one of its ancestors.
    pub fn relationship(
        &self,
        entity: &str,
        name: &str,
    ) -> Option<(&'static str, &RelationshipInfo)> {
        self.relationships_of(entity)
            .into_iter()
            .find(|(_, r)| r.name == name)
    }

    /// The entity whose rows hold the foreign key of a relationship declared
    /// on `owner`. `None` for many-to-many.
    pub fn fk_holder(&self, owner: &'static str, rel: &RelationshipInfo) -> Option<&'static str> {
        match rel.kind {
            RelationshipKind::ManyToOne => Some(owner),
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => Some(rel.target),
            RelationshipKind::ManyToMany => None,
        }
    }

    /// Whether every foreign key column of the relationship is nullable.
    pub fn fk_nullable(&self, owner: &'static str, rel: &RelationshipInfo) -> bool {
        match self.fk_holder(owner, rel) {
            Some(holder) => rel
                .fk_cols()
                .iter()
                .all(|col| self.is_nullable(holder, col)),
            None => false,
        }
    }
}

/// Collects mappers and validates them into a [`MapperGraph`].
#[derive(Debug, Default)]
pub struct MapperGraphBuilder {
    mappers: Vec<Mapper>,
}

impl MapperGraphBuilder {
    /// Add a mapper.
    #[must_use]
    pub fn mapper(mut self, mapper: Mapper) -> Self {
        self.mappers.push(mapper);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<MapperGraph> {
        let mut index = HashMap::new();
        for (i, mapper) in self.mappers.iter().enumerate() {
            if index.insert(mapper.name, i).is_some() {
                return Err(Error::config(format!(
                    "duplicate entity '{}'",
                    mapper.name
                )));
            }
        }
        let graph = MapperGraph {
            mappers: self.mappers,
            index,
        };

        for mapper in &graph.mappers {
            validate_inheritance(&graph, mapper)?;
        }
        for mapper in &graph.mappers {
            for rel in &mapper.relationships {
                validate_relationship(&graph, mapper, rel)?;
            }
        }

        tracing::debug!(mappers = graph.mappers.len(), "Mapper graph built");
        Ok(graph)
    }
}

fn validate_inheritance(graph: &MapperGraph, mapper: &Mapper) -> Result<()> {
    let mut seen = HashSet::new();
    seen.insert(mapper.name);
    let mut current = mapper;
    while let Some(parent_name) = current.inherits {
        let Some(parent) = graph.get(parent_name) else {
            return Err(Error::config(format!(
                "entity '{}' inherits from unknown entity '{}'",
                current.name, parent_name
            )));
        };
        if !seen.insert(parent.name) {
            return Err(Error::config(format!(
                "inheritance cycle through entity '{}'",
                mapper.name
            )));
        }
        current = parent;
    }

    let root = current;
    let root_pk = root.primary_key();
    if root_pk.is_empty() {
        return Err(Error::config(format!(
            "entity '{}' has no primary key",
            root.name
        )));
    }
    if mapper.inherits.is_some() && mapper.primary_key() != root_pk {
        return Err(Error::config(format!(
            "entity '{}' must repeat primary key columns {:?} of '{}'",
            mapper.name, root_pk, root.name
        )));
    }
    if let Some(col) = mapper.polymorphic_on {
        if mapper.inherits.is_some() || !mapper.has_column(col) {
            return Err(Error::config(format!(
                "discriminator '{}' must be a column of root entity '{}'",
                col, root.name
            )));
        }
    }
    Ok(())
}

fn validate_relationship(graph: &MapperGraph, owner: &Mapper, rel: &RelationshipInfo) -> Result<()> {
    let where_ = format!("relationship '{}.{}'", owner.name, rel.name);
    if !graph.contains(rel.target) {
        return Err(Error::config(format!(
            "{} targets unknown entity '{}'",
            where_, rel.target
        )));
    }
    rel.cascade_options()
        .map_err(|e| Error::config(format!("{}: {}", where_, e)))?;

    let (holder, referenced) = match rel.kind {
        RelationshipKind::ManyToMany => {
            let Some(link) = rel.link_table else {
                return Err(Error::config(format!("{} has no link table", where_)));
            };
            let owner_pk = graph.primary_key(owner.name);
            let target_pk = graph.primary_key(rel.target);
            if link.local_cols().len() != owner_pk.len()
                || link.remote_cols().len() != target_pk.len()
            {
                return Err(Error::config(format!(
                    "{}: link table '{}' key columns do not match the primary keys",
                    where_, link.table_name
                )));
            }
            return Ok(());
        }
        RelationshipKind::ManyToOne => (owner.name, rel.target),
        RelationshipKind::OneToMany | RelationshipKind::OneToOne => (rel.target, owner.name),
    };

    let cols = rel.fk_cols();
    if cols.is_empty() {
        return Err(Error::config(format!("{} has no foreign key columns", where_)));
    }
    for col in cols {
        if graph.column_owner(holder, col).is_none() {
            return Err(Error::config(format!(
                "{}: foreign key column '{}' is not declared on '{}'",
                where_, col, holder
            )));
        }
    }
    let referenced_pk = graph.primary_key(referenced);
    if referenced_pk.len() != cols.len() {
        return Err(Error::config(format!(
            "{}: {} foreign key column(s) for {} primary key column(s) of '{}'",
            where_,
            cols.len(),
            referenced_pk.len(),
            referenced
        )));
    }
    Ok(())
}
