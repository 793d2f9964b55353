//! Shared fixtures for flush integration tests.

#![allow(dead_code)]

use sqlflush_core::{
    Error, FieldInfo, LinkTableInfo, Mapper, MapperGraph, RelationshipInfo, RelationshipKind,
    Result, Value,
};
use sqlflush_session::{ColumnValues, IdentityRegistry, PersistenceBackend, PrimaryKey, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

/// One backend call, as issued by the flush.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Insert {
        table: &'static str,
        rows: Vec<ColumnValues>,
    },
    Update {
        table: &'static str,
        rows: Vec<(PrimaryKey, ColumnValues)>,
    },
    Delete {
        table: &'static str,
        keys: Vec<PrimaryKey>,
    },
    InsertLinks {
        table: &'static str,
        rows: Vec<ColumnValues>,
    },
    DeleteLinks {
        table: &'static str,
        rows: Vec<ColumnValues>,
    },
}

/// Backend that records every call and hands out sequential keys per table.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Vec<Call>,
    sequences: HashMap<&'static str, i64>,
    /// 1-based call number that fails.
    fail_on: Option<usize>,
    /// Rows each UPDATE/DELETE reports as matched.
    row_count: Option<u64>,
    /// Return no generated keys from INSERT.
    keyless: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on: Some(call),
            ..Self::default()
        }
    }

    pub fn matching(rows: u64) -> Self {
        Self {
            row_count: Some(rows),
            ..Self::default()
        }
    }

    pub fn keyless() -> Self {
        Self {
            keyless: true,
            ..Self::default()
        }
    }

    fn record(&mut self, call: Call) -> Result<()> {
        self.calls.push(call);
        if self.fail_on == Some(self.calls.len()) {
            return Err(Error::Custom(format!(
                "injected failure on call {}",
                self.calls.len()
            )));
        }
        Ok(())
    }

    fn matched(&self, n: usize) -> Vec<u64> {
        vec![self.row_count.unwrap_or(1); n]
    }

    pub fn tables(&self) -> Vec<&'static str> {
        self.calls
            .iter()
            .map(|c| match c {
                Call::Insert { table, .. }
                | Call::Update { table, .. }
                | Call::Delete { table, .. }
                | Call::InsertLinks { table, .. }
                | Call::DeleteLinks { table, .. } => *table,
            })
            .collect()
    }
}

impl PersistenceBackend for RecordingBackend {
    fn insert(&mut self, mapper: &Mapper, rows: &[ColumnValues]) -> Result<Vec<PrimaryKey>> {
        self.record(Call::Insert {
            table: mapper.table,
            rows: rows.to_vec(),
        })?;
        let pk = mapper.primary_key();
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let supplied = pk.iter().all(|col| row.iter().any(|(c, _)| c == col));
            if supplied || self.keyless {
                keys.push(Vec::new());
            } else {
                let next = self.sequences.entry(mapper.table).or_insert(0);
                *next += 1;
                keys.push(vec![Value::BigInt(*next)]);
            }
        }
        Ok(keys)
    }

    fn update(&mut self, mapper: &Mapper, rows: &[(PrimaryKey, ColumnValues)]) -> Result<Vec<u64>> {
        self.record(Call::Update {
            table: mapper.table,
            rows: rows.to_vec(),
        })?;
        Ok(self.matched(rows.len()))
    }

    fn delete(&mut self, mapper: &Mapper, keys: &[PrimaryKey]) -> Result<Vec<u64>> {
        self.record(Call::Delete {
            table: mapper.table,
            keys: keys.to_vec(),
        })?;
        Ok(self.matched(keys.len()))
    }

    fn insert_links(&mut self, link: &LinkTableInfo, rows: &[ColumnValues]) -> Result<()> {
        self.record(Call::InsertLinks {
            table: link.table_name,
            rows: rows.to_vec(),
        })
    }

    fn delete_links(&mut self, link: &LinkTableInfo, rows: &[ColumnValues]) -> Result<()> {
        self.record(Call::DeleteLinks {
            table: link.table_name,
            rows: rows.to_vec(),
        })
    }
}

/// Transaction that counts how it was released.
#[derive(Debug, Default)]
pub struct RecordingTransaction {
    pub commits: usize,
    pub rollbacks: usize,
    pub fail_commit: bool,
}

impl Transaction for RecordingTransaction {
    fn commit(&mut self) -> Result<()> {
        if self.fail_commit {
            return Err(Error::Custom("commit refused".to_string()));
        }
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) {
        self.rollbacks += 1;
    }
}

pub fn big(n: i64) -> Value {
    Value::BigInt(n)
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn registry(graph: MapperGraph) -> IdentityRegistry {
    IdentityRegistry::new(Arc::new(graph))
}

/// Author 1-* Book, cascading deletes to books.
pub fn library() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Author", "authors")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .relationship(
                    RelationshipInfo::new("books", "Book", RelationshipKind::OneToMany)
                        .remote_key("author_id")
                        .cascade("all"),
                ),
        )
        .mapper(
            Mapper::new("Book", "books")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("title"))
                .field(FieldInfo::new("author_id").nullable(true)),
        )
        .build()
        .expect("library graph")
}

/// Book *-1 Author with a NOT NULL `author_id` on books.
pub fn bookshelf() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Author", "authors")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name")),
        )
        .mapper(
            Mapper::new("Book", "books")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("title"))
                .field(FieldInfo::new("author_id"))
                .relationship(
                    RelationshipInfo::new("author", "Author", RelationshipKind::ManyToOne)
                        .local_key("author_id"),
                ),
        )
        .build()
        .expect("bookshelf graph")
}

/// Self-referential Node.next; `nullable` decides whether cycles can be broken.
pub fn linked_nodes(nullable: bool) -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Node", "nodes")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .field(FieldInfo::new("next_id").nullable(nullable))
                .relationship(
                    RelationshipInfo::new("next", "Node", RelationshipKind::ManyToOne)
                        .local_key("next_id"),
                ),
        )
        .build()
        .expect("node graph")
}

/// Two entities referencing each other; only `A.b` is nullable.
pub fn mutual() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("A", "as")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("b_id").nullable(true))
                .relationship(
                    RelationshipInfo::new("b", "B", RelationshipKind::ManyToOne).local_key("b_id"),
                ),
        )
        .mapper(
            Mapper::new("B", "bs")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("a_id"))
                .relationship(
                    RelationshipInfo::new("a", "A", RelationshipKind::ManyToOne).local_key("a_id"),
                ),
        )
        .build()
        .expect("mutual graph")
}

/// Joined-table Employee <- Manager with a discriminator.
pub fn staff() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Employee", "employees")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .field(FieldInfo::new("type").nullable(true))
                .polymorphic_on("type")
                .polymorphic_identity("employee"),
        )
        .mapper(
            Mapper::new("Manager", "managers")
                .inherits("Employee")
                .polymorphic_identity("manager")
                .field(FieldInfo::new("id").primary_key(true))
                .field(FieldInfo::new("budget")),
        )
        .build()
        .expect("staff graph")
}

/// Book *-* Tag through `book_tags`.
pub fn tagging() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Book", "books")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("title"))
                .relationship(
                    RelationshipInfo::new("tags", "Tag", RelationshipKind::ManyToMany)
                        .link_table(LinkTableInfo::new("book_tags", "book_id", "tag_id")),
                ),
        )
        .mapper(
            Mapper::new("Tag", "tags")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("label")),
        )
        .build()
        .expect("tagging graph")
}

/// User 1-* Post plus User.favorite_post written as a post-update.
pub fn blog() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("User", "users")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .field(FieldInfo::new("favorite_post_id").nullable(true))
                .relationship(
                    RelationshipInfo::new("favorite_post", "Post", RelationshipKind::ManyToOne)
                        .local_key("favorite_post_id")
                        .post_update(true),
                )
                .relationship(
                    RelationshipInfo::new("posts", "Post", RelationshipKind::OneToMany)
                        .remote_key("user_id")
                        .cascade("all"),
                ),
        )
        .mapper(
            Mapper::new("Post", "posts")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("title"))
                .field(FieldInfo::new("user_id")),
        )
        .build()
        .expect("blog graph")
}

/// Parent 1-* Child with delete-orphan.
pub fn family() -> MapperGraph {
    MapperGraph::builder()
        .mapper(
            Mapper::new("Parent", "parents")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .relationship(
                    RelationshipInfo::new("children", "Child", RelationshipKind::OneToMany)
                        .remote_key("parent_id")
                        .cascade("all, delete-orphan"),
                ),
        )
        .mapper(
            Mapper::new("Child", "children")
                .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
                .field(FieldInfo::new("name"))
                .field(FieldInfo::new("parent_id").nullable(true)),
        )
        .build()
        .expect("family graph")
}
